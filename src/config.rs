//! Engine configuration: the salt and default per-table feature toggles
//! loaded from the environment at startup (§6 "Environment", §4.2).
//!
//! Mirrors `.env`-file loading via [`dotenvy`], the same mechanism used for
//! local configuration in the pack this crate's dependency stack is drawn
//! from. `INIBASE_SECRET` is required; if it is absent from both the
//! process environment and an on-disk `.env`, a fresh salt is generated and
//! appended to `.env` so subsequent runs reuse it (decoding previously
//! issued opaque ids would otherwise silently break).

use crate::crypto::{self, SALT_LEN};
use crate::error::{io_at, InibaseError, Result};
use std::path::{Path, PathBuf};

/// Join recursion is capped independently of `.env` — it guards against
/// pathological schemas, not a deployment knob, so it isn't read from the
/// environment.
pub const DEFAULT_JOIN_DEPTH_CAP: u32 = 5;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub salt: [u8; SALT_LEN],
    pub compression: bool,
    pub cache: bool,
    pub prepend: bool,
    pub join_depth_cap: u32,
}

fn parse_bool_env(name: &str) -> bool {
    std::env::var(name).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes")).unwrap_or(false)
}

impl EngineConfig {
    /// Load `.env` at `database_root/.env` (creating it with a generated
    /// secret if missing), then read `INIBASE_SECRET`/`INIBASE_COMPRESSION`/
    /// `INIBASE_CACHE`/`INIBASE_PREPEND`.
    pub fn load(database_root: &Path) -> Result<Self> {
        let env_path = database_root.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).map_err(|e| InibaseError::NoEnv(e.to_string()))?;
        }

        let salt = match std::env::var("INIBASE_SECRET") {
            Ok(hex_secret) => parse_salt(&hex_secret)?,
            Err(_) => {
                let generated = crypto::generate_salt();
                append_generated_secret(&env_path, &generated)?;
                std::env::set_var("INIBASE_SECRET", hex::encode(generated));
                generated
            }
        };

        Ok(EngineConfig {
            salt,
            compression: parse_bool_env("INIBASE_COMPRESSION"),
            cache: parse_bool_env("INIBASE_CACHE"),
            prepend: parse_bool_env("INIBASE_PREPEND"),
            join_depth_cap: DEFAULT_JOIN_DEPTH_CAP,
        })
    }
}

fn parse_salt(hex_secret: &str) -> Result<[u8; SALT_LEN]> {
    let bytes = hex::decode(hex_secret).map_err(|_| InibaseError::NoEnv("INIBASE_SECRET is not valid hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| InibaseError::NoEnv(format!("INIBASE_SECRET must decode to {SALT_LEN} bytes")))
}

fn append_generated_secret(env_path: &Path, salt: &[u8; SALT_LEN]) -> Result<()> {
    if let Some(parent) = env_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_at(parent.to_path_buf(), e))?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(env_path)
        .map_err(|e| io_at(env_path.to_path_buf(), e))?;
    writeln!(file, "INIBASE_SECRET={}", hex::encode(salt)).map_err(|e| io_at(env_path.to_path_buf(), e))?;
    tracing::info!(path = %env_path.display(), "generated INIBASE_SECRET and appended it to .env");
    Ok(())
}

pub fn default_env_path(database_root: &Path) -> PathBuf {
    database_root.join(".env")
}

/// Per-table feature toggles (§3's `.compression.config` / `.cache.config`
/// / `.prepend.config` markers). Defaults come from [`EngineConfig`]'s
/// environment-sourced values at table-creation time; from then on each
/// table's own markers are authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableConfig {
    pub compression: bool,
    pub cache: bool,
    pub prepend: bool,
}

impl TableConfig {
    pub fn from_defaults(engine: &EngineConfig) -> Self {
        TableConfig {
            compression: engine.compression,
            cache: engine.cache,
            prepend: engine.prepend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // INIBASE_SECRET is process-wide state; serialize tests that touch it
    // so they don't race under cargo's default parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn load_generates_and_persists_a_secret_when_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("INIBASE_SECRET");

        let config = EngineConfig::load(dir.path()).unwrap();
        let env_contents = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env_contents.contains("INIBASE_SECRET="));
        assert_eq!(config.salt.len(), SALT_LEN);

        std::env::remove_var("INIBASE_SECRET");
    }

    #[test]
    fn load_reuses_an_existing_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let salt = [5u8; SALT_LEN];
        std::fs::write(dir.path().join(".env"), format!("INIBASE_SECRET={}\n", hex::encode(salt))).unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.salt, salt);
        std::env::remove_var("INIBASE_SECRET");
    }
}
