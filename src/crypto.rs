//! Cryptographic primitives backing opaque record ids and password storage
//! (§4.2).
//!
//! Every id and `table`-typed reference is encrypted with AES-256-CBC under
//! a single process-wide salt (see [`crate::config::EngineConfig`]) so
//! clients never see raw integer ids. Passwords are hashed with scrypt and
//! a fresh 16-byte salt per call, compared in constant time.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use scrypt::Params;
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const SALT_LEN: usize = 32;

/// scrypt parameters for password hashing: N=2^14, r=8, p=1, 64-byte output.
fn password_params() -> Params {
    Params::new(14, 8, 1, 64).expect("fixed scrypt params are always valid")
}

/// `encode(n) = hex(AES-256-CBC(utf8(str(n)), salt, iv=salt[0..16]))`
pub fn encode_id(id: u64, salt: &[u8; SALT_LEN]) -> String {
    let plain = id.to_string().into_bytes();
    let cipher = Aes256CbcEnc::new(salt.into(), salt[..16].into());
    let ct = cipher.encrypt_padded_vec_mut::<Pkcs7>(&plain);
    hex::encode(ct)
}

/// `decode(hex) = int(utf8(plain))`, or `None` for malformed input.
pub fn decode_id(hex_str: &str, salt: &[u8; SALT_LEN]) -> Option<u64> {
    let ct = hex::decode(hex_str).ok()?;
    if ct.is_empty() || ct.len() % 16 != 0 {
        return None;
    }
    let cipher = Aes256CbcDec::new(salt.into(), salt[..16].into());
    let pt = cipher.decrypt_padded_vec_mut::<Pkcs7>(&ct).ok()?;
    let s = String::from_utf8(pt).ok()?;
    s.parse::<u64>().ok()
}

/// Whether `s` decrypts under `salt` to some non-negative integer.
pub fn is_valid_opaque_id(s: &str, salt: &[u8; SALT_LEN]) -> bool {
    decode_id(s, salt).is_some()
}

/// `hash(pw) = hex(scrypt(pw, salt16, 64)) || "." || hex(salt16)`.
/// Fresh salt per call, so hashing the same password twice yields two
/// different strings.
pub fn hash_password(password: &str) -> String {
    let mut salt16 = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt16);
    let mut out = [0u8; 64];
    scrypt::scrypt(password.as_bytes(), &salt16, &password_params(), &mut out)
        .expect("fixed-size scrypt output always succeeds");
    format!("{}.{}", hex::encode(out), hex::encode(salt16))
}

/// Re-derive the hash from `password` using the salt embedded in `hash`,
/// then compare in constant time.
pub fn verify_password(hash: &str, password: &str) -> bool {
    let Some((hex_hash, hex_salt)) = hash.split_once('.') else {
        return false;
    };
    let Ok(salt16) = hex::decode(hex_salt) else {
        return false;
    };
    let mut out = vec![0u8; 64];
    if scrypt::scrypt(password.as_bytes(), &salt16, &password_params(), &mut out).is_err() {
        return false;
    }
    let computed = hex::encode(out);
    computed.as_bytes().ct_eq(hex_hash.as_bytes()).into()
}

/// Fallback salt generation when `INIBASE_SECRET` is absent:
/// `scrypt(randomBytes(16), randomBytes(16), 32)`.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut password = [0u8; 16];
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut password);
    rand::thread_rng().fill_bytes(&mut salt);
    let params = Params::new(14, 8, 1, SALT_LEN).expect("fixed scrypt params are always valid");
    let mut out = [0u8; SALT_LEN];
    scrypt::scrypt(&password, &salt, &params, &mut out).expect("fixed-size scrypt output always succeeds");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_for_many_values() {
        let salt = generate_salt();
        for n in [0u64, 1, 42, 1_000_000, u32::MAX as u64] {
            let encoded = encode_id(n, &salt);
            assert_eq!(encoded.len(), 32, "opaque id should be 32 hex chars for a 16-byte block");
            assert_eq!(decode_id(&encoded, &salt), Some(n));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let salt = generate_salt();
        assert_eq!(decode_id("not-hex-at-all", &salt), None);
        assert!(!is_valid_opaque_id("deadbeef", &salt));
    }

    #[test]
    fn password_hash_verifies_and_salts_freshly() {
        let h1 = hash_password("correct horse");
        let h2 = hash_password("correct horse");
        assert_ne!(h1, h2, "fresh salt per call");
        assert!(verify_password(&h1, "correct horse"));
        assert!(verify_password(&h2, "correct horse"));
        assert!(!verify_password(&h1, "wrong horse"));
    }
}
