//! The public async facade (§4, §6).
//!
//! [`Engine`] is a handle to a database root directory: its own
//! [`EngineConfig`] (loaded once from `.env`/the process environment) and a
//! `parking_lot::RwLock`-guarded schema cache keyed by table name, so a hot
//! `get`/`post` loop doesn't re-read and re-parse `schema.json` on every
//! call. Every public method is `async fn`; the actual work is synchronous
//! `std::fs` I/O (see [`crate::file_engine`]'s module doc) dispatched onto
//! `tokio::task::spawn_blocking` so it never stalls the async runtime.

use crate::assembler;
use crate::config::{EngineConfig, TableConfig};
use crate::criteria::Criteria;
use crate::error::{InibaseError, Result};
use crate::file_engine::{self, LineSelector};
use crate::mutation;
use crate::query::{Options, Where};
use crate::schema::{self, Schema};
use crate::table;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-memory per-table schema cache. Invalidated whenever a table's
/// `schema.json` changes (`createTable`/`updateTable`/`deleteTable`).
#[derive(Default)]
struct SchemaCache {
    by_table: HashMap<String, Schema>,
}

#[derive(Clone)]
pub struct Engine {
    root: PathBuf,
    config: Arc<EngineConfig>,
    cache: Arc<RwLock<SchemaCache>>,
}

impl Engine {
    /// Open (or create) a database rooted at `root`, loading `.env` from it
    /// per [`EngineConfig::load`].
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root_for_blocking = root.clone();
        let config = tokio::task::spawn_blocking(move || EngineConfig::load(&root_for_blocking))
            .await
            .expect("engine config load task panicked")?;

        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| crate::error::io_at(root.clone(), e))?;
        }

        Ok(Engine {
            root,
            config: Arc::new(config),
            cache: Arc::new(RwLock::new(SchemaCache::default())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn table_dir(&self, table_name: &str) -> PathBuf {
        self.root.join(table_name)
    }

    /// `getTable(name) -> { schema, config }` — the table's current schema
    /// and its feature-toggle config, read fresh from disk (bypassing the
    /// schema cache, since callers asking for this usually want to inspect
    /// the config too).
    pub async fn get_table(&self, name: &str) -> Result<(Schema, TableConfig)> {
        let table_dir = self.table_dir(name);
        let salt = self.config.salt;
        if !table_dir.exists() {
            return Err(InibaseError::TableNotExists { name: name.to_string() });
        }
        tokio::task::spawn_blocking(move || -> Result<(Schema, TableConfig)> {
            let schema = table::read_schema(&table_dir, &salt)?;
            let config = table::read_config(&table_dir);
            Ok((schema, config))
        })
        .await
        .expect("get_table task panicked")
    }

    fn schema_for(&self, table_name: &str) -> Result<Schema> {
        if let Some(schema) = self.cache.read().by_table.get(table_name) {
            return Ok(schema.clone());
        }
        let schema = table::read_schema(&self.table_dir(table_name), &self.config.salt)?;
        self.cache.write().by_table.insert(table_name.to_string(), schema.clone());
        Ok(schema)
    }

    /// Drop every cached schema, forcing the next access on any table to
    /// re-read `schema.json` from disk (`clearCache`, §4.8).
    pub async fn clear_cache(&self) {
        self.cache.write().by_table.clear();
    }

    /// `createTable(name, fields)` — assign field ids, write `schema.json`
    /// and the feature-toggle markers (seeded from this engine's
    /// environment defaults), create the pagination marker.
    pub async fn create_table(&self, name: &str, fields: Schema) -> Result<()> {
        let mut next_id = 1u32;
        let full_schema = schema::with_implicit_fields(fields, &mut next_id);
        let table_dir = self.table_dir(name);
        let config = TableConfig::from_defaults(&self.config);
        let salt = self.config.salt;

        tokio::task::spawn_blocking(move || table::create(&table_dir, &full_schema, config, &salt))
            .await
            .expect("create_table task panicked")?;

        self.cache.write().by_table.remove(name);
        Ok(())
    }

    /// `updateTable(name, { schema?, name?, compression?, cache?, prepend? })`.
    /// A field-schema change renames existing column files per the diff
    /// ([`schema::diff_schema`]); a feature-toggle change that touches
    /// compression or prepend rewrites the table atomically
    /// ([`table::toggle_storage_layout`]); a bare rename just moves the
    /// directory. All three may be combined in one call.
    pub async fn update_table(
        &self,
        name: &str,
        new_schema: Option<Schema>,
        new_name: Option<String>,
        compression: Option<bool>,
        cache: Option<bool>,
        prepend: Option<bool>,
    ) -> Result<()> {
        let table_dir = self.table_dir(name);
        let salt = self.config.salt;
        let old_schema = self.schema_for(name)?;
        let old_config = table::read_config(&table_dir);
        let compressed = old_config.compression;

        let next_high_water = table::read_schema_marker(&table_dir)?;

        let (effective_schema, rename_plans) = match new_schema {
            Some(mut incoming) => {
                let mut next = next_high_water;
                schema::add_ids(&mut incoming, next_high_water);
                let full = schema::with_implicit_fields(
                    incoming.into_iter().filter(|f| !matches!(f.key.as_str(), "id" | "createdAt" | "updatedAt")).collect(),
                    &mut next,
                );
                let plans = schema::diff_schema(&old_schema, &full);
                (full, plans)
            }
            None => (old_schema, Vec::new()),
        };

        let new_config = TableConfig {
            compression: compression.unwrap_or(old_config.compression),
            cache: cache.unwrap_or(old_config.cache),
            prepend: prepend.unwrap_or(old_config.prepend),
        };

        {
            let table_dir = table_dir.clone();
            let effective_schema = effective_schema.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                if !rename_plans.is_empty() {
                    table::apply_rename_plan(&table_dir, &rename_plans, compressed)?;
                }
                table::write_schema(&table_dir, &effective_schema, &salt)?;
                let highest = schema::flatten(&effective_schema).iter().map(|(_, f)| f.id).max().unwrap_or(0);
                table::write_schema_marker(&table_dir, highest)?;
                table::toggle_storage_layout(&table_dir, &effective_schema, old_config, new_config)?;
                Ok(())
            })
            .await
            .expect("update_table task panicked")?;
        }

        if let Some(new_name) = new_name {
            let new_dir = self.table_dir(&new_name);
            let table_dir = table_dir.clone();
            tokio::task::spawn_blocking(move || table::rename_table_dir(&table_dir, &new_dir))
                .await
                .expect("rename_table_dir task panicked")?;
            self.cache.write().by_table.remove(name);
        } else {
            self.cache.write().by_table.insert(name.to_string(), effective_schema);
        }
        Ok(())
    }

    /// `deleteTable(name)` — remove the whole table directory.
    pub async fn delete_table(&self, name: &str) -> Result<()> {
        let table_dir = self.table_dir(name);
        if !table_dir.exists() {
            return Err(InibaseError::TableNotExists { name: name.to_string() });
        }
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&table_dir).map_err(|e| crate::error::io_at(table_dir, e)))
            .await
            .expect("delete_table task panicked")?;
        self.cache.write().by_table.remove(name);
        Ok(())
    }

    /// `get(table, where?, options, onlyOne?, onlyLines?)` (§4.7).
    pub async fn get(
        &self,
        table: &str,
        where_: Option<Where>,
        options: Options,
        only_one: bool,
        only_line_numbers: bool,
    ) -> Result<(Option<Value>, Option<assembler::PageInfo>)> {
        let engine = self.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || assembler::get(&engine, &table, where_.as_ref(), &options, only_one, only_line_numbers))
            .await
            .expect("get task panicked")
    }

    /// `post(table, data[])` — insert one or more records, returning their
    /// newly assigned opaque ids.
    pub async fn post(&self, table_name: &str, records: Vec<Value>) -> Result<Vec<String>> {
        let schema = self.schema_for(table_name)?;
        let table_dir = self.table_dir(table_name);
        let table_config = table::read_config(&table_dir);
        let salt = self.config.salt;

        let ids = tokio::task::spawn_blocking(move || mutation::post(&table_dir, &schema, table_config.compression, table_config.prepend, &salt, records))
            .await
            .expect("post task panicked")?;

        Ok(ids.into_iter().map(|id| crate::crypto::encode_id(id, &salt)).collect())
    }

    /// `put(table, data, where)` — `where` must be spelled out explicitly
    /// (see [`Where::All`]'s doc comment); resolves to line numbers, then
    /// replaces the supplied fields in place.
    pub async fn put(&self, table_name: &str, patch: Value, where_: Where) -> Result<()> {
        let schema = self.schema_for(table_name)?;
        let table_dir = self.table_dir(table_name);
        let table_config = table::read_config(&table_dir);
        let salt = self.config.salt;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let lines = mutation::resolve_mutation_target(&table_dir, &schema, table_config.compression, &salt, &where_)?;
            let mut ordered: Vec<u64> = lines.into_iter().collect();
            ordered.sort_unstable();
            mutation::put(&table_dir, &schema, table_config.compression, &salt, &ordered, &patch)
        })
        .await
        .expect("put task panicked")
    }

    /// `delete(table, where?)` — `where_` of [`None`] is the single point
    /// where "delete everything" is reachable without constructing
    /// [`Where::All`], matching the original's no-argument `delete` call.
    pub async fn delete(&self, table_name: &str, where_: Option<Where>) -> Result<()> {
        let schema = self.schema_for(table_name)?;
        let table_dir = self.table_dir(table_name);
        let table_config = table::read_config(&table_dir);
        let salt = self.config.salt;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let lines = match where_ {
                Some(w) => mutation::resolve_mutation_target(&table_dir, &schema, table_config.compression, &salt, &w)?,
                None => mutation::resolve_mutation_target(&table_dir, &schema, table_config.compression, &salt, &Where::All)?,
            };
            mutation::delete(&table_dir, &schema, table_config.compression, &lines)
        })
        .await
        .expect("delete task panicked")
    }

    /// `sum`/`max`/`min(table, column, where?)` (§4.6).
    pub async fn sum(&self, table_name: &str, column: &str, where_: Option<Where>) -> Result<f64> {
        self.aggregate(table_name, column, where_, file_engine::sum).await
    }

    pub async fn max(&self, table_name: &str, column: &str, where_: Option<Where>) -> Result<Option<f64>> {
        self.aggregate(table_name, column, where_, file_engine::max).await
    }

    pub async fn min(&self, table_name: &str, column: &str, where_: Option<Where>) -> Result<Option<f64>> {
        self.aggregate(table_name, column, where_, file_engine::min).await
    }

    async fn aggregate<T: Send + 'static>(
        &self,
        table_name: &str,
        column: &str,
        where_: Option<Where>,
        op: fn(&Path, &LineSelector, bool) -> Result<T>,
    ) -> Result<T> {
        let schema = self.schema_for(table_name)?;
        let table_dir = self.table_dir(table_name);
        let compressed = table::is_compressed(&table_dir);
        let salt = self.config.salt;
        let column = column.to_string();

        tokio::task::spawn_blocking(move || -> Result<T> {
            let resolved = table::find_column(&schema, &column).ok_or_else(|| InibaseError::InvalidParameters {
                reason: format!("unknown column '{column}'"),
            })?;
            let path = table::column_file_path(&table_dir, &resolved, compressed);
            let selector = match where_ {
                Some(w) => LineSelector::Lines(mutation::resolve_mutation_target(&table_dir, &schema, compressed, &salt, &w)?),
                None => LineSelector::All,
            };
            op(&path, &selector, compressed)
        })
        .await
        .expect("aggregate task panicked")
    }

    /// `search`-by-criteria shorthand used by callers that already have a
    /// [`Criteria`] tree rather than a [`Where`] (e.g. a parsed compact
    /// query string).
    pub async fn get_where_criteria(
        &self,
        table_name: &str,
        criteria: Criteria,
        options: Options,
        only_one: bool,
    ) -> Result<(Option<Value>, Option<assembler::PageInfo>)> {
        self.get(table_name, Some(Where::Criteria(criteria)), options, only_one, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldKind;
    use crate::schema::Field;

    async fn test_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("INIBASE_SECRET");
        let engine = Engine::new(dir.path()).await.unwrap();
        std::env::remove_var("INIBASE_SECRET");
        (dir, engine)
    }

    #[tokio::test]
    async fn create_post_and_get_round_trip() {
        let (_dir, engine) = test_engine().await;
        engine
            .create_table("users", vec![Field::scalar(0, "username", FieldKind::String)])
            .await
            .unwrap();

        let ids = engine.post("users", vec![serde_json::json!({"username": "alice"})]).await.unwrap();
        assert_eq!(ids.len(), 1);

        let (value, page) = engine.get("users", Some(Where::Id(ids[0].clone())), Options::default(), true, false).await.unwrap();
        let record = value.unwrap();
        assert_eq!(record["username"], "alice");
        assert!(page.is_some());
    }

    #[tokio::test]
    async fn put_without_where_requires_explicit_all() {
        let (_dir, engine) = test_engine().await;
        engine
            .create_table("users", vec![Field::scalar(0, "username", FieldKind::String)])
            .await
            .unwrap();
        engine.post("users", vec![serde_json::json!({"username": "alice"})]).await.unwrap();

        engine.put("users", serde_json::json!({"username": "ALICE"}), Where::All).await.unwrap();
        let (value, _) = engine.get("users", Some(Where::Line(1)), Options::default(), true, false).await.unwrap();
        assert_eq!(value.unwrap()["username"], "ALICE");
    }

    #[tokio::test]
    async fn delete_all_clears_total_but_not_last_id() {
        let (_dir, engine) = test_engine().await;
        engine
            .create_table("users", vec![Field::scalar(0, "username", FieldKind::String)])
            .await
            .unwrap();
        engine.post("users", vec![serde_json::json!({"username": "alice"})]).await.unwrap();

        engine.delete("users", None).await.unwrap();
        let pagination = table::read_pagination(&engine.table_dir("users")).unwrap();
        assert_eq!(pagination.total, 0);
        assert_eq!(pagination.last_id, 1);
    }
}
