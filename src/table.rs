//! Table directory layout and the schema/pagination markers that live in it
//! (§3, §6).
//!
//! A table is a directory: one column file per scalar/union leaf field
//! (named by its dotted path, file-name-escaped), `schema.json`, a
//! `<highestFieldId>.schema` high-water-mark marker, a
//! `<lastId>-<total>.pagination` marker, optional `.compression.config` /
//! `.cache.config` / `.prepend.config` feature markers, and `.tmp/` /
//! `.cache/` working directories.

use crate::codec::escape_file_name;
use crate::error::{io_at, InibaseError, Result};
use crate::schema::{self, Children, Field, FieldType, Schema};
use std::fs;
use std::path::{Path, PathBuf};

/// A resolved path to one scalar/union leaf field: its dotted schema path
/// (for sort/filter keys, `.*.` marking each array-of-object hop) and the
/// on-disk file name (file-name-escaped, flat, no directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPath {
    pub dotted: String,
    pub file_name: String,
}

/// Walk `schema` and return one [`ColumnPath`] per scalar/union leaf (object
/// and array-of-object fields recurse instead of producing a column of
/// their own; array-of-scalar and union fields are leaves, one file each).
pub fn column_paths(schema: &Schema) -> Vec<ColumnPath> {
    let mut out = Vec::new();
    column_paths_into(schema, "", &mut out);
    out
}

fn column_paths_into(schema: &Schema, prefix: &str, out: &mut Vec<ColumnPath>) {
    for field in schema {
        let dotted = if prefix.is_empty() {
            field.key.clone()
        } else {
            format!("{prefix}.{}", field.key)
        };
        match field.children.as_deref() {
            Some(Children::Schema(sub)) if matches!(field.field_type, FieldType::Single(crate::codec::FieldKind::Object)) => {
                column_paths_into(sub, &dotted, out);
            }
            Some(Children::Schema(sub)) => {
                // array-of-object: every descendant column is keyed through a
                // `.*.` hop so get_field can skip back over the array level.
                let hop = format!("{dotted}.*");
                column_paths_into(sub, &hop, out);
            }
            _ => out.push(ColumnPath {
                file_name: escape_file_name(&dotted),
                dotted,
            }),
        }
    }
}

/// Strip every `*` hop from a dotted path, so a user-facing key
/// (`"roles.role"`) and a column's storage path (`"roles.*.role"`) compare
/// equal regardless of whether the caller spelled out the array hop.
fn normalize(path: &str) -> String {
    path.split('.').filter(|s| *s != "*").collect::<Vec<_>>().join(".")
}

/// Resolve a user-facing dotted key (criteria key, sort key, column filter)
/// to the column file that stores it.
pub fn find_column(schema: &Schema, user_path: &str) -> Option<ColumnPath> {
    let wanted = normalize(user_path);
    column_paths(schema).into_iter().find(|c| normalize(&c.dotted) == wanted)
}

/// The [`crate::codec::FieldKind`] to decode a leaf field with, and its
/// array child kind when the field is an array. `None` for the leaf kind
/// means "union type, detect per value" (see `decode_auto`); `None` for the
/// child kind falls back to `FieldKind::String`, the same default
/// `decode_auto` uses for an untyped array element.
pub fn leaf_decode_kind(field: &Field) -> (Option<crate::codec::FieldKind>, Option<crate::codec::FieldKind>) {
    let kind = match &field.field_type {
        FieldType::Single(k) => Some(*k),
        FieldType::Union(_) => None,
    };
    let child = match field.children.as_deref() {
        Some(Children::Type(FieldType::Single(k))) => Some(*k),
        _ => None,
    };
    (kind, child)
}

/// `<table_dir>/<column.file_name>.txt[.gz]`.
pub fn column_file_path(table_dir: &Path, column: &ColumnPath, compressed: bool) -> PathBuf {
    let ext = if compressed { "txt.gz" } else { "txt" };
    table_dir.join(format!("{}.{ext}", column.file_name))
}

pub fn tmp_dir(table_dir: &Path) -> PathBuf {
    table_dir.join(".tmp")
}

pub fn cache_dir(table_dir: &Path) -> PathBuf {
    table_dir.join(".cache")
}

pub fn schema_path(table_dir: &Path) -> PathBuf {
    table_dir.join("schema.json")
}

pub fn compression_marker(table_dir: &Path) -> PathBuf {
    table_dir.join(".compression.config")
}

pub fn cache_marker(table_dir: &Path) -> PathBuf {
    table_dir.join(".cache.config")
}

pub fn prepend_marker(table_dir: &Path) -> PathBuf {
    table_dir.join(".prepend.config")
}

pub fn is_compressed(table_dir: &Path) -> bool {
    compression_marker(table_dir).exists()
}

pub fn is_cache_enabled(table_dir: &Path) -> bool {
    cache_marker(table_dir).exists()
}

pub fn prepends_new_records(table_dir: &Path) -> bool {
    prepend_marker(table_dir).exists()
}

pub fn read_config(table_dir: &Path) -> crate::config::TableConfig {
    crate::config::TableConfig {
        compression: is_compressed(table_dir),
        cache: is_cache_enabled(table_dir),
        prepend: prepends_new_records(table_dir),
    }
}

/// Write (or remove) the three feature-toggle marker files to match
/// `config`. Does not touch any column file's contents — callers that flip
/// `compression`/`prepend` must rewrite the column files themselves (see
/// [`toggle_storage_layout`]) since those toggles change what is already
/// on disk, not just how future writes behave.
fn write_markers(table_dir: &Path, config: crate::config::TableConfig) -> Result<()> {
    set_marker(&compression_marker(table_dir), config.compression)?;
    set_marker(&cache_marker(table_dir), config.cache)?;
    set_marker(&prepend_marker(table_dir), config.prepend)?;
    Ok(())
}

fn set_marker(path: &Path, present: bool) -> Result<()> {
    if present {
        if !path.exists() {
            fs::write(path, "").map_err(|e| io_at(path.to_path_buf(), e))?;
        }
    } else if path.exists() {
        fs::remove_file(path).map_err(|e| io_at(path.to_path_buf(), e))?;
    }
    Ok(())
}

/// Create a brand-new table directory: `.tmp/`, `.cache/`, `schema.json`,
/// the `0.schema` high-water marker (no fields assigned yet), and a
/// `0-0.pagination` marker.
pub fn create(table_dir: &Path, schema: &Schema, config: crate::config::TableConfig, salt: &[u8; 32]) -> Result<()> {
    if table_dir.exists() {
        return Err(InibaseError::TableExists {
            name: table_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        });
    }
    fs::create_dir_all(table_dir).map_err(|e| io_at(table_dir, e))?;
    fs::create_dir_all(tmp_dir(table_dir)).map_err(|e| io_at(tmp_dir(table_dir), e))?;
    fs::create_dir_all(cache_dir(table_dir)).map_err(|e| io_at(cache_dir(table_dir), e))?;

    write_schema(table_dir, schema, salt)?;
    write_schema_marker(table_dir, schema::flatten(schema).iter().map(|(_, f)| f.id).max().unwrap_or(0))?;
    write_pagination(table_dir, 0, 0)?;
    write_markers(table_dir, config)?;
    Ok(())
}

/// Rewrite every column file under `table_dir` into a sibling directory
/// with `new_config`'s compression/prepend applied, then rename the whole
/// table directory into place. This is the crash-safe toggle the design
/// notes call for (§9): a crash at any point before the final rename
/// leaves the original table untouched, and the sibling is orphaned
/// scratch the next `updateTable` call on this table will simply
/// overwrite.
pub fn toggle_storage_layout(table_dir: &Path, schema: &Schema, old_config: crate::config::TableConfig, new_config: crate::config::TableConfig) -> Result<()> {
    if old_config.compression == new_config.compression && old_config.prepend == new_config.prepend {
        write_markers(table_dir, new_config)?;
        return Ok(());
    }

    let parent = table_dir.parent().ok_or_else(|| InibaseError::InvalidParameters {
        reason: "table directory has no parent".into(),
    })?;
    let name = table_dir.file_name().and_then(|n| n.to_str()).unwrap_or("table").to_string();
    let staging = parent.join(format!(".{name}.rewrite.tmp"));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| io_at(staging.clone(), e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| io_at(staging.clone(), e))?;
    fs::create_dir_all(tmp_dir(&staging)).map_err(|e| io_at(tmp_dir(&staging), e))?;
    fs::create_dir_all(cache_dir(&staging)).map_err(|e| io_at(cache_dir(&staging), e))?;

    for column in column_paths(schema) {
        let src = column_file_path(table_dir, &column, old_config.compression);
        let dest = column_file_path(&staging, &column, new_config.compression);
        if !src.exists() {
            continue;
        }
        let (lines, _) = crate::file_engine::get(&src, &crate::file_engine::LineSelector::All, old_config.compression)?;
        let ordered: Vec<String> = if new_config.prepend == old_config.prepend {
            lines.into_values().collect()
        } else {
            let mut v: Vec<String> = lines.into_values().collect();
            v.reverse();
            v
        };
        let tmp = crate::file_engine::append(&dest, &ordered, new_config.compression, tmp_dir(&staging).as_path())?;
        fs::rename(&tmp, &dest).map_err(|e| io_at(dest.clone(), e))?;
    }

    fs::copy(schema_path(table_dir), schema_path(&staging)).map_err(|e| io_at(schema_path(&staging), e))?;
    let pagination = read_pagination(table_dir)?;
    write_pagination(&staging, pagination.last_id, pagination.total)?;
    let high_water = read_schema_marker(table_dir)?;
    write_schema_marker(&staging, high_water)?;
    write_markers(&staging, new_config)?;

    let backup = parent.join(format!(".{name}.pre-rewrite.tmp"));
    if backup.exists() {
        fs::remove_dir_all(&backup).map_err(|e| io_at(backup.clone(), e))?;
    }
    fs::rename(table_dir, &backup).map_err(|e| io_at(table_dir.to_path_buf(), e))?;
    fs::rename(&staging, table_dir).map_err(|e| io_at(table_dir.to_path_buf(), e))?;
    fs::remove_dir_all(&backup).map_err(|e| io_at(backup, e))?;
    Ok(())
}

/// Rename the table directory itself (`updateTable`'s `config.name`).
pub fn rename_table_dir(table_dir: &Path, new_table_dir: &Path) -> Result<()> {
    if new_table_dir.exists() {
        return Err(InibaseError::TableExists {
            name: new_table_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        });
    }
    fs::rename(table_dir, new_table_dir).map_err(|e| io_at(table_dir.to_path_buf(), e))
}

/// Rename every column file affected by a schema diff (§4.3's
/// `setTableSchema`), oldest-safe: each rename is applied directly since
/// distinct dotted paths can never collide with one another's escaped file
/// names mid-batch.
pub fn apply_rename_plan(table_dir: &Path, plans: &[schema::RenamePlan], compressed: bool) -> Result<()> {
    for plan in plans {
        let ext = if compressed { "txt.gz" } else { "txt" };
        let from = table_dir.join(format!("{}.{ext}", escape_file_name(&plan.from_path)));
        let to = table_dir.join(format!("{}.{ext}", escape_file_name(&plan.to_path)));
        if from.exists() {
            fs::rename(&from, &to).map_err(|e| io_at(to, e))?;
        }
    }
    Ok(())
}

pub fn write_schema(table_dir: &Path, schema: &Schema, salt: &[u8; 32]) -> Result<()> {
    let json = schema::to_json(schema, salt);
    let text = serde_json::to_string_pretty(&json)?;
    fs::write(schema_path(table_dir), text).map_err(|e| io_at(schema_path(table_dir), e))
}

pub fn read_schema(table_dir: &Path, salt: &[u8; 32]) -> Result<Schema> {
    let path = schema_path(table_dir);
    if !path.exists() {
        return Err(InibaseError::NoSchema {
            name: table_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        });
    }
    let text = fs::read_to_string(&path).map_err(|e| io_at(&path, e))?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    schema::from_json(&value, salt)
}

/// The high-water mark is encoded in the marker's file name itself:
/// `<table_dir>/<N>.schema`, where `N` is the greatest field id ever
/// assigned in this table (including ids freed by field removal).
fn schema_marker_glob(table_dir: &Path) -> Result<Option<u32>> {
    let entries = match fs::read_dir(table_dir) {
        Ok(e) => e,
        Err(e) => return Err(io_at(table_dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_at(table_dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".schema") {
            if let Ok(n) = stem.parse::<u32>() {
                return Ok(Some(n));
            }
        }
    }
    Ok(None)
}

pub fn read_schema_marker(table_dir: &Path) -> Result<u32> {
    Ok(schema_marker_glob(table_dir)?.unwrap_or(0))
}

pub fn write_schema_marker(table_dir: &Path, highest_id: u32) -> Result<()> {
    if let Some(existing) = schema_marker_glob(table_dir)? {
        if existing != highest_id {
            let old = table_dir.join(format!("{existing}.schema"));
            let _ = fs::remove_file(old);
        }
    }
    let path = table_dir.join(format!("{highest_id}.schema"));
    fs::write(&path, "").map_err(|e| io_at(&path, e))
}

/// `<lastId>-<total>.pagination`: the last assigned auto-increment id, and
/// the current row count, both monotonic counters read/written as a single
/// rename-swapped marker file (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub last_id: u64,
    pub total: u64,
}

fn pagination_glob(table_dir: &Path) -> Result<Option<(PathBuf, Pagination)>> {
    let entries = match fs::read_dir(table_dir) {
        Ok(e) => e,
        Err(e) => return Err(io_at(table_dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_at(table_dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".pagination") {
            if let Some((last, total)) = stem.split_once('-') {
                if let (Ok(last_id), Ok(total)) = (last.parse::<u64>(), total.parse::<u64>()) {
                    return Ok(Some((entry.path(), Pagination { last_id, total })));
                }
            }
        }
    }
    Ok(None)
}

pub fn read_pagination(table_dir: &Path) -> Result<Pagination> {
    Ok(pagination_glob(table_dir)?
        .map(|(_, p)| p)
        .unwrap_or(Pagination { last_id: 0, total: 0 }))
}

/// Replace the pagination marker atomically: write the new marker file
/// first, then remove the old one (rather than remove-then-write) so a
/// crash in between leaves two markers rather than zero.
pub fn write_pagination(table_dir: &Path, last_id: u64, total: u64) -> Result<()> {
    let existing = pagination_glob(table_dir)?;
    let new_path = table_dir.join(format!("{last_id}-{total}.pagination"));
    fs::write(&new_path, "").map_err(|e| io_at(&new_path, e))?;
    if let Some((old_path, _)) = existing {
        if old_path != new_path {
            let _ = fs::remove_file(old_path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldKind;
    use crate::schema::Field;

    fn salt() -> [u8; 32] {
        [9u8; 32]
    }

    #[test]
    fn column_paths_flattens_object_and_marks_array_of_object() {
        let city = Field::scalar(3, "city", FieldKind::String);
        let mut address = Field::scalar(2, "address", FieldKind::Object);
        address.children = Some(Box::new(Children::Schema(vec![city])));

        let role = Field::scalar(5, "role", FieldKind::String);
        let mut roles = Field::scalar(4, "roles", FieldKind::Array);
        roles.children = Some(Box::new(Children::Schema(vec![role])));

        let schema = vec![Field::scalar(1, "username", FieldKind::String), address, roles];
        let paths = column_paths(&schema);
        let dotted: Vec<&str> = paths.iter().map(|c| c.dotted.as_str()).collect();

        assert!(dotted.contains(&"username"));
        assert!(dotted.contains(&"address.city"));
        assert!(dotted.contains(&"roles.*.role"));
    }

    #[test]
    fn create_writes_markers_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("users");
        let schema = vec![Field::scalar(1, "username", FieldKind::String)];

        create(&table_dir, &schema, crate::config::TableConfig::default(), &salt()).unwrap();

        assert!(schema_path(&table_dir).exists());
        assert_eq!(read_schema_marker(&table_dir).unwrap(), 1);
        assert_eq!(read_pagination(&table_dir).unwrap(), Pagination { last_id: 0, total: 0 });

        let roundtripped = read_schema(&table_dir, &salt()).unwrap();
        assert_eq!(roundtripped, schema);
    }

    #[test]
    fn create_rejects_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("users");
        let schema = vec![Field::scalar(1, "username", FieldKind::String)];
        create(&table_dir, &schema, crate::config::TableConfig::default(), &salt()).unwrap();

        let err = create(&table_dir, &schema, crate::config::TableConfig::default(), &salt()).unwrap_err();
        assert!(matches!(err, InibaseError::TableExists { .. }));
    }

    #[test]
    fn pagination_marker_swaps_without_leaving_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let table_dir = dir.path().join("users");
        fs::create_dir_all(&table_dir).unwrap();
        write_pagination(&table_dir, 0, 0).unwrap();
        write_pagination(&table_dir, 1, 1).unwrap();

        let markers: Vec<_> = fs::read_dir(&table_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".pagination"))
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(read_pagination(&table_dir).unwrap(), Pagination { last_id: 1, total: 1 });
    }
}
