//! Mutation pipeline — `post`/`put`/`delete` (§4.9).
//!
//! Every mutation follows the same shape: validate the incoming data
//! against the schema, format it (hash passwords, resolve opaque ids to
//! raw integers, stringify `json`, stamp `createdAt`/`updatedAt`), flatten
//! it into one encoded line per leaf column, write every affected column
//! file to a `.tmp/` sibling, then rename every sibling over its final
//! path in one batch (§4.4's atomicity contract). The pagination marker is
//! only swapped after every column rename has succeeded.

use crate::codec::{self, FieldKind};
use crate::crypto;
use crate::error::{InibaseError, Result};
use crate::file_engine::{self, LineSelector, Replacement};
use crate::query::Where;
use crate::schema::{Children, Field, FieldType, Schema};
use crate::search::{Operator, Predicate};
use crate::table::{self, ColumnPath};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Extract the value at a dotted schema path (with `.*.` array-of-object
/// hops) out of a JSON record, mirroring the assembler's inverse operation.
fn extract_by_dotted(record: &Value, dotted: &str) -> Value {
    let segments: Vec<&str> = dotted.split('.').collect();
    extract_segments(record, &segments)
}

fn extract_segments(v: &Value, segments: &[&str]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return v.clone();
    };
    if *head == "*" {
        match v {
            Value::Array(items) => Value::Array(items.iter().map(|item| extract_segments(item, rest)).collect()),
            _ => Value::Array(vec![]),
        }
    } else {
        match v {
            Value::Object(map) => map.get(*head).map(|inner| extract_segments(inner, rest)).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Resolve a field to its field-id-bearing leaf (walking through `.*.`
/// array hops) so validation/formatting can consult `required`/`unique`.
fn leaf_field<'a>(schema: &'a Schema, dotted: &str) -> Option<&'a Field> {
    crate::schema::get_field(dotted, schema)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lightweight shape check — the original's validator mostly exists to
/// catch gross mismatches (a string where a number was declared) rather
/// than to fully re-derive [`codec::detect_type`]'s rules.
fn matches_kind(kind: FieldKind, value: &Value) -> bool {
    if value.is_null() {
        return true;
    }
    match kind {
        FieldKind::Number | FieldKind::Table => value.is_number() || value.as_str().map_or(false, |s| s.parse::<f64>().is_ok()),
        FieldKind::Boolean => value.is_boolean() || matches!(value.as_str(), Some("0") | Some("1") | Some("true") | Some("false")),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
        FieldKind::Id => value.is_string() || value.is_number(),
        FieldKind::Json => true,
        _ => value.is_string() || value.is_number() || value.is_boolean(),
    }
}

fn kind_matches_any(field_type: &FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Single(k) => matches_kind(*k, value),
        FieldType::Union(ks) => ks.iter().any(|k| matches_kind(*k, value)),
    }
}

/// Walk every scalar/union leaf column and check `required` (skipped for
/// `put`, where only supplied keys are validated) and a lightweight type
/// shape match. `id`/`createdAt`/`updatedAt` are always skipped, per §4.9
/// step 1.
pub fn validate(schema: &Schema, record: &Value, enforce_required: bool) -> Result<()> {
    for column in table::column_paths(schema) {
        if is_implicit(&column.dotted) {
            continue;
        }
        let Some(field) = leaf_field(schema, &column.dotted) else { continue };
        let value = extract_by_dotted(record, &column.dotted);

        if value.is_null() {
            if enforce_required && field.required {
                return Err(InibaseError::FieldRequired { field: column.dotted.clone() });
            }
            continue;
        }

        let (kind, _) = table::leaf_decode_kind(field);

        // A `.*.` hop means this leaf lives inside an array-of-object field,
        // so `extract_by_dotted` hands back one array entry per object
        // rather than a single scalar — check each entry against the leaf
        // kind instead of the array as a whole.
        if is_array_of_object_leaf(&column.dotted) {
            let Value::Array(items) = &value else {
                return Err(InibaseError::InvalidType {
                    field: column.dotted.clone(),
                    expected: field.field_type_label(),
                    got: type_name(&value).to_string(),
                });
            };
            for item in items {
                if item.is_null() {
                    continue;
                }
                let ok = match kind {
                    Some(k) => matches_kind(k, item),
                    None => kind_matches_any(&field.field_type, item),
                };
                if !ok {
                    return Err(InibaseError::InvalidType {
                        field: column.dotted.clone(),
                        expected: field.field_type_label(),
                        got: type_name(item).to_string(),
                    });
                }
            }
            continue;
        }

        let ok = match kind {
            Some(FieldKind::Array) => value.is_array(),
            Some(k) => matches_kind(k, &value),
            None => kind_matches_any(&field.field_type, &value),
        };
        if !ok {
            return Err(InibaseError::InvalidType {
                field: column.dotted.clone(),
                expected: field.field_type_label(),
                got: type_name(&value).to_string(),
            });
        }
    }
    Ok(())
}

/// Whether `dotted` passes through a `.*.` array-of-object hop (e.g.
/// `"roles.*.role"`), as opposed to naming an array-of-scalar leaf directly.
fn is_array_of_object_leaf(dotted: &str) -> bool {
    dotted.split('.').any(|seg| seg == "*")
}

fn is_implicit(dotted: &str) -> bool {
    matches!(dotted, "id" | "createdAt" | "updatedAt")
}

fn encode_scalar_for_kind(value: &Value, kind: FieldKind, salt: &[u8; 32]) -> Result<String> {
    if value.is_null() {
        return Ok(String::new());
    }
    Ok(match kind {
        FieldKind::Boolean => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Value::String(s) => matches!(s.as_str(), "1" | "true"),
                _ => false,
            };
            if truthy { "1".to_string() } else { "0".to_string() }
        }
        FieldKind::Number => match value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok())) {
            Some(n) => n.to_string(),
            None => String::new(),
        },
        FieldKind::Id | FieldKind::Table => {
            let resolved = match value {
                Value::String(s) => crypto::decode_id(s, salt).or_else(|| s.parse::<u64>().ok()),
                Value::Number(n) => n.as_u64(),
                _ => None,
            };
            resolved.map(|n| n.to_string()).unwrap_or_default()
        }
        FieldKind::Date => {
            let ms = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.timestamp_millis())
                    .ok()
                    .or_else(|| s.parse::<i64>().ok()),
                _ => None,
            };
            ms.map(|n| n.to_string()).unwrap_or_default()
        }
        FieldKind::Password => match value.as_str() {
            Some(s) => crypto::hash_password(s),
            None => String::new(),
        },
        FieldKind::Json => codec::escape_scalar(&serde_json::to_string(value)?),
        _ => match value {
            Value::String(s) => codec::escape_scalar(s),
            other => codec::escape_scalar(&other.to_string()),
        },
    })
}

fn encode_array(value: &Value, child_kind: Option<FieldKind>, salt: &[u8; 32]) -> Result<String> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::Null => vec![],
        other => vec![other.clone()],
    };
    match child_kind {
        Some(k) if matches!(k, FieldKind::Password | FieldKind::Date | FieldKind::Json | FieldKind::Id | FieldKind::Table) => {
            let encoded: Vec<String> = items.iter().map(|it| encode_scalar_for_kind(it, k, salt)).collect::<Result<_>>()?;
            Ok(encoded.join(","))
        }
        _ => Ok(codec::encode_value(&Value::Array(items))),
    }
}

/// Encode one leaf column's value for one record, per §4.1 (array columns
/// always wrap non-array input; `password`/`date`/`json`/`id`/`table` get
/// kind-specific treatment; everything else round-trips through the
/// generic delimiter-hierarchy encoder).
fn encode_for_field(value: &Value, field: &Field, salt: &[u8; 32]) -> Result<String> {
    match &field.field_type {
        FieldType::Single(FieldKind::Array) => {
            let child_kind = match field.children.as_deref() {
                Some(Children::Type(FieldType::Single(k))) => Some(*k),
                _ => None,
            };
            encode_array(value, child_kind, salt)
        }
        FieldType::Single(kind @ (FieldKind::Password | FieldKind::Date | FieldKind::Json | FieldKind::Id | FieldKind::Table)) => {
            encode_scalar_for_kind(value, *kind, salt)
        }
        _ => Ok(codec::encode_value(value)),
    }
}

/// Build `{column -> encoded line}` for one record against every leaf in
/// `schema`, skipping `id`/`createdAt`/`updatedAt` (callers stamp those
/// separately since they're not user-suppliable on `post` and only
/// conditionally present on `put`).
fn encode_record(schema: &Schema, record: &Value, salt: &[u8; 32]) -> Result<Vec<(ColumnPath, String)>> {
    let mut out = Vec::new();
    for column in table::column_paths(schema) {
        if is_implicit(&column.dotted) {
            continue;
        }
        let Some(field) = leaf_field(schema, &column.dotted) else { continue };
        let value = extract_by_dotted(record, &column.dotted);
        let encoded = encode_for_field(&value, field, salt)?;
        out.push((column, encoded));
    }
    Ok(out)
}

/// §4.9 step 4: for every `unique` leaf, fail if any of the incoming
/// values already exists in that column.
fn check_uniqueness(table_dir: &Path, schema: &Schema, compressed: bool, salt: &[u8; 32], records: &[Value]) -> Result<()> {
    for column in table::column_paths(schema) {
        if is_implicit(&column.dotted) {
            continue;
        }
        let Some(field) = leaf_field(schema, &column.dotted) else { continue };
        if !field.unique {
            continue;
        }
        let values: Vec<Value> = records.iter().map(|r| extract_by_dotted(r, &column.dotted)).filter(|v| !v.is_null()).collect();
        if values.is_empty() {
            continue;
        }
        let path = table::column_file_path(table_dir, &column, compressed);
        let (kind, child) = table::leaf_decode_kind(field);
        let predicate = Predicate::single(Operator::In, Value::Array(values.clone()));
        let result = crate::search::search(&path, &predicate, kind, child, None, None, true, compressed, salt)?;
        if !result.hits.is_empty() {
            return Err(InibaseError::FieldUnique {
                field: column.dotted.clone(),
                value: values.first().map(|v| v.to_string()).unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// `post(table, data, options, returnPosted?)` — validate, assign ids,
/// enforce uniqueness, format, append/prepend per column, rename, bump
/// pagination.
pub fn post(table_dir: &Path, schema: &Schema, compressed: bool, prepend: bool, salt: &[u8; 32], records: Vec<Value>) -> Result<Vec<u64>> {
    for record in &records {
        validate(schema, record, true)?;
    }
    check_uniqueness(table_dir, schema, compressed, salt, &records)?;

    let pagination = table::read_pagination(table_dir)?;
    let mut last_id = pagination.last_id;
    let created_at = now_ms();
    let mut assigned_ids = Vec::with_capacity(records.len());

    let mut per_column: Vec<(ColumnPath, Vec<String>)> = table::column_paths(schema)
        .into_iter()
        .filter(|c| !is_implicit(&c.dotted))
        .map(|c| (c, Vec::with_capacity(records.len())))
        .collect();
    let mut id_lines = Vec::with_capacity(records.len());
    let mut created_lines = Vec::with_capacity(records.len());
    let mut updated_lines = Vec::with_capacity(records.len());

    for record in &records {
        last_id += 1;
        assigned_ids.push(last_id);
        id_lines.push(last_id.to_string());
        created_lines.push(created_at.to_string());
        updated_lines.push(String::new());

        let encoded = encode_record(schema, record, salt)?;
        let encoded_by_name: std::collections::HashMap<String, String> = encoded.into_iter().map(|(c, v)| (c.file_name, v)).collect();
        for (column, values) in &mut per_column {
            values.push(encoded_by_name.get(&column.file_name).cloned().unwrap_or_default());
        }
    }

    let tmp_dir = table::tmp_dir(table_dir);
    let mut pairs = Vec::with_capacity(per_column.len() + 3);

    let write = |column: &ColumnPath, values: &[String]| -> Result<(std::path::PathBuf, std::path::PathBuf)> {
        let path = table::column_file_path(table_dir, column, compressed);
        let tmp = if prepend {
            file_engine::prepend(&path, values, compressed, &tmp_dir)?
        } else {
            file_engine::append(&path, values, compressed, &tmp_dir)?
        };
        Ok((tmp, path))
    };

    if let Some(id_column) = table::find_column(schema, "id") {
        pairs.push(write(&id_column, &id_lines)?);
    }
    if let Some(created_column) = table::find_column(schema, "createdAt") {
        pairs.push(write(&created_column, &created_lines)?);
    }
    if let Some(updated_column) = table::find_column(schema, "updatedAt") {
        pairs.push(write(&updated_column, &updated_lines)?);
    }
    for (column, values) in &per_column {
        pairs.push(write(column, values)?);
    }

    file_engine::rename_batch(&pairs)?;
    table::write_pagination(table_dir, last_id, pagination.total + records.len() as u64)?;
    if table::is_cache_enabled(table_dir) {
        let _ = std::fs::remove_dir_all(table::cache_dir(table_dir));
        let _ = std::fs::create_dir_all(table::cache_dir(table_dir));
    }

    Ok(assigned_ids)
}

/// `put(table, data, where?, options, returnUpdated?)` resolved down to
/// line numbers: validate only the supplied keys, stamp `updatedAt`,
/// replace per affected column.
pub fn put(table_dir: &Path, schema: &Schema, compressed: bool, salt: &[u8; 32], lines: &[u64], patch: &Value) -> Result<()> {
    validate(schema, patch, false)?;

    let updated_at = now_ms().to_string();
    let mut replacements: Vec<(ColumnPath, BTreeMap<u64, String>)> = Vec::new();

    for column in table::column_paths(schema) {
        if is_implicit(&column.dotted) {
            continue;
        }
        let Some(field) = leaf_field(schema, &column.dotted) else { continue };
        let value = extract_by_dotted(patch, &column.dotted);
        if value.is_null() && !patch_has_key(patch, &column.dotted) {
            continue;
        }
        let encoded = encode_for_field(&value, field, salt)?;
        let mut map = BTreeMap::new();
        for &line in lines {
            map.insert(line, encoded.clone());
        }
        replacements.push((column, map));
    }

    if let Some(updated_column) = table::find_column(schema, "updatedAt") {
        let mut map = BTreeMap::new();
        for &line in lines {
            map.insert(line, updated_at.clone());
        }
        replacements.push((updated_column, map));
    }

    let tmp_dir = table::tmp_dir(table_dir);
    let mut pairs = Vec::with_capacity(replacements.len());
    for (column, map) in &replacements {
        let path = table::column_file_path(table_dir, column, compressed);
        let tmp = file_engine::replace(&path, &Replacement::Lines(map.clone()), compressed, &tmp_dir)?;
        pairs.push((tmp, path));
    }
    file_engine::rename_batch(&pairs)?;

    if table::is_cache_enabled(table_dir) {
        let _ = std::fs::remove_dir_all(table::cache_dir(table_dir));
        let _ = std::fs::create_dir_all(table::cache_dir(table_dir));
    }
    Ok(())
}

/// Whether `patch` explicitly names `dotted` (as opposed to it simply
/// being absent) — a patch that sets a field to JSON `null` should still
/// overwrite the column with an empty line, but a field the caller never
/// mentioned must be left untouched.
fn patch_has_key(patch: &Value, dotted: &str) -> bool {
    let mut current = patch;
    for seg in dotted.split('.') {
        if seg == "*" {
            return false; // array-of-object patch-by-path isn't supported for put
        }
        match current.get(seg) {
            Some(v) => current = v,
            None => return false,
        }
    }
    true
}

/// `delete(table, where?)` resolved down to line numbers: remove those
/// lines from every column file, rename, and shrink the pagination total.
/// `lastId` is never decremented — deleted ids are never reused.
pub fn delete(table_dir: &Path, schema: &Schema, compressed: bool, lines: &HashSet<u64>) -> Result<()> {
    let pagination = table::read_pagination(table_dir)?;
    let remaining = pagination.total.saturating_sub(lines.len() as u64);

    if remaining == 0 {
        delete_all(table_dir, schema, compressed, pagination.last_id)?;
        return Ok(());
    }

    let tmp_dir = table::tmp_dir(table_dir);
    let mut pairs = Vec::new();
    for column in table::column_paths(schema) {
        let path = table::column_file_path(table_dir, &column, compressed);
        if !path.exists() {
            continue;
        }
        let tmp = file_engine::remove(&path, lines, compressed, &tmp_dir)?;
        pairs.push((tmp, path));
    }
    file_engine::rename_batch(&pairs)?;
    table::write_pagination(table_dir, pagination.last_id, remaining)?;
    if table::is_cache_enabled(table_dir) {
        let _ = std::fs::remove_dir_all(table::cache_dir(table_dir));
        let _ = std::fs::create_dir_all(table::cache_dir(table_dir));
    }
    Ok(())
}

/// `delete` with no `where` (or whose residual count would be zero):
/// unlink every `*.txt(.gz)` column file and bump the marker to
/// `<lastId>-0.pagination`; `schema.json`/markers are left intact so a
/// caller can immediately `post` into the table again without
/// re-declaring its schema.
fn delete_all(table_dir: &Path, schema: &Schema, compressed: bool, last_id: u64) -> Result<()> {
    for column in table::column_paths(schema) {
        let path = table::column_file_path(table_dir, &column, compressed);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| crate::error::io_at(path, e))?;
        }
    }
    table::write_pagination(table_dir, last_id, 0)?;
    if table::is_cache_enabled(table_dir) {
        let _ = std::fs::remove_dir_all(table::cache_dir(table_dir));
        let _ = std::fs::create_dir_all(table::cache_dir(table_dir));
    }
    Ok(())
}

/// Resolve a `put`/`delete` `where` lacking an explicit id down to the
/// line numbers it touches, sharing the same resolution the assembler
/// uses for `get` (§4.9: "without where, require each record to carry an
/// opaque id").
pub fn resolve_mutation_target(table_dir: &Path, schema: &Schema, compressed: bool, salt: &[u8; 32], where_: &Where) -> Result<HashSet<u64>> {
    crate::query::resolve_where(table_dir, schema, compressed, salt, where_)
}

impl Field {
    /// Human-readable type label for [`InibaseError::InvalidType`].
    pub fn field_type_label(&self) -> String {
        match &self.field_type {
            FieldType::Single(k) => k.as_str().to_string(),
            FieldType::Union(ks) => ks.iter().map(|k| k.as_str()).collect::<Vec<_>>().join("|"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::with_implicit_fields;

    fn salt() -> [u8; 32] {
        [4u8; 32]
    }

    fn sample_schema() -> Schema {
        let mut next_id = 1;
        let mut fields = vec![Field::scalar(0, "username", FieldKind::String), Field::scalar(0, "age", FieldKind::Number)];
        fields[0].required = true;
        fields[0].unique = true;
        with_implicit_fields(fields, &mut next_id)
    }

    #[test]
    fn post_assigns_sequential_ids_and_writes_columns() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();

        let records = vec![serde_json::json!({"username": "alice", "age": 30}), serde_json::json!({"username": "bob", "age": 25})];
        let ids = post(dir.path(), &schema, false, false, &salt(), records).unwrap();
        assert_eq!(ids, vec![1, 2]);

        let pagination = table::read_pagination(dir.path()).unwrap();
        assert_eq!(pagination, table::Pagination { last_id: 2, total: 2 });

        let username_col = table::find_column(&schema, "username").unwrap();
        let (lines, _) = file_engine::get(&table::column_file_path(dir.path(), &username_col, false), &LineSelector::All, false).unwrap();
        assert_eq!(lines.get(&1).unwrap(), "alice");
        assert_eq!(lines.get(&2).unwrap(), "bob");
    }

    #[test]
    fn post_rejects_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();

        let err = post(dir.path(), &schema, false, false, &salt(), vec![serde_json::json!({"age": 10})]).unwrap_err();
        assert!(matches!(err, InibaseError::FieldRequired { .. }));
    }

    #[test]
    fn post_rejects_duplicate_unique_value() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();

        post(dir.path(), &schema, false, false, &salt(), vec![serde_json::json!({"username": "alice", "age": 1})]).unwrap();
        let err = post(dir.path(), &schema, false, false, &salt(), vec![serde_json::json!({"username": "alice", "age": 2})]).unwrap_err();
        assert!(matches!(err, InibaseError::FieldUnique { .. }));
    }

    #[test]
    fn put_replaces_only_supplied_keys() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();
        post(dir.path(), &schema, false, false, &salt(), vec![serde_json::json!({"username": "alice", "age": 30})]).unwrap();

        put(dir.path(), &schema, false, &salt(), &[1], &serde_json::json!({"age": 31})).unwrap();

        let username_col = table::find_column(&schema, "username").unwrap();
        let (lines, _) = file_engine::get(&table::column_file_path(dir.path(), &username_col, false), &LineSelector::All, false).unwrap();
        assert_eq!(lines.get(&1).unwrap(), "alice", "username untouched by a put that didn't mention it");

        let age_col = table::find_column(&schema, "age").unwrap();
        let (lines, _) = file_engine::get(&table::column_file_path(dir.path(), &age_col, false), &LineSelector::All, false).unwrap();
        assert_eq!(lines.get(&1).unwrap(), "31");
    }

    #[test]
    fn delete_shrinks_total_but_keeps_last_id() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();
        post(
            dir.path(),
            &schema,
            false,
            false,
            &salt(),
            vec![serde_json::json!({"username": "alice", "age": 1}), serde_json::json!({"username": "bob", "age": 2})],
        )
        .unwrap();

        let mut lines = HashSet::new();
        lines.insert(1u64);
        delete(dir.path(), &schema, false, &lines).unwrap();

        let pagination = table::read_pagination(dir.path()).unwrap();
        assert_eq!(pagination, table::Pagination { last_id: 2, total: 1 });
    }

    #[test]
    fn delete_all_when_every_line_removed_unlinks_columns() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema();
        table::create(dir.path(), &schema, crate::config::TableConfig::default(), &salt()).unwrap();
        post(dir.path(), &schema, false, false, &salt(), vec![serde_json::json!({"username": "alice", "age": 1})]).unwrap();

        let mut lines = HashSet::new();
        lines.insert(1u64);
        delete(dir.path(), &schema, false, &lines).unwrap();

        let username_col = table::find_column(&schema, "username").unwrap();
        assert!(!table::column_file_path(dir.path(), &username_col, false).exists());
        let pagination = table::read_pagination(dir.path()).unwrap();
        assert_eq!(pagination, table::Pagination { last_id: 1, total: 0 });
    }
}
