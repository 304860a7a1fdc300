//! `where`/`options` polymorphism (§9's redesign guidance): instead of the
//! original's `number | id | list | criteria` argument, callers build an
//! explicit [`Where`] enum, and pagination/column/sort knobs live in
//! [`Options`].

use crate::criteria::{self, Criteria};
use crate::crypto;
use crate::error::{InibaseError, Result};
use crate::file_engine::{self, LineSelector};
use crate::schema::Schema;
use crate::table;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How a `get`/`put`/`delete` call selects records.
///
/// [`Where::All`] exists only so "operate on every record" must be spelled
/// out explicitly in the Rust API — the original allows `put`/`delete`
/// with no `where` argument at all to mean "all records", which is easy to
/// trigger by accident from a missing/`None` value; requiring this marker
/// closes that footgun while keeping the behavior reachable.
#[derive(Debug, Clone)]
pub enum Where {
    Line(u64),
    Lines(Vec<u64>),
    Id(String),
    Ids(Vec<String>),
    Criteria(Criteria),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) if s.eq_ignore_ascii_case("asc") => Some(SortDirection::Asc),
            Value::String(s) if s.eq_ignore_ascii_case("desc") => Some(SortDirection::Desc),
            Value::Number(n) if n.as_i64() == Some(1) => Some(SortDirection::Asc),
            Value::Number(n) if n.as_i64() == Some(-1) => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// `"col"`, `["col", ...]` (ascending by default), or `{col: direction}`.
#[derive(Debug, Clone)]
pub struct SortSpec(pub Vec<(String, SortDirection)>);

impl SortSpec {
    pub fn from_json(value: &Value) -> Result<Self> {
        let keys = match value {
            Value::String(s) => vec![(s.clone(), SortDirection::Asc)],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| (s.to_string(), SortDirection::Asc))
                .collect(),
            Value::Object(obj) => obj
                .iter()
                .map(|(k, v)| {
                    let dir = SortDirection::from_json(v).ok_or_else(|| InibaseError::InvalidParameters {
                        reason: format!("invalid sort direction for '{k}'"),
                    })?;
                    Ok((k.clone(), dir))
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(InibaseError::InvalidParameters {
                    reason: format!("invalid sort spec: {other}"),
                })
            }
        };
        if keys.is_empty() {
            return Err(InibaseError::InvalidParameters { reason: "sort spec has no keys".into() });
        }
        Ok(SortSpec(keys))
    }
}

/// `columns`/`page`/`perPage`/`sort`, defaulting per §6 (`page=1,
/// perPage=15`).
#[derive(Debug, Clone)]
pub struct Options {
    pub page: u64,
    pub per_page: u64,
    pub columns: Vec<String>,
    pub sort: Option<SortSpec>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page: 1,
            per_page: 15,
            columns: Vec::new(),
            sort: None,
        }
    }
}

impl Options {
    /// The 1-based `(first_line, last_line)` window this page covers.
    pub fn line_window(&self) -> (u64, u64) {
        let first = (self.page.saturating_sub(1)) * self.per_page + 1;
        let last = self.page * self.per_page;
        (first, last)
    }
}

/// Resolve any [`Where`] variant to its matching line numbers against
/// `table_dir`. Shared by the assembler (`get`) and the mutation pipeline
/// (`put`/`delete`), which both need "which lines does this `where` touch"
/// without otherwise depending on one another.
pub fn resolve_where(table_dir: &Path, schema: &Schema, compressed: bool, salt: &[u8; 32], where_: &Where) -> Result<HashSet<u64>> {
    match where_ {
        Where::Id(opaque) => {
            let id = crypto::decode_id(opaque, salt).ok_or_else(|| InibaseError::InvalidId { id: opaque.clone() })?;
            let id_map = raw_id_line_map(table_dir, schema, compressed)?;
            Ok(id_map.get(&id).copied().into_iter().collect())
        }
        Where::Ids(opaques) => {
            let id_map = raw_id_line_map(table_dir, schema, compressed)?;
            let mut lines = HashSet::new();
            for opaque in opaques {
                let id = crypto::decode_id(opaque, salt).ok_or_else(|| InibaseError::InvalidId { id: opaque.clone() })?;
                if let Some(line) = id_map.get(&id) {
                    lines.insert(*line);
                }
            }
            Ok(lines)
        }
        Where::Criteria(c) => criteria::evaluate(c, table_dir, schema, compressed, salt),
        Where::Line(n) => Ok(std::iter::once(*n).collect()),
        Where::Lines(v) => Ok(v.iter().copied().collect()),
        Where::All => {
            let pagination = table::read_pagination(table_dir)?;
            Ok((1..=pagination.total).collect())
        }
    }
}

/// Scan the `id` column's raw (unencrypted) integer lines into a
/// `raw id -> line number` map, used for opaque-id and foreign-key lookups
/// without re-encrypting on every comparison.
pub fn raw_id_line_map(table_dir: &Path, schema: &Schema, compressed: bool) -> Result<HashMap<u64, u64>> {
    let Some(column) = table::find_column(schema, "id") else {
        return Ok(HashMap::new());
    };
    let path = table::column_file_path(table_dir, &column, compressed);
    let (raw, _) = file_engine::get(&path, &LineSelector::All, compressed)?;
    Ok(raw.into_iter().filter_map(|(line, v)| v.parse::<u64>().ok().map(|id| (id, line))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_window_follows_page_and_per_page() {
        let opts = Options { page: 3, per_page: 10, ..Default::default() };
        assert_eq!(opts.line_window(), (21, 30));
    }

    #[test]
    fn sort_spec_accepts_all_three_shapes() {
        assert!(SortSpec::from_json(&serde_json::json!("age")).is_ok());
        assert!(SortSpec::from_json(&serde_json::json!(["age", "name"])).is_ok());
        let by_object = SortSpec::from_json(&serde_json::json!({"age": "desc"})).unwrap();
        assert_eq!(by_object.0[0].1, SortDirection::Desc);
    }
}
