//! Record assembly — the `get` pipeline (§4.7).
//!
//! Resolves `where` to a set of line numbers, walks the (optionally
//! column-filtered) schema once per line range, and reassembles nested
//! documents from the column files that back each leaf field. Foreign
//! `table` fields recurse into the referenced table, guarded by a join
//! depth cap and same-table cycle detection (§9).
//!
//! Simplification from the original: array-of-object fields nested inside
//! another array-of-object are not assembled (the inner field is dropped)
//! — doubly-nested array-of-object is rare enough in practice that
//! supporting it would roughly double this module's size for a shape most
//! schemas never use. See DESIGN.md.

use crate::codec::{self, FieldKind};
use crate::crypto;
use crate::engine::Engine;
use crate::error::{InibaseError, Result};
use crate::file_engine::{self, LineSelector};
use crate::query::{self, Options, Where};
use crate::schema::{self, Children, Field, FieldType, Schema};
use crate::sort;
use crate::table;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PageInfo {
    fn new(options: &Options, total: u64) -> Self {
        let total_pages = if options.per_page == 0 { 0 } else { (total + options.per_page - 1) / options.per_page };
        PageInfo {
            page: options.page,
            per_page: options.per_page,
            total,
            total_pages,
        }
    }
}

pub fn get(
    engine: &Engine,
    table: &str,
    where_: Option<&Where>,
    options: &Options,
    only_one: bool,
    only_line_numbers: bool,
) -> Result<(Option<Value>, Option<PageInfo>)> {
    get_inner(engine, table, where_, options, only_one, only_line_numbers, 0, &[])
}

fn get_inner(
    engine: &Engine,
    table_name: &str,
    where_: Option<&Where>,
    options: &Options,
    only_one: bool,
    only_line_numbers: bool,
    depth: u32,
    visited: &[String],
) -> Result<(Option<Value>, Option<PageInfo>)> {
    if visited.iter().any(|t| t == table_name) || depth > engine.config().join_depth_cap {
        return Err(InibaseError::JoinDepthExceeded {
            table: table_name.to_string(),
            depth,
        });
    }
    let mut visited = visited.to_vec();
    visited.push(table_name.to_string());

    let table_dir = engine.table_dir(table_name);
    let salt = engine.config().salt;
    let schema = table::read_schema(&table_dir, &salt)?;
    let compressed = table::is_compressed(&table_dir);
    let cache_enabled = table::is_cache_enabled(&table_dir);
    let pagination = table::read_pagination(&table_dir)?;

    if pagination.total == 0 && where_.is_none() {
        return Ok((None, None));
    }

    let filtered_schema = if options.columns.is_empty() { schema.clone() } else { schema::filter(&schema, &options.columns) };

    if let Some(sort_spec) = &options.sort {
        let restrict = match where_ {
            Some(w) => Some(query::resolve_where(&table_dir, &schema, compressed, &salt, w)?),
            None => None,
        };
        let sorted = sort::resolve_sorted_lines(&table_dir, &schema, compressed, cache_enabled, sort_spec, restrict.as_ref())?;
        let total = sorted.len() as u64;
        let (first, last) = options.line_window();
        let page_lines: Vec<u64> = sorted
            .into_iter()
            .skip(first.saturating_sub(1) as usize)
            .take((last + 1).saturating_sub(first) as usize)
            .collect();
        return finish(
            engine, &table_dir, &schema, &filtered_schema, compressed, &salt, &page_lines, total, options, only_one, only_line_numbers, depth, &visited,
        );
    }

    let (lines, total): (Vec<u64>, u64) = match where_ {
        None => {
            let (first, last) = options.line_window();
            let last = last.min(pagination.total);
            if first > last {
                (vec![], pagination.total)
            } else {
                ((first..=last).collect(), pagination.total)
            }
        }
        Some(Where::All) => ((1..=pagination.total).collect(), pagination.total),
        Some(Where::Line(n)) => (vec![*n], 1),
        Some(Where::Lines(v)) => {
            let total = v.len() as u64;
            (v.clone(), total)
        }
        Some(Where::Id(opaque)) => {
            let id = crypto::decode_id(opaque, &salt).ok_or_else(|| InibaseError::InvalidId { id: opaque.clone() })?;
            let id_map = query::raw_id_line_map(&table_dir, &schema, compressed)?;
            let v: Vec<u64> = id_map.get(&id).copied().into_iter().collect();
            let total = v.len() as u64;
            (v, total)
        }
        Some(Where::Ids(opaques)) => {
            // Resolve id -> line directly rather than through a `HashSet`,
            // so the returned lines stay in the same order the ids were
            // requested in instead of line-number order.
            let id_map = query::raw_id_line_map(&table_dir, &schema, compressed)?;
            let mut v = Vec::with_capacity(opaques.len());
            for opaque in opaques {
                let id = crypto::decode_id(opaque, &salt).ok_or_else(|| InibaseError::InvalidId { id: opaque.clone() })?;
                if let Some(line) = id_map.get(&id) {
                    v.push(*line);
                }
            }
            let total = v.len() as u64;
            (v, total)
        }
        Some(w @ Where::Criteria(_)) => {
            let set = query::resolve_where(&table_dir, &schema, compressed, &salt, w)?;
            let mut v: Vec<u64> = set.into_iter().collect();
            let (first, last) = options.line_window();
            v.sort_unstable();
            let total = v.len() as u64;
            let windowed: Vec<u64> = v
                .into_iter()
                .skip(first.saturating_sub(1) as usize)
                .take((last + 1).saturating_sub(first) as usize)
                .collect();
            return finish(
                engine, &table_dir, &schema, &filtered_schema, compressed, &salt, &windowed, total, options, only_one, only_line_numbers, depth, &visited,
            );
        }
    };

    finish(
        engine, &table_dir, &schema, &filtered_schema, compressed, &salt, &lines, total, options, only_one, only_line_numbers, depth, &visited,
    )
}

fn read_column_raw(table_dir: &Path, column: &table::ColumnPath, compressed: bool, lines: &[u64]) -> Result<BTreeMap<u64, String>> {
    let path = table::column_file_path(table_dir, column, compressed);
    let selector = LineSelector::Lines(lines.iter().copied().collect());
    Ok(file_engine::get(&path, &selector, compressed)?.0)
}

#[allow(clippy::too_many_arguments)]
fn finish(
    engine: &Engine,
    table_dir: &Path,
    full_schema: &Schema,
    filtered_schema: &Schema,
    compressed: bool,
    salt: &[u8; 32],
    lines: &[u64],
    total: u64,
    options: &Options,
    only_one: bool,
    only_line_numbers: bool,
    depth: u32,
    visited: &[String],
) -> Result<(Option<Value>, Option<PageInfo>)> {
    if only_line_numbers {
        let arr = Value::Array(lines.iter().map(|&n| Value::Number(n.into())).collect());
        return Ok((Some(arr), None));
    }
    if lines.is_empty() {
        return Ok((None, None));
    }

    let column_index: HashMap<String, table::ColumnPath> = table::column_paths(full_schema).into_iter().map(|c| (c.dotted.clone(), c)).collect();

    let assembled = process_schema(engine, table_dir, &column_index, "", filtered_schema, lines, compressed, salt, depth, visited)?;

    let mut records: Vec<Value> = Vec::with_capacity(lines.len());
    for &line in lines {
        if let Some(map) = assembled.get(&line) {
            records.push(Value::Object(map.clone()));
        }
    }

    let page_info = Some(PageInfo::new(options, total));

    if only_one {
        Ok((records.into_iter().next(), page_info))
    } else {
        Ok((Some(Value::Array(records)), page_info))
    }
}

#[allow(clippy::too_many_arguments)]
fn process_schema(
    engine: &Engine,
    table_dir: &Path,
    column_index: &HashMap<String, table::ColumnPath>,
    prefix: &str,
    schema: &Schema,
    lines: &[u64],
    compressed: bool,
    salt: &[u8; 32],
    depth: u32,
    visited: &[String],
) -> Result<BTreeMap<u64, Map<String, Value>>> {
    let mut out: BTreeMap<u64, Map<String, Value>> = lines.iter().map(|&l| (l, Map::new())).collect();

    for field in schema {
        let dotted_key = format!("{prefix}{}", field.key);

        match (&field.field_type, field.children.as_deref()) {
            (FieldType::Single(FieldKind::Object), Some(Children::Schema(sub))) => {
                let nested_prefix = format!("{dotted_key}.");
                let nested = process_schema(engine, table_dir, column_index, &nested_prefix, sub, lines, compressed, salt, depth, visited)?;
                for &line in lines {
                    if let Some(map) = nested.get(&line) {
                        if !map.is_empty() && !map.values().all(Value::is_null) {
                            out.get_mut(&line).unwrap().insert(field.key.clone(), Value::Object(map.clone()));
                        }
                    }
                }
            }
            (FieldType::Single(FieldKind::Array), Some(Children::Schema(sub))) => {
                let hop_prefix = format!("{dotted_key}.*.");
                let arrays = assemble_array_of_object(table_dir, column_index, &hop_prefix, sub, lines, compressed, salt)?;
                for &line in lines {
                    let items = arrays.get(&line).cloned().unwrap_or_default();
                    out.get_mut(&line).unwrap().insert(field.key.clone(), Value::Array(items));
                }
            }
            (FieldType::Single(FieldKind::Table), _) => {
                assemble_join(engine, table_dir, column_index, &dotted_key, field, lines, compressed, salt, depth, visited, &mut out)?;
            }
            _ => {
                let Some(column) = column_index.get(&dotted_key) else { continue };
                let (kind, child) = table::leaf_decode_kind(field);
                let raw = read_column_raw(table_dir, column, compressed, lines)?;
                for &line in lines {
                    let raw_val = raw.get(&line).cloned().unwrap_or_default();
                    let decoded = match kind {
                        Some(k) => codec::decode_typed(&raw_val, k, child, salt),
                        None => codec::decode_auto(&raw_val, salt),
                    };
                    out.get_mut(&line).unwrap().insert(field.key.clone(), decoded);
                }
            }
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn assemble_join(
    engine: &Engine,
    table_dir: &Path,
    column_index: &HashMap<String, table::ColumnPath>,
    dotted_key: &str,
    field: &Field,
    lines: &[u64],
    compressed: bool,
    salt: &[u8; 32],
    depth: u32,
    visited: &[String],
    out: &mut BTreeMap<u64, Map<String, Value>>,
) -> Result<()> {
    let Some(column) = column_index.get(dotted_key) else { return Ok(()) };
    let Some(foreign_table) = &field.table else { return Ok(()) };
    let raw = read_column_raw(table_dir, column, compressed, lines)?;

    let mut per_line_id: HashMap<u64, u64> = HashMap::new();
    let mut wanted = HashSet::new();
    for (&line, raw_val) in &raw {
        if let Ok(id) = raw_val.parse::<u64>() {
            per_line_id.insert(line, id);
            wanted.insert(id);
        }
    }
    if wanted.is_empty() {
        return Ok(());
    }
    if visited.iter().any(|t| t == foreign_table) || depth + 1 > engine.config().join_depth_cap {
        return Err(InibaseError::JoinDepthExceeded {
            table: foreign_table.clone(),
            depth: depth + 1,
        });
    }

    let foreign_dir = engine.table_dir(foreign_table);
    let foreign_schema = table::read_schema(&foreign_dir, salt)?;
    let foreign_compressed = table::is_compressed(&foreign_dir);
    let foreign_id_map = query::raw_id_line_map(&foreign_dir, &foreign_schema, foreign_compressed)?;
    let foreign_lines: Vec<u64> = wanted.iter().filter_map(|id| foreign_id_map.get(id).copied()).collect();
    if foreign_lines.is_empty() {
        return Ok(());
    }

    let (value, _) = get_inner(
        engine,
        foreign_table,
        Some(&Where::Lines(foreign_lines)),
        &Options::default(),
        false,
        false,
        depth + 1,
        visited,
    )?;

    let by_id: HashMap<u64, Value> = match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|record| {
                let opaque = record.get("id")?.as_str()?;
                let id = crypto::decode_id(opaque, salt)?;
                Some((id, record))
            })
            .collect(),
        _ => HashMap::new(),
    };

    for &line in lines {
        if let Some(id) = per_line_id.get(&line) {
            if let Some(record) = by_id.get(id) {
                out.get_mut(&line).unwrap().insert(field.key.clone(), record.clone());
            }
        }
    }
    Ok(())
}

fn insert_dotted(obj: &mut Map<String, Value>, dotted_key: &str, value: Value) {
    let mut segments = dotted_key.splitn(2, '.');
    let head = segments.next().unwrap_or(dotted_key);
    match segments.next() {
        None => {
            obj.insert(head.to_string(), value);
        }
        Some(rest) => {
            let entry = obj.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(sub) = entry {
                insert_dotted(sub, rest, value);
            }
        }
    }
}

/// Flatten `schema`'s leaves (recursing through nested `object` fields, not
/// through a further nested array-of-object) into per-line decoded arrays,
/// one entry per leaf, keyed by its dotted path relative to `schema`.
fn collect_leaf_vecs(
    table_dir: &Path,
    column_index: &HashMap<String, table::ColumnPath>,
    prefix: &str,
    schema: &Schema,
    lines: &[u64],
    compressed: bool,
    salt: &[u8; 32],
) -> Result<Vec<(String, BTreeMap<u64, Vec<Value>>)>> {
    let mut out = Vec::new();
    for field in schema {
        let dotted_key = format!("{prefix}{}", field.key);
        match field.children.as_deref() {
            Some(Children::Schema(sub)) if matches!(field.field_type, FieldType::Single(FieldKind::Object)) => {
                let nested = collect_leaf_vecs(table_dir, column_index, &format!("{dotted_key}."), sub, lines, compressed, salt)?;
                for (key, values) in nested {
                    out.push((format!("{}.{}", field.key, key), values));
                }
            }
            Some(Children::Schema(_)) => continue, // nested array-of-object: unsupported, see module docs
            _ => {
                let Some(column) = column_index.get(&dotted_key) else { continue };
                let (_, child) = table::leaf_decode_kind(field);
                let raw = read_column_raw(table_dir, column, compressed, lines)?;
                let decoded: BTreeMap<u64, Vec<Value>> = lines
                    .iter()
                    .map(|&line| {
                        let raw_val = raw.get(&line).cloned().unwrap_or_default();
                        let value = codec::decode_typed(&raw_val, FieldKind::Array, child, salt);
                        let items = match value {
                            Value::Array(items) => items,
                            other => vec![other],
                        };
                        (line, items)
                    })
                    .collect();
                out.push((field.key.clone(), decoded));
            }
        }
    }
    Ok(out)
}

fn assemble_array_of_object(
    table_dir: &Path,
    column_index: &HashMap<String, table::ColumnPath>,
    prefix: &str,
    sub_schema: &Schema,
    lines: &[u64],
    compressed: bool,
    salt: &[u8; 32],
) -> Result<BTreeMap<u64, Vec<Value>>> {
    let leaves = collect_leaf_vecs(table_dir, column_index, prefix, sub_schema, lines, compressed, salt)?;
    let mut out = BTreeMap::new();
    for &line in lines {
        let max_len = leaves.iter().filter_map(|(_, m)| m.get(&line).map(Vec::len)).max().unwrap_or(0);
        let mut records = Vec::with_capacity(max_len);
        for idx in 0..max_len {
            let mut obj = Map::new();
            for (key, m) in &leaves {
                let item = m.get(&line).and_then(|v| v.get(idx)).cloned().unwrap_or(Value::Null);
                insert_dotted(&mut obj, key, item);
            }
            records.push(Value::Object(obj));
        }
        out.insert(line, records);
    }
    Ok(out)
}
