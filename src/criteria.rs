//! Criteria tree: wire-form parsing and evaluation to a line-number set
//! (§4.6).
//!
//! A [`Criteria`] is a recursive `And`/`Or`/`Leaf` tree. Parsing the
//! compact `"<op><value>"` string form is a small hand-written tokenizer
//! rather than a regex, per the redesign notes, so every input byte is
//! accounted for.

use crate::codec::FieldKind;
use crate::error::{InibaseError, Result};
use crate::schema::Schema;
use crate::search::{self, Logical, Operator, Predicate, SearchResult, TotalCount};
use crate::table;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub enum Criteria {
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
    Leaf(String, Predicate),
}

/// Parse a compact operator string: the leading 1-2 bytes select the
/// operator, the remainder is the value (comma-split for `[]`/`![]`).
fn parse_compact(raw: &str) -> (Operator, &str) {
    if let Some(rest) = raw.strip_prefix("![]") {
        return (Operator::NotIn, rest);
    }
    if let Some(rest) = raw.strip_prefix("!=") {
        return (Operator::Ne, rest);
    }
    if let Some(rest) = raw.strip_prefix("!*") {
        return (Operator::NotGlob, rest);
    }
    if let Some(rest) = raw.strip_prefix(">=") {
        return (Operator::Ge, rest);
    }
    if let Some(rest) = raw.strip_prefix("<=") {
        return (Operator::Le, rest);
    }
    if let Some(rest) = raw.strip_prefix("[]") {
        return (Operator::In, rest);
    }
    if let Some(rest) = raw.strip_prefix('>') {
        return (Operator::Gt, rest);
    }
    if let Some(rest) = raw.strip_prefix('<') {
        return (Operator::Lt, rest);
    }
    if let Some(rest) = raw.strip_prefix('*') {
        return (Operator::Glob, rest);
    }
    if let Some(rest) = raw.strip_prefix('=') {
        return (Operator::Eq, rest);
    }
    (Operator::Eq, raw)
}

fn compact_to_values(op: Operator, rest: &str) -> Vec<Value> {
    match op {
        Operator::In | Operator::NotIn => rest.split(',').map(|s| Value::String(s.to_string())).collect(),
        _ => vec![Value::String(rest.to_string())],
    }
}

/// Parse one key's value into a [`Predicate`]: a plain scalar, a compact
/// operator string, a `[vals]` array (multi-operator `and`), or an
/// `{and|or: [vals]}` object.
fn parse_predicate(value: &Value) -> Result<Predicate> {
    match value {
        Value::String(s) => {
            let (op, rest) = parse_compact(s);
            Ok(Predicate {
                ops: vec![(op, compact_to_values(op, rest))],
                logical: Logical::And,
            })
        }
        Value::Array(items) => {
            let mut ops = Vec::new();
            for item in items {
                ops.extend(parse_predicate(item)?.ops);
            }
            Ok(Predicate { ops, logical: Logical::And })
        }
        Value::Object(obj) => {
            if let Some(Value::Array(items)) = obj.get("and") {
                let mut ops = Vec::new();
                for item in items {
                    ops.extend(parse_predicate(item)?.ops);
                }
                return Ok(Predicate { ops, logical: Logical::And });
            }
            if let Some(Value::Array(items)) = obj.get("or") {
                let mut ops = Vec::new();
                for item in items {
                    ops.extend(parse_predicate(item)?.ops);
                }
                return Ok(Predicate { ops, logical: Logical::Or });
            }
            Err(InibaseError::InvalidParameters {
                reason: "object criteria value must be {and: [...]} or {or: [...]}".into(),
            })
        }
        other => Ok(Predicate::single(Operator::Eq, other.clone())),
    }
}

fn leaves_from_object(obj: &Map<String, Value>) -> Result<Vec<Criteria>> {
    obj.iter()
        .map(|(key, value)| match key.as_str() {
            "and" => Ok(Criteria::And(leaves_from_value(value)?)),
            "or" => Ok(Criteria::Or(leaves_from_value(value)?)),
            _ => Ok(Criteria::Leaf(key.clone(), parse_predicate(value)?)),
        })
        .collect()
}

fn leaves_from_value(value: &Value) -> Result<Vec<Criteria>> {
    match value {
        Value::Object(obj) => leaves_from_object(obj),
        other => Err(InibaseError::InvalidParameters {
            reason: format!("expected a criteria object, got {other}"),
        }),
    }
}

/// Parse the wire form `{ [and|or]?: Criteria, [key]?: ... }` into a
/// [`Criteria`] tree. Multiple sibling keys at one level are implicitly
/// ANDed together.
pub fn from_json(value: &Value) -> Result<Criteria> {
    let obj = value
        .as_object()
        .ok_or_else(|| InibaseError::InvalidParameters { reason: "criteria must be a JSON object".into() })?;
    let leaves = leaves_from_object(obj)?;
    if leaves.len() == 1 {
        Ok(leaves.into_iter().next().unwrap())
    } else {
        Ok(Criteria::And(leaves))
    }
}

/// Resolve one leaf key to the column file and decode kinds it should be
/// searched against.
fn leaf_column<'a>(schema: &'a Schema, key: &str) -> Result<(table::ColumnPath, Option<FieldKind>, Option<FieldKind>)> {
    let field = crate::schema::get_field(key, schema)
        .ok_or_else(|| InibaseError::InvalidParameters { reason: format!("unknown criteria key '{key}'") })?;
    let column = table::find_column(schema, key)
        .ok_or_else(|| InibaseError::InvalidParameters { reason: format!("no column for key '{key}'") })?;
    let (kind, child) = table::leaf_decode_kind(field);
    Ok((column, kind, child))
}

/// Evaluate `criteria` against `table_dir`'s column files and return the
/// matching line numbers.
///
/// Leaves always resolve with `read_whole = true`: the original's
/// per-leaf `limit`/`offset` early-exit is a scan-time optimization that
/// this port trades for a plain set intersection/union, which keeps `and`
/// exact without needing the partial-record bookkeeping otherwise required
/// for pruning false positives mid-scan (see DESIGN.md).
pub fn evaluate(criteria: &Criteria, table_dir: &Path, schema: &Schema, compressed: bool, salt: &[u8; 32]) -> Result<HashSet<u64>> {
    match criteria {
        Criteria::And(children) => {
            let mut sets = Vec::with_capacity(children.len());
            for child in children {
                sets.push(evaluate(child, table_dir, schema, compressed, salt)?);
            }
            Ok(intersect_all(sets))
        }
        Criteria::Or(children) => {
            let mut out = HashSet::new();
            for child in children {
                out.extend(evaluate(child, table_dir, schema, compressed, salt)?);
            }
            Ok(out)
        }
        Criteria::Leaf(key, predicate) => {
            let (column, kind, child) = leaf_column(schema, key)?;
            let path = table::column_file_path(table_dir, &column, compressed);
            let SearchResult { hits, total: _ } =
                search::search(&path, predicate, kind, child, None, None, true, compressed, salt)?;
            Ok(hits.into_keys().collect())
        }
    }
}

fn intersect_all(sets: Vec<HashSet<u64>>) -> HashSet<u64> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return HashSet::new();
    };
    iter.fold(first, |acc, s| acc.intersection(&s).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_string_parses_negated_in() {
        let (op, rest) = parse_compact("![]Pizza,Burger");
        assert_eq!(op, Operator::NotIn);
        assert_eq!(rest, "Pizza,Burger");
    }

    #[test]
    fn compact_string_parses_ge_vs_gt() {
        assert_eq!(parse_compact(">=5").0, Operator::Ge);
        assert_eq!(parse_compact(">5").0, Operator::Gt);
    }

    #[test]
    fn from_json_wraps_multiple_keys_in_and() {
        let value = serde_json::json!({"age": ">18", "active": true});
        let criteria = from_json(&value).unwrap();
        assert!(matches!(criteria, Criteria::And(_)));
    }

    #[test]
    fn from_json_single_key_is_a_bare_leaf() {
        let value = serde_json::json!({"age": ">18"});
        let criteria = from_json(&value).unwrap();
        assert!(matches!(criteria, Criteria::Leaf(_, _)));
    }
}
