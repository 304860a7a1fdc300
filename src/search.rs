//! Comparison operators and the per-column predicate scan (§4.5, §4.4's
//! `search`).
//!
//! A [`Predicate`] is one or more `(Operator, values)` pairs on a single
//! column, combined with [`Logical::And`]/[`Logical::Or`]; [`search`] walks
//! a column file line by line, decodes each line, and evaluates the
//! predicate against the decoded value.

use crate::codec::{self, FieldKind};
use crate::crypto;
use crate::error::{io_at, Result};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
    Glob,
    NotGlob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logical {
    And,
    Or,
}

/// One or more operator/value(s) pairs against a single column.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub ops: Vec<(Operator, Vec<Value>)>,
    pub logical: Logical,
}

impl Predicate {
    pub fn single(op: Operator, value: Value) -> Self {
        Predicate {
            ops: vec![(op, vec![value])],
            logical: Logical::And,
        }
    }
}

/// Whether `field_value` (already decoded to its declared kind) satisfies
/// one `(op, targets)` pair.
fn matches_one(op: Operator, field_value: &Value, targets: &[Value], kind: FieldKind) -> bool {
    match op {
        Operator::Eq => equals(field_value, targets.first().unwrap_or(&Value::Null), kind),
        Operator::Ne => !equals(field_value, targets.first().unwrap_or(&Value::Null), kind),
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
            let (Some(a), Some(b)) = (as_f64(field_value), targets.first().and_then(as_f64)) else {
                return false;
            };
            match op {
                Operator::Gt => a > b,
                Operator::Lt => a < b,
                Operator::Ge => a >= b,
                Operator::Le => a <= b,
                _ => unreachable!(),
            }
        }
        Operator::In => set_intersects(field_value, targets),
        Operator::NotIn => !set_intersects(field_value, targets),
        Operator::Glob => glob_matches(field_value, targets.first()),
        Operator::NotGlob => !glob_matches(field_value, targets.first()),
    }
}

fn equals(field_value: &Value, target: &Value, kind: FieldKind) -> bool {
    match kind {
        FieldKind::Password => match (field_value.as_str(), target.as_str()) {
            (Some(hash), Some(plain)) => crypto::verify_password(hash, plain),
            _ => false,
        },
        FieldKind::Boolean => as_bool_numeric(field_value) == as_bool_numeric(target),
        _ => match (as_f64(field_value), as_f64(target)) {
            (Some(a), Some(b)) => a == b,
            _ => stringify(field_value) == stringify(target),
        },
    }
}

fn as_bool_numeric(v: &Value) -> i64 {
    match v {
        Value::Bool(b) => *b as i64,
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => match s.as_str() {
            "1" | "true" => 1,
            _ => 0,
        },
        _ => 0,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Either side may be scalar or array; `[]`/`![]` test for non-empty
/// intersection between the two, coercing a scalar to a one-element set.
fn set_intersects(field_value: &Value, targets: &[Value]) -> bool {
    let field_set: Vec<String> = match field_value {
        Value::Array(items) => items.iter().map(stringify).collect(),
        Value::Null => vec![],
        other => vec![stringify(other)],
    };
    let target_set: Vec<String> = targets
        .iter()
        .flat_map(|t| match t {
            Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>(),
            other => vec![stringify(other)],
        })
        .collect();
    field_set.iter().any(|f| target_set.contains(f))
}

fn glob_matches(field_value: &Value, target: Option<&Value>) -> bool {
    let Some(pattern) = target.and_then(Value::as_str) else {
        return false;
    };
    let re = codec::glob_to_regex(pattern);
    re.is_match(&stringify(field_value))
}

pub fn evaluate(predicate: &Predicate, field_value: &Value, kind: FieldKind) -> bool {
    let results = predicate.ops.iter().map(|(op, targets)| matches_one(*op, field_value, targets, kind));
    match predicate.logical {
        Logical::And => results.fold(true, |acc, r| acc && r),
        Logical::Or => results.fold(false, |acc, r| acc || r),
    }
}

/// How many records satisfy a scan, and whether that count is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalCount {
    Exact(u64),
    /// "At least this many" — the scan stopped early at `limit + 1` hits.
    AtLeast(u64),
}

pub struct SearchResult {
    pub hits: BTreeMap<u64, Value>,
    pub total: TotalCount,
}

/// Scan `path` line by line, decoding each with `kind`/`child` (`kind =
/// None` auto-detects a union field per value), evaluating `predicate`
/// against the decoded value. With `limit` set and `read_whole = false`,
/// stops at `limit + 1` hits — the `+1` establishes "more rows exist"
/// without paying for a full scan.
#[allow(clippy::too_many_arguments)]
pub fn search(
    path: &Path,
    predicate: &Predicate,
    kind: Option<FieldKind>,
    child: Option<FieldKind>,
    limit: Option<u64>,
    offset: Option<u64>,
    read_whole: bool,
    compressed: bool,
    salt: &[u8; 32],
) -> Result<SearchResult> {
    if !path.exists() {
        return Ok(SearchResult {
            hits: BTreeMap::new(),
            total: TotalCount::Exact(0),
        });
    }

    let file = File::open(path).map_err(|e| io_at(path, e))?;
    let reader: Box<dyn BufRead> = if compressed {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut hits = BTreeMap::new();
    let mut seen = 0u64;
    let stop_at = limit.map(|l| l + 1);

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_at(path, e))?;
        let line_no = (idx + 1) as u64;
        if line.is_empty() {
            continue;
        }

        let decode_kind = kind.unwrap_or_else(|| codec::detect_type(&line, salt));
        let decoded = codec::decode_typed(&line, decode_kind, child, salt);

        if evaluate(predicate, &decoded, decode_kind) {
            seen += 1;
            if offset.map_or(true, |o| seen > o) {
                hits.insert(line_no, decoded);
            }
            if !read_whole {
                if let Some(stop) = stop_at {
                    if hits.len() as u64 >= stop {
                        return Ok(SearchResult {
                            hits,
                            total: TotalCount::AtLeast(stop - 1),
                        });
                    }
                }
            }
        }
    }

    Ok(SearchResult {
        hits,
        total: TotalCount::Exact(seen),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> [u8; 32] {
        [1u8; 32]
    }

    fn write(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn numeric_range_operator() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "age.txt", "10\n25\n40\n");

        let pred = Predicate::single(Operator::Gt, serde_json::json!(20));
        let result = search(&path, &pred, Some(FieldKind::Number), None, None, None, true, false, &salt()).unwrap();
        assert_eq!(result.hits.len(), 2);
        assert!(result.hits.contains_key(&2));
        assert!(result.hits.contains_key(&3));
    }

    #[test]
    fn set_membership_excludes_any_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "foods.txt", "Pizza,Tacos\nSalad,Soup\nBurger\n");

        let pred = Predicate::single(Operator::NotIn, serde_json::json!(["Pizza", "Burger"]));
        let result = search(&path, &pred, Some(FieldKind::Array), Some(FieldKind::String), None, None, true, false, &salt()).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits.contains_key(&2));
    }

    #[test]
    fn limit_short_circuits_with_at_least_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "n.txt", "1\n2\n3\n4\n5\n");

        let pred = Predicate::single(Operator::Gt, serde_json::json!(0));
        let result = search(&path, &pred, Some(FieldKind::Number), None, Some(2), None, false, false, &salt()).unwrap();
        assert_eq!(result.hits.len(), 3);
        assert_eq!(result.total, TotalCount::AtLeast(2));
    }

    #[test]
    fn password_equality_uses_constant_time_verify() {
        let dir = tempfile::tempdir().unwrap();
        let hash = crypto::hash_password("hunter2");
        let path = write(dir.path(), "password.txt", &format!("{hash}\n"));

        let pred = Predicate::single(Operator::Eq, serde_json::json!("hunter2"));
        let result = search(&path, &pred, Some(FieldKind::Password), None, None, None, true, false, &salt()).unwrap();
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn glob_wildcard_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "name.txt", "Alice\nBob\nAlicia\n");

        let pred = Predicate::single(Operator::Glob, serde_json::json!("al%"));
        let result = search(&path, &pred, Some(FieldKind::String), None, None, None, true, false, &salt()).unwrap();
        assert_eq!(result.hits.len(), 2);
    }
}
