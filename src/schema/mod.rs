//! Typed field tree, path resolution, and schema (de)serialization (§4.3).
//!
//! A [`Schema`] is a flat `Vec<Field>` at each nesting level; `children`
//! carries either a nested `Schema` (for `object` and array-of-object) or a
//! [`FieldType`] (for array-of-scalar/union/table). Field ids are
//! monotonic and stable across renames — see [`addIds`] — and are the
//! external, opaque half of the on-disk `schema.json` (§6).

mod diff;

pub use diff::{diff_schema, RenamePlan};

use crate::codec::FieldKind;
use crate::crypto;
use crate::error::{InibaseError, Result};
use serde_json::Value;

/// A field's declared type: a single kind, or a union resolved per-value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Single(FieldKind),
    Union(Vec<FieldKind>),
}

impl FieldType {
    pub fn contains(&self, kind: FieldKind) -> bool {
        match self {
            FieldType::Single(k) => *k == kind,
            FieldType::Union(ks) => ks.contains(&kind),
        }
    }

    /// The "representative" kind used where a decision must be made
    /// without a concrete value to detect from (e.g. building a column's
    /// default value).
    fn dominant(&self) -> FieldKind {
        match self {
            FieldType::Single(k) => *k,
            FieldType::Union(ks) => {
                // getDefaultValue's documented preference order: array, then
                // string, then number, falling back to the first listed kind.
                for preferred in [FieldKind::Array, FieldKind::String, FieldKind::Number] {
                    if ks.contains(&preferred) {
                        return preferred;
                    }
                }
                ks.first().copied().unwrap_or(FieldKind::String)
            }
        }
    }
}

/// Nested schema for `object` fields, or the element type for `array`
/// fields — either a scalar/union [`FieldType`] or, for array-of-object, a
/// nested [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub enum Children {
    Type(FieldType),
    Schema(Schema),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: u32,
    pub key: String,
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
    pub table: Option<String>,
    pub children: Option<Box<Children>>,
}

impl Field {
    pub fn scalar(id: u32, key: &str, kind: FieldKind) -> Self {
        Field {
            id,
            key: key.to_string(),
            field_type: FieldType::Single(kind),
            required: false,
            unique: false,
            table: None,
            children: None,
        }
    }
}

pub type Schema = Vec<Field>;

/// The three fields every reader implicitly adds: `id` (field id 0,
/// required), `createdAt`, `updatedAt` — prepended/appended around the
/// user's declared fields.
pub fn with_implicit_fields(mut user_fields: Schema, next_id: &mut u32) -> Schema {
    let mut id_field = Field::scalar(0, "id", FieldKind::Id);
    id_field.required = true;

    for f in &mut user_fields {
        if f.id == 0 {
            f.id = *next_id;
            *next_id += 1;
        }
    }

    let created_at = Field::scalar(*next_id, "createdAt", FieldKind::Date);
    *next_id += 1;
    let updated_at = Field::scalar(*next_id, "updatedAt", FieldKind::Date);
    *next_id += 1;

    let mut out = Vec::with_capacity(user_fields.len() + 3);
    out.push(id_field);
    out.extend(user_fields);
    out.push(created_at);
    out.push(updated_at);
    out
}

/// Assign ids to every field in `schema` missing one (`id == 0` and not the
/// literal `id` field), starting the counter from the greatest id anywhere
/// in the tree — including ids freed by field removal, tracked by the
/// `<N>.schema` high-water-mark marker passed in as `starting_from`.
pub fn add_ids(schema: &mut Schema, starting_from: u32) -> u32 {
    let mut next = highest_id(schema).max(starting_from) + 1;
    assign_missing_ids(schema, &mut next);
    next - 1
}

fn highest_id(schema: &Schema) -> u32 {
    let mut max = 0;
    for f in schema {
        max = max.max(f.id);
        if let Some(children) = &f.children {
            if let Children::Schema(sub) = children.as_ref() {
                max = max.max(highest_id(sub));
            }
        }
    }
    max
}

fn assign_missing_ids(schema: &mut Schema, next: &mut u32) {
    for f in schema {
        if f.id == 0 && f.key != "id" {
            f.id = *next;
            *next += 1;
        }
        if let Some(children) = &mut f.children {
            if let Children::Schema(sub) = children.as_mut() {
                assign_missing_ids(sub, next);
            }
        }
    }
}

/// Resolve a dotted path (with `.*.` hops through array-of-object
/// ancestors already stripped by the caller, see [`crate::table::ColumnPath`])
/// to the [`Field`] it names.
pub fn get_field<'a>(path: &str, schema: &'a Schema) -> Option<&'a Field> {
    let mut segments = path.split('.').filter(|s| !s.is_empty() && *s != "*");
    let mut current = schema;
    let mut found = None;
    for seg in &mut segments {
        found = current.iter().find(|f| f.key == seg);
        match found {
            Some(f) => match f.children.as_deref() {
                Some(Children::Schema(sub)) => current = sub,
                _ => current = &[],
            },
            None => return None,
        }
    }
    found
}

/// Flatten a schema into `(dotted.path, &Field)` pairs, the view used for
/// sort-key and uniqueness lookups (`.*.` array-of-object hops included).
pub fn flatten(schema: &Schema) -> Vec<(String, &Field)> {
    let mut out = Vec::new();
    flatten_into(schema, "", &mut out);
    out
}

fn flatten_into<'a>(schema: &'a Schema, prefix: &str, out: &mut Vec<(String, &'a Field)>) {
    for f in schema {
        let path = if prefix.is_empty() {
            f.key.clone()
        } else {
            format!("{prefix}.{}", f.key)
        };
        out.push((path.clone(), f));
        if let Some(children) = f.children.as_deref() {
            match children {
                Children::Schema(sub) => flatten_into(sub, &path, out),
                Children::Type(_) => {}
            }
        }
    }
}

/// Filter a schema down to the dotted paths selected by `columns`
/// (`!col` excludes, bare `col` is an inclusive allow-list — an empty
/// `columns` with no inclusions means "everything").
pub fn filter(schema: &Schema, columns: &[String]) -> Schema {
    let (excludes, includes): (Vec<&String>, Vec<&String>) =
        columns.iter().partition(|c| c.starts_with('!'));
    let excludes: Vec<String> = excludes.iter().map(|c| c[1..].to_string()).collect();
    let includes: Vec<String> = includes.iter().map(|c| c.to_string()).collect();

    filter_level(schema, &includes, &excludes, "")
}

fn filter_level(schema: &Schema, includes: &[String], excludes: &[String], prefix: &str) -> Schema {
    schema
        .iter()
        .filter_map(|f| {
            let path = if prefix.is_empty() {
                f.key.clone()
            } else {
                format!("{prefix}.{}", f.key)
            };
            if excludes.iter().any(|e| e == &path) {
                return None;
            }
            if !includes.is_empty()
                && !includes.iter().any(|i| i == &path || i.starts_with(&format!("{path}.")))
                && f.key != "id"
            {
                return None;
            }
            let mut field = f.clone();
            if let Some(children) = f.children.as_deref() {
                if let Children::Schema(sub) = children {
                    let filtered = filter_level(sub, includes, excludes, &path);
                    field.children = Some(Box::new(Children::Schema(filtered)));
                }
            }
            Some(field)
        })
        .collect()
}

/// `getDefaultValue`: `false` for booleans, an empty array/nested default
/// for arrays/objects, `null` otherwise.
pub fn default_value(field: &Field) -> Value {
    match field.field_type.dominant() {
        FieldKind::Boolean => Value::Bool(false),
        FieldKind::Array => Value::Array(vec![]),
        FieldKind::Object => {
            if let Some(children) = field.children.as_deref() {
                if let Children::Schema(sub) = children {
                    let mut map = serde_json::Map::new();
                    for child in sub {
                        map.insert(child.key.clone(), default_value(child));
                    }
                    return Value::Object(map);
                }
            }
            Value::Object(serde_json::Map::new())
        }
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// schema.json (de)serialization — field ids are the opaque encrypted form
// on disk, plain integers in memory.
// ---------------------------------------------------------------------------

pub fn to_json(schema: &Schema, salt: &[u8; 32]) -> Value {
    Value::Array(schema.iter().map(|f| field_to_json(f, salt)).collect())
}

fn field_to_json(field: &Field, salt: &[u8; 32]) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("id".into(), Value::String(crypto::encode_id(field.id as u64, salt)));
    obj.insert("key".into(), Value::String(field.key.clone()));
    obj.insert("type".into(), field_type_to_json(&field.field_type));
    obj.insert("required".into(), Value::Bool(field.required));
    obj.insert("unique".into(), Value::Bool(field.unique));
    if let Some(table) = &field.table {
        obj.insert("table".into(), Value::String(table.clone()));
    }
    if let Some(children) = field.children.as_deref() {
        obj.insert(
            "children".into(),
            match children {
                Children::Schema(sub) => Value::Array(sub.iter().map(|f| field_to_json(f, salt)).collect()),
                Children::Type(ty) => field_type_to_json(ty),
            },
        );
    }
    Value::Object(obj)
}

fn field_type_to_json(ty: &FieldType) -> Value {
    match ty {
        FieldType::Single(k) => Value::String(k.as_str().to_string()),
        FieldType::Union(ks) => Value::Array(ks.iter().map(|k| Value::String(k.as_str().to_string())).collect()),
    }
}

pub fn from_json(value: &Value, salt: &[u8; 32]) -> Result<Schema> {
    let arr = value
        .as_array()
        .ok_or_else(|| InibaseError::InvalidParameters { reason: "schema.json must be a JSON array".into() })?;
    arr.iter().map(|v| field_from_json(v, salt)).collect()
}

fn field_from_json(value: &Value, salt: &[u8; 32]) -> Result<Field> {
    let obj = value
        .as_object()
        .ok_or_else(|| InibaseError::InvalidParameters { reason: "schema field must be an object".into() })?;

    let id_raw = obj.get("id").and_then(Value::as_str).unwrap_or("");
    let id = if id_raw == "id" {
        0
    } else {
        crypto::decode_id(id_raw, salt)
            .or_else(|| id_raw.parse::<u64>().ok())
            .unwrap_or(0) as u32
    };

    let key = obj
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| InibaseError::InvalidParameters { reason: "schema field missing key".into() })?
        .to_string();

    let field_type = field_type_from_json(obj.get("type").cloned().unwrap_or(Value::String("string".into())))?;

    let required = obj.get("required").and_then(Value::as_bool).unwrap_or(false);
    let unique = obj.get("unique").and_then(Value::as_bool).unwrap_or(false);
    let table = obj.get("table").and_then(Value::as_str).map(|s| s.to_string());

    let children = match obj.get("children") {
        None => None,
        Some(Value::Array(items)) if matches!(field_type, FieldType::Single(FieldKind::Object)) => {
            Some(Box::new(Children::Schema(
                items.iter().map(|v| field_from_json(v, salt)).collect::<Result<Vec<_>>>()?,
            )))
        }
        Some(Value::Array(items)) if items.first().and_then(Value::as_object).is_some() => {
            Some(Box::new(Children::Schema(
                items.iter().map(|v| field_from_json(v, salt)).collect::<Result<Vec<_>>>()?,
            )))
        }
        Some(other) => Some(Box::new(Children::Type(field_type_from_json(other.clone())?))),
    };

    Ok(Field {
        id,
        key,
        field_type,
        required,
        unique,
        table,
        children,
    })
}

fn field_type_from_json(value: Value) -> Result<FieldType> {
    match value {
        Value::String(s) => FieldKind::from_str(&s)
            .map(FieldType::Single)
            .ok_or_else(|| InibaseError::InvalidParameters { reason: format!("unknown field type '{s}'") }),
        Value::Array(items) => {
            let kinds: Vec<FieldKind> = items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(FieldKind::from_str)
                .collect();
            Ok(FieldType::Union(kinds))
        }
        other => Err(InibaseError::InvalidParameters {
            reason: format!("invalid field type shape: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> [u8; 32] {
        [3u8; 32]
    }

    fn sample_schema() -> Schema {
        let mut s = vec![
            Field::scalar(1, "username", FieldKind::String),
            Field::scalar(2, "age", FieldKind::Number),
        ];
        s[0].unique = true;
        s[0].required = true;
        s
    }

    #[test]
    fn add_ids_assigns_from_highwater_mark() {
        let mut schema = vec![Field::scalar(0, "extra", FieldKind::String)];
        let last = add_ids(&mut schema, 5);
        assert_eq!(schema[0].id, 6);
        assert_eq!(last, 6);
    }

    #[test]
    fn get_field_resolves_nested_object_path() {
        let mut inner = vec![Field::scalar(2, "city", FieldKind::String)];
        let mut outer = Field::scalar(1, "address", FieldKind::Object);
        outer.children = Some(Box::new(Children::Schema(std::mem::take(&mut inner))));
        let schema = vec![outer];

        let found = get_field("address.city", &schema).unwrap();
        assert_eq!(found.key, "city");
    }

    #[test]
    fn get_field_skips_array_of_object_hop() {
        let leaf = Field::scalar(2, "role", FieldKind::String);
        let mut arr_field = Field::scalar(1, "roles", FieldKind::Array);
        arr_field.children = Some(Box::new(Children::Schema(vec![leaf])));
        let schema = vec![arr_field];

        let found = get_field("roles.*.role", &schema).unwrap();
        assert_eq!(found.key, "role");
    }

    #[test]
    fn default_value_rules() {
        let b = Field::scalar(1, "flag", FieldKind::Boolean);
        assert_eq!(default_value(&b), Value::Bool(false));

        let arr = Field::scalar(2, "tags", FieldKind::Array);
        assert_eq!(default_value(&arr), Value::Array(vec![]));

        let union = Field {
            field_type: FieldType::Union(vec![FieldKind::Number, FieldKind::String]),
            ..Field::scalar(3, "mixed", FieldKind::String)
        };
        assert_eq!(default_value(&union), Value::Null);
    }

    #[test]
    fn schema_json_round_trips() {
        let salt = salt();
        let schema = sample_schema();
        let json = to_json(&schema, &salt);
        let parsed = from_json(&json, &salt).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn flatten_produces_dotted_paths() {
        let schema = sample_schema();
        let flat = flatten(&schema);
        let paths: Vec<&str> = flat.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["username", "age"]);
    }

    #[test]
    fn filter_excludes_and_includes() {
        let schema = sample_schema();
        let excluded = filter(&schema, &["!age".to_string()]);
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].key, "username");

        let included = filter(&schema, &["age".to_string()]);
        assert_eq!(included.iter().map(|f| f.key.as_str()).collect::<Vec<_>>(), vec!["age"]);
    }
}
