//! Line ↔ value codec.
//!
//! One record-value per line (§4.1). Strings are
//! percent-decoded on the way out; a fixed set of structural characters is
//! percent-escaped on the way in so they can never collide with the
//! [`DELIMITERS`] hierarchy used to flatten nested arrays onto a single
//! line. Booleans encode as `1`/`0`; a field whose declared type is a union
//! is decoded with [`detect_type`] first.

use crate::crypto;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;

/// The leaf value kinds a schema field can declare (§3's field `type`
/// column). A field's declared type is either one of these or a *union* of
/// several, resolved per-value via [`detect_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Date,
    Email,
    Url,
    Table,
    Object,
    Array,
    Password,
    Html,
    Ip,
    Json,
    Id,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Email => "email",
            FieldKind::Url => "url",
            FieldKind::Table => "table",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Password => "password",
            FieldKind::Html => "html",
            FieldKind::Ip => "ip",
            FieldKind::Json => "json",
            FieldKind::Id => "id",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "string" => FieldKind::String,
            "number" => FieldKind::Number,
            "boolean" => FieldKind::Boolean,
            "date" => FieldKind::Date,
            "email" => FieldKind::Email,
            "url" => FieldKind::Url,
            "table" => FieldKind::Table,
            "object" => FieldKind::Object,
            "array" => FieldKind::Array,
            "password" => FieldKind::Password,
            "html" => FieldKind::Html,
            "ip" => FieldKind::Ip,
            "json" => FieldKind::Json,
            "id" => FieldKind::Id,
            _ => return None,
        })
    }
}

/// The delimiter hierarchy used to flatten nested arrays onto one line.
/// Index 0 joins a flat (1-D) array; index 1 joins the outer level of a 2-D
/// array (whose inner arrays join with index 0); and so on, to depth 10.
pub const DELIMITERS: [char; 10] = [',', '|', '&', '$', '#', '@', '^', ':', '!', ';'];

/// Structural characters that are percent-escaped on encode so they can
/// never be mistaken for one of [`DELIMITERS`].
const STRUCTURAL: &AsciiSet = &CONTROLS
    .add(b'<')
    .add(b'>')
    .add(b',')
    .add(b'|')
    .add(b'&')
    .add(b'$')
    .add(b'#')
    .add(b'@')
    .add(b'^')
    .add(b'%')
    .add(b':')
    .add(b'!')
    .add(b';')
    .add(b'\n')
    .add(b'\r');

/// Percent-escape the characters that would otherwise collide with a
/// delimiter or a line boundary.
pub fn escape_scalar(s: &str) -> String {
    utf8_percent_encode(s, STRUCTURAL).to_string()
}

/// Reverse [`escape_scalar`]. Percent-decoding is general, so it also
/// reverses any other percent-escapes a caller may have put in.
pub fn unescape_scalar(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Percent-style escaping for column *file names*: `.` and `*` would
/// otherwise collide with path separators/wildcards on disk, so they are
/// escaped the same way structural value characters are.
pub fn escape_file_name(path: &str) -> String {
    const FILE_STRUCTURAL: &AsciiSet = &CONTROLS.add(b'.').add(b'*').add(b'%');
    utf8_percent_encode(path, FILE_STRUCTURAL).to_string()
}

pub fn unescape_file_name(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

fn array_depth(v: &Value) -> usize {
    match v {
        Value::Array(items) => 1 + items.iter().map(array_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Encode any decoded [`Value`] onto one line. Arrays are flattened using
/// the delimiter appropriate to their nesting depth; everything else is
/// escaped/stringified directly.
pub fn encode_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_scalar(s),
        Value::Array(items) => {
            let depth = array_depth(v).max(1);
            let delim = DELIMITERS[depth - 1];
            items
                .iter()
                .map(encode_value)
                .collect::<Vec<_>>()
                .join(&delim.to_string())
        }
        Value::Object(_) => escape_scalar(&serde_json::to_string(v).unwrap_or_default()),
    }
}

/// Structurally decode a line with no type information: split on the
/// highest-present delimiter recursively, percent-decoding leaves. The
/// result is either a plain string or a (possibly nested) array of
/// strings; callers apply typing on top (see [`decode_typed`] /
/// [`decode_auto`]).
fn decode_structural(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    for &delim in DELIMITERS.iter().rev() {
        if raw.contains(delim) {
            let parts: Vec<Value> = raw.split(delim).map(decode_structural).collect();
            return Value::Array(parts);
        }
    }
    Value::String(unescape_scalar(raw))
}

/// Type-directed decode for a field of known [`FieldKind`]. `child` is the
/// element kind when `kind == FieldKind::Array`.
pub fn decode_typed(raw: &str, kind: FieldKind, child: Option<FieldKind>, salt: &[u8; 32]) -> Value {
    if raw.is_empty() && kind != FieldKind::Array {
        return Value::Null;
    }

    match kind {
        FieldKind::Number | FieldKind::Table => match raw.parse::<f64>() {
            Ok(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Err(_) => Value::Null,
        },
        FieldKind::Boolean => match raw {
            "1" | "true" => Value::Bool(true),
            "0" | "false" => Value::Bool(false),
            _ => Value::Null,
        },
        FieldKind::Id => match raw.parse::<u64>() {
            Ok(n) => Value::String(crypto::encode_id(n, salt)),
            Err(_) => Value::Null,
        },
        FieldKind::Array => {
            let structural = decode_structural(raw);
            let items = match structural {
                Value::Array(items) => items,
                other => vec![other],
            };
            let child_kind = child.unwrap_or(FieldKind::String);
            Value::Array(
                items
                    .into_iter()
                    .map(|item| decode_scalar_leaf(&item, child_kind, salt))
                    .collect(),
            )
        }
        FieldKind::Json => {
            let unescaped = unescape_scalar(raw);
            serde_json::from_str(&unescaped).unwrap_or(Value::String(unescaped))
        }
        // `date` is always stored as a millisecond epoch (see crate::mutation),
        // so it decodes back to a JSON number rather than passing through as text.
        FieldKind::Date => match raw.parse::<f64>() {
            Ok(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Err(_) => Value::String(unescape_scalar(raw)),
        },
        _ => Value::String(unescape_scalar(raw)),
    }
}

/// Apply [`decode_typed`]'s scalar rules to a structurally-decoded leaf
/// (used while walking an already-split array).
fn decode_scalar_leaf(leaf: &Value, kind: FieldKind, salt: &[u8; 32]) -> Value {
    let raw = match leaf {
        Value::String(s) => s.clone(),
        Value::Array(_) => return decode_nested_array(leaf, kind, salt),
        other => return other.clone(),
    };
    match kind {
        FieldKind::Number | FieldKind::Table => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        FieldKind::Boolean => match raw.as_str() {
            "1" | "true" => Value::Bool(true),
            "0" | "false" => Value::Bool(false),
            _ => Value::Null,
        },
        FieldKind::Id => raw
            .parse::<u64>()
            .ok()
            .map(|n| Value::String(crypto::encode_id(n, salt)))
            .unwrap_or(Value::Null),
        _ => Value::String(raw),
    }
}

fn decode_nested_array(v: &Value, child_kind: FieldKind, salt: &[u8; 32]) -> Value {
    match v {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|i| decode_nested_array(i, child_kind, salt))
                .collect(),
        ),
        other => decode_scalar_leaf(other, child_kind, salt),
    }
}

/// Decode a line with no declared type, using the detection rules below to
/// pick one. Used for union-typed fields.
pub fn decode_auto(raw: &str, salt: &[u8; 32]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    let kind = detect_type(raw, salt);
    decode_typed(raw, kind, Some(FieldKind::String), salt)
}

/// Union-type detection, applied in a fixed order so edge cases stay
/// testable (§4.1 / §9):
///
/// 1. exact `0`/`1`/`true`/`false` → boolean
/// 2. numeric → number (a leading-zero multi-digit run is treated as a
///    string instead, e.g. a zip code)
/// 3. 32 hex chars that decrypt to an integer under the current salt → table
/// 4. leading `[` → array
/// 5. email shape → email
/// 6. URL shape → url
/// 7. fixed password-hash length (`<128 hex>.<32 hex>`) → password
/// 8. parses as JSON object/array → json
/// 9. parses as a date → json (per the source's fallback behavior)
/// 10. otherwise → string, unless it parses as an IP address → ip
pub fn detect_type(raw: &str, salt: &[u8; 32]) -> FieldKind {
    match raw {
        "0" | "1" | "true" | "false" => return FieldKind::Boolean,
        _ => {}
    }

    if is_numeric_literal(raw) {
        if raw.len() > 1 && raw.starts_with('0') {
            return FieldKind::String;
        }
        return FieldKind::Number;
    }

    if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) && crypto::is_valid_opaque_id(raw, salt)
    {
        return FieldKind::Table;
    }

    if raw.starts_with('[') {
        return FieldKind::Array;
    }

    if is_email(raw) {
        return FieldKind::Email;
    }

    if is_url(raw) {
        return FieldKind::Url;
    }

    if is_password_hash_shape(raw) {
        return FieldKind::Password;
    }

    if raw.starts_with('{') || raw.starts_with('[') {
        if serde_json::from_str::<Value>(raw).is_ok() {
            return FieldKind::Json;
        }
    }

    if is_parseable_date(raw) {
        return FieldKind::Json;
    }

    if raw.parse::<std::net::IpAddr>().is_ok() {
        return FieldKind::Ip;
    }

    FieldKind::String
}

fn is_numeric_literal(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit())
}

fn is_email(raw: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
        .is_match(raw)
}

fn is_url(raw: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$").unwrap())
        .is_match(raw)
}

fn is_password_hash_shape(raw: &str) -> bool {
    // hash_password() always produces `<128 hex chars>.<32 hex chars>`.
    match raw.split_once('.') {
        Some((h, s)) => {
            h.len() == 128
                && s.len() == 32
                && h.chars().all(|c| c.is_ascii_hexdigit())
                && s.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

fn is_parseable_date(raw: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(raw).is_ok()
        || chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
        || raw.parse::<i64>().is_ok() && raw.len() >= 10
}

/// Translate a glob pattern using `%` as the wildcard into an anchored,
/// case-insensitive regex, per §4.5.
pub fn glob_to_regex(pattern: &str) -> regex::Regex {
    let mut out = String::from("(?i)^");
    for part in pattern.split('%') {
        out.push_str(&regex::escape(part));
        out.push_str(".*");
    }
    // Strip the trailing ".*" introduced by the loop boundary, then re-add
    // an end anchor unless the pattern itself ends in a wildcard, so `%`
    // behaves as a true wildcard rather than an implicit match-suffix.
    if out.ends_with(".*") && !pattern.ends_with('%') {
        out.truncate(out.len() - 2);
    }
    out.push('$');
    regex::Regex::new(&out).unwrap_or_else(|_| regex::Regex::new("^$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn scalar_round_trip_with_structural_chars() {
        let s = "a,b|c&d$e#f@g^h:i!j;k<l>m%n\nrest";
        let encoded = escape_scalar(s);
        assert_eq!(unescape_scalar(&encoded), s);
        assert!(!encoded.contains(','));
    }

    #[test]
    fn boolean_round_trip() {
        assert_eq!(encode_value(&Value::Bool(true)), "1");
        assert_eq!(encode_value(&Value::Bool(false)), "0");
    }

    #[test]
    fn nested_array_round_trip() {
        let v = serde_json::json!([["a", "b"], ["c"]]);
        let encoded = encode_value(&v);
        // Outer join uses DELIMITERS[1], inner uses DELIMITERS[0].
        assert!(encoded.contains(DELIMITERS[1]));
        let structural = decode_structural(&encoded);
        assert_eq!(
            structural,
            serde_json::json!([["a", "b"], ["c"]])
        );
    }

    #[test]
    fn empty_line_is_null() {
        assert_eq!(decode_typed("", FieldKind::String, None, &salt()), Value::Null);
    }

    #[test]
    fn id_field_reencodes_to_opaque() {
        let decoded = decode_typed("42", FieldKind::Id, None, &salt());
        let opaque = decoded.as_str().unwrap();
        assert_eq!(opaque.len(), 32);
        assert_eq!(crypto::decode_id(opaque, &salt()), Some(42));
    }

    #[test]
    fn detect_boolean_number_array() {
        let s = salt();
        assert_eq!(detect_type("true", &s), FieldKind::Boolean);
        assert_eq!(detect_type("123", &s), FieldKind::Number);
        assert_eq!(detect_type("007", &s), FieldKind::String);
        assert_eq!(detect_type("[1,2]", &s), FieldKind::Array);
    }

    #[test]
    fn detect_email_and_url() {
        let s = salt();
        assert_eq!(detect_type("a@b.com", &s), FieldKind::Email);
        assert_eq!(detect_type("https://example.com/x", &s), FieldKind::Url);
    }

    #[test]
    fn glob_translates_wildcard() {
        let re = glob_to_regex("foo%bar");
        assert!(re.is_match("fooXYZbar"));
        assert!(!re.is_match("foobarqux"));
    }
}
