//! `setTableSchema`'s diff step (§4.3): compute old-id→path and
//! new-id→path maps for two schema versions and produce the file renames
//! needed to move every column file to its new dotted path before the new
//! `schema.json` is written.

use super::{flatten, Schema};
use std::collections::HashMap;

/// One column file that needs `from` renamed to `to` (both dotted paths,
/// pre file-name-escaping — see [`crate::codec::escape_file_name`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub field_id: u32,
    pub from_path: String,
    pub to_path: String,
}

/// Diff `old` against `new` by field id (ids are stable identity across
/// renames) and return the column files whose path changed.
/// Fields present in `old` but absent from `new` are not renamed — their
/// files are simply orphaned/removed by the caller, per "removing a field
/// removes its files but not its ID slot".
pub fn diff_schema(old: &Schema, new: &Schema) -> Vec<RenamePlan> {
    let old_paths: HashMap<u32, String> = flatten(old).into_iter().map(|(p, f)| (f.id, p)).collect();
    let new_paths: HashMap<u32, String> = flatten(new).into_iter().map(|(p, f)| (f.id, p)).collect();

    let mut plans = Vec::new();
    for (id, new_path) in &new_paths {
        if let Some(old_path) = old_paths.get(id) {
            if old_path != new_path {
                plans.push(RenamePlan {
                    field_id: *id,
                    from_path: old_path.clone(),
                    to_path: new_path.clone(),
                });
            }
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldKind;
    use crate::schema::Field;

    #[test]
    fn diff_detects_rename() {
        let old = vec![Field::scalar(1, "username", FieldKind::String)];
        let new = vec![Field::scalar(1, "handle", FieldKind::String)];
        let plans = diff_schema(&old, &new);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].from_path, "username");
        assert_eq!(plans[0].to_path, "handle");
    }

    #[test]
    fn diff_ignores_unchanged_and_removed_fields() {
        let old = vec![
            Field::scalar(1, "username", FieldKind::String),
            Field::scalar(2, "bio", FieldKind::String),
        ];
        let new = vec![Field::scalar(1, "username", FieldKind::String)];
        assert!(diff_schema(&old, &new).is_empty());
    }
}
