//! The data object record.
//!
//! An object is a plain record of attributes; all type-specific behavior
//! lives behind [`crate::registry::ObjectBehavior`]. Objects carry their
//! parent as an id path (parent-as-index) rather than a back-pointer, so
//! the tree owns the only strong references.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use mw_codec::escape::escape;
use mw_codec::fields::{FieldValue, deserialize_fields, serialize_fields};
use mw_protocol::Destinations;

use crate::error::CoreError;
use crate::registry::TypeSpec;
use crate::sequencer::FullFrame;

#[derive(Debug, Clone, PartialEq)]
pub struct DataObject {
    pub type_code: String,
    /// Object id; empty for singletons.
    pub id: String,
    /// Ids of the ancestors, root-most first (excluding this object).
    pub parent_keys: Vec<String>,
    pub values: Vec<FieldValue>,
    /// The node that created this object.
    pub origin: Uuid,
    pub user_id: Option<String>,
    /// Timestamp of the last commit that touched this object.
    pub command_ts: DateTime<Utc>,
    /// The raw inbound line that produced this state, for diagnostics.
    pub raw_line: Option<String>,
    pub destinations: Destinations,
    /// Set by `remove()`; the object is obsolete and leaves the index on
    /// the next commit.
    pub tombstone: bool,
    /// Set by `rename()` on the obsolete shadow carrying the old id.
    pub rename_target: Option<String>,
}

impl DataObject {
    pub fn new(type_code: impl Into<String>, id: impl Into<String>, origin: Uuid) -> Self {
        DataObject {
            type_code: type_code.into(),
            id: id.into(),
            parent_keys: Vec::new(),
            values: Vec::new(),
            origin,
            user_id: None,
            command_ts: Utc::now(),
            raw_line: None,
            destinations: Destinations::All,
            tombstone: false,
            rename_target: None,
        }
    }

    /// An object is obsolete while tombstoned or while acting as the
    /// rename shadow; it is indexable but will not survive the next
    /// commit.
    pub fn is_obsolete(&self) -> bool {
        self.tombstone || self.rename_target.is_some()
    }

    /// Full id path, root-most first, ending with this object's id.
    pub fn key_path(&self) -> Vec<String> {
        let mut keys = self.parent_keys.clone();
        keys.push(self.id.clone());
        keys
    }

    /// Serialized field string for transmission. An obsolete object
    /// serializes as its rename target (escaped) or as the empty string.
    pub fn serialize(&self, spec: &TypeSpec) -> String {
        if self.is_obsolete() {
            return self
                .rename_target
                .as_deref()
                .map(|t| escape(t))
                .unwrap_or_default();
        }
        serialize_fields(&spec.fields, &self.values)
    }

    /// Replace field values from a received full field string.
    pub fn apply_fields(&mut self, spec: &TypeSpec, field_string: &str) -> Result<(), CoreError> {
        self.values = deserialize_fields(&spec.fields, field_string)?;
        Ok(())
    }

    /// Build an object from a reconstructed inbound frame.
    pub fn from_frame(spec: &TypeSpec, frame: &FullFrame, raw_line: Option<String>) -> Result<Self, CoreError> {
        let keys = frame.keys.clone();
        let (parent_keys, id) = match keys.split_last() {
            Some((id, parents)) => (parents.to_vec(), spec.normalize_id(id)),
            None => (Vec::new(), String::new()),
        };
        let mut obj = DataObject {
            type_code: frame.type_code.clone(),
            id,
            parent_keys,
            values: Vec::new(),
            origin: frame.origin,
            user_id: None,
            command_ts: frame.ts,
            raw_line,
            destinations: frame.destinations.clone(),
            tombstone: false,
            rename_target: None,
        };
        obj.apply_fields(spec, &frame.fields)?;
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DefaultBehavior;
    use mw_codec::fields::{FieldCodec, FieldSpec};
    use std::sync::Arc;

    fn spec() -> TypeSpec {
        TypeSpec::new(
            "Px",
            vec![
                FieldSpec::new("label", FieldCodec::Str),
                FieldSpec::new("value", FieldCodec::Int),
            ],
            Arc::new(DefaultBehavior),
        )
    }

    #[test]
    fn serialize_uses_declaration_order() {
        let mut obj = DataObject::new("Px", "1", Uuid::nil());
        obj.values = vec![FieldValue::Str("hot".into()), FieldValue::Int(7)];
        assert_eq!(obj.serialize(&spec()), "hot|7");
    }

    #[test]
    fn obsolete_serialization_carries_the_rename_target() {
        let mut obj = DataObject::new("Px", "1", Uuid::nil());
        obj.rename_target = Some("1b".into());
        assert_eq!(obj.serialize(&spec()), "1b");
        obj.rename_target = None;
        obj.tombstone = true;
        assert_eq!(obj.serialize(&spec()), "");
    }

    #[test]
    fn key_path_appends_own_id() {
        let mut obj = DataObject::new("Ch", "c1", Uuid::nil());
        obj.parent_keys = vec!["p1".into()];
        assert_eq!(obj.key_path(), vec!["p1".to_owned(), "c1".to_owned()]);
    }
}
