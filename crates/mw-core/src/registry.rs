//! The type registry.
//!
//! Applications declare every object type they handle at startup: code,
//! position in the tree (parent code), ordered field description, and a
//! behavior implementation. The registry replaces any runtime type
//! discovery: unknown codes on the wire are simply not ours and are
//! forwarded untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use mw_codec::fields::{FieldSpec, FieldValue};

use crate::error::CoreError;
use crate::object::DataObject;
use crate::query::{QueryObject, QueryReply};

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Application callbacks for one object type.
///
/// All methods have permissive defaults so a behavior only implements what
/// it cares about. Callbacks run on dispatcher workers (or inline on the
/// channel reader for the synchronous path) and must not block.
pub trait ObjectBehavior: Send + Sync {
    /// Synchronous delivery on the reader task. Return `false` to have the
    /// event re-queued for [`ObjectBehavior::on_async_event`].
    fn on_event(&self, _obj: &DataObject) -> bool {
        true
    }

    /// Asynchronous delivery on a dispatcher worker. Return `true` on
    /// success; for lossless types the acknowledgment is held back until
    /// this returns `true`.
    fn on_async_event(&self, _obj: &DataObject) -> bool {
        true
    }

    /// A previously unseen object was created by the inbound parser.
    fn on_new(&self, _obj: &DataObject) {}

    /// The object was removed upstream. Return `false` to veto locally
    /// (the object is kept, un-tombstoned).
    fn on_removal(&self, _obj: &DataObject) -> bool {
        true
    }

    /// The object was renamed upstream; `obj` already carries the new id.
    fn on_rename(&self, _obj: &DataObject, _old_id: &str) {}

    /// A reset replay for this type is starting. Return `true` if the
    /// application streamed the data itself; `false` to let the framework
    /// dump the object tree.
    fn on_reset_dump(&self) -> bool {
        false
    }

    /// The reset replay we were streaming to a peer has finished.
    fn on_reset_completed(&self) {}

    /// An incoming query for a type we produce. Returned replies are
    /// transmitted in order; an empty vector means "will reply later" (or
    /// never).
    fn on_enquire(&self, _query: &QueryObject) -> Vec<QueryReply> {
        Vec::new()
    }

    /// A reply to one of our own queries.
    fn on_reply(&self, _query: &QueryObject) {}

    /// One of our queries expired without a terminal reply.
    fn on_expire(&self, _query: &QueryObject) {}

    /// Offer a foreign payload to this type (import channels). Return the
    /// key tuple and field values of the resulting object if the payload
    /// is relevant.
    fn import_object(
        &self,
        _payload: &str,
        _channel: &str,
        _ts: DateTime<Utc>,
    ) -> Option<(Vec<String>, Vec<FieldValue>)> {
        None
    }
}

/// No-op behavior, used for forwarded-only types and in hub mode.
#[derive(Debug, Default)]
pub struct DefaultBehavior;

impl ObjectBehavior for DefaultBehavior {}

// ---------------------------------------------------------------------------
// TypeSpec
// ---------------------------------------------------------------------------

/// Everything the framework knows about one object type.
#[derive(Clone)]
pub struct TypeSpec {
    pub code: String,
    /// Parent type code; `None` for top-level types.
    pub parent_code: Option<String>,
    pub fields: Vec<FieldSpec>,
    /// Never stored in the tree; instances live only for event delivery.
    pub disposable: bool,
    pub case_sensitive: bool,
    /// Commits jump the send queue and flush immediately.
    pub urgent: bool,
    /// Dispatcher workers: negative = CPU count, 0 = inline, n = n.
    /// Capped at 1 when the type is consumed losslessly.
    pub threads: i32,
    /// Query types enter the query overlay instead of the object tree.
    pub is_query: bool,
    pub behavior: Arc<dyn ObjectBehavior>,
}

impl std::fmt::Debug for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSpec")
            .field("code", &self.code)
            .field("parent_code", &self.parent_code)
            .field("fields", &self.fields.len())
            .field("disposable", &self.disposable)
            .field("case_sensitive", &self.case_sensitive)
            .field("urgent", &self.urgent)
            .field("threads", &self.threads)
            .field("is_query", &self.is_query)
            .finish_non_exhaustive()
    }
}

impl TypeSpec {
    pub fn new(
        code: impl Into<String>,
        fields: Vec<FieldSpec>,
        behavior: Arc<dyn ObjectBehavior>,
    ) -> Self {
        TypeSpec {
            code: code.into(),
            parent_code: None,
            fields,
            disposable: false,
            case_sensitive: true,
            urgent: false,
            threads: 0,
            is_query: false,
            behavior,
        }
    }

    pub fn with_parent(mut self, parent_code: impl Into<String>) -> Self {
        self.parent_code = Some(parent_code.into());
        self
    }

    pub fn disposable(mut self) -> Self {
        self.disposable = true;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn threads(mut self, threads: i32) -> Self {
        self.threads = threads;
        self
    }

    pub fn query(mut self) -> Self {
        self.is_query = true;
        self
    }

    /// Normalize an object id per the case-sensitivity flag.
    pub fn normalize_id(&self, id: &str) -> String {
        if self.case_sensitive {
            id.to_owned()
        } else {
            id.to_lowercase()
        }
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TypeRegistry {
    specs: HashMap<String, Arc<TypeSpec>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    pub fn register(&mut self, spec: TypeSpec) {
        self.specs.insert(spec.code.clone(), Arc::new(spec));
    }

    pub fn get(&self, code: &str) -> Option<Arc<TypeSpec>> {
        self.specs.get(code).cloned()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.specs.contains_key(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// The root-first chain of specs from a top-level type down to `code`.
    pub fn type_path(&self, code: &str) -> Result<Vec<Arc<TypeSpec>>, CoreError> {
        let mut path = Vec::new();
        let mut cursor = Some(code.to_owned());
        while let Some(c) = cursor {
            let spec = self
                .get(&c)
                .ok_or_else(|| CoreError::Fatal(format!("unknown type code '{c}'")))?;
            if path.len() > self.specs.len() {
                return Err(CoreError::Fatal(format!("type parent cycle at '{c}'")));
            }
            cursor = spec.parent_code.clone();
            path.push(spec);
        }
        path.reverse();
        Ok(path)
    }

    /// Startup validation: every parent exists, no cycles.
    pub fn validate(&self) -> Result<(), CoreError> {
        for code in self.specs.keys() {
            self.type_path(code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mw_codec::fields::FieldCodec;

    fn spec(code: &str) -> TypeSpec {
        TypeSpec::new(
            code,
            vec![FieldSpec::new("v", FieldCodec::Str)],
            Arc::new(DefaultBehavior),
        )
    }

    #[test]
    fn type_path_walks_to_the_root() {
        let mut reg = TypeRegistry::new();
        reg.register(spec("A"));
        reg.register(spec("B").with_parent("A"));
        reg.register(spec("C").with_parent("B"));
        let path = reg.type_path("C").unwrap();
        let codes: Vec<&str> = path.iter().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, ["A", "B", "C"]);
        reg.validate().unwrap();
    }

    #[test]
    fn missing_parent_fails_validation() {
        let mut reg = TypeRegistry::new();
        reg.register(spec("B").with_parent("A"));
        assert!(matches!(reg.validate(), Err(CoreError::Fatal(_))));
    }

    #[test]
    fn parent_cycle_is_detected() {
        let mut reg = TypeRegistry::new();
        reg.register(spec("A").with_parent("B"));
        reg.register(spec("B").with_parent("A"));
        assert!(matches!(reg.validate(), Err(CoreError::Fatal(_))));
    }

    #[test]
    fn id_normalization_follows_the_case_flag() {
        let cs = spec("A");
        assert_eq!(cs.normalize_id("AbC"), "AbC");
        let ci = spec("B").case_insensitive();
        assert_eq!(ci.normalize_id("AbC"), "abc");
    }
}
