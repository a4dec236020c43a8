//! Foreign-source adaptation.
//!
//! An import channel feeds raw foreign lines (another vendor's protocol)
//! into the mesh: each produced type gets a chance to claim the payload
//! through its behavior's `import_object`; claimed payloads become normal
//! commits. Optionally the raw payload itself is relayed across the mesh
//! as a `RAW` object so remote nodes can re-emit it to their own local
//! foreign sinks.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use mw_codec::fields::{FieldCodec, FieldSpec, FieldValue};

use crate::registry::{ObjectBehavior, TypeRegistry, TypeSpec};

/// Type code of the built-in raw-import relay object.
pub const RAW_IMPORT_CODE: &str = "RAW";

/// Spec for the relay type: keyed by source channel name, carrying the
/// payload and its arrival timestamp. Register it (and produce/consume it)
/// only when raw relaying is wanted.
pub fn raw_import_spec(behavior: std::sync::Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new(
        RAW_IMPORT_CODE,
        vec![
            FieldSpec::new("payload", FieldCodec::Str),
            FieldSpec::new("source", FieldCodec::Str),
            FieldSpec::new("received", FieldCodec::Time),
        ],
        behavior,
    )
    .disposable()
}

/// One object claimed out of a foreign payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedObject {
    pub type_code: String,
    pub keys: Vec<String>,
    pub values: Vec<FieldValue>,
}

/// Offer `payload` to every produced type; collect the claims.
pub fn offer(
    registry: &TypeRegistry,
    produced: &HashSet<String>,
    payload: &str,
    channel: &str,
    ts: DateTime<Utc>,
) -> Vec<ImportedObject> {
    let mut claimed = Vec::new();
    for code in produced {
        let Some(spec) = registry.get(code) else { continue };
        if let Some((keys, values)) = spec.behavior.import_object(payload, channel, ts) {
            claimed.push(ImportedObject {
                type_code: code.clone(),
                keys,
                values,
            });
        }
    }
    claimed
}
