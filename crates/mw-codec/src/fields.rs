//! Declared field descriptions and value encoding.
//!
//! Each object type registers an ordered list of `(name, codec)` pairs at
//! startup; the codec serializes values in declaration order and the
//! receive side decodes by the same table. Additive extension is allowed:
//! a frame may carry more fields than the local table (ignored) or fewer
//! (missing fields decode as [`FieldValue::Null`]).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::escape::{escape, split_raw, unescape};
use crate::timefmt;
use crate::CodecError;

// ---------------------------------------------------------------------------
// Field description
// ---------------------------------------------------------------------------

/// Value codecs available to field declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    Str,
    Int,
    Float,
    Bool,
    Time,
    Uuid,
}

/// One declared field: a name (diagnostics only, never on the wire) and
/// the codec used for its slot.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub codec: FieldCodec,
}

impl FieldSpec {
    pub const fn new(name: &'static str, codec: FieldCodec) -> Self {
        FieldSpec { name, codec }
    }
}

// ---------------------------------------------------------------------------
// Runtime values
// ---------------------------------------------------------------------------

/// A runtime field value. `Null` encodes as the empty atom and any empty
/// atom decodes back to `Null`, so absent values survive the round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Uuid(Uuid),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

fn encode_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => String::new(),
        FieldValue::Str(s) => s.clone(),
        FieldValue::Int(v) => v.to_string(),
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Bool(v) => if *v { "1" } else { "0" }.to_owned(),
        FieldValue::Time(ts) => timefmt::format_ts(*ts),
        FieldValue::Uuid(u) => u.to_string(),
    }
}

fn decode_value(atom: &str, codec: FieldCodec) -> Result<FieldValue, CodecError> {
    if atom.is_empty() {
        return Ok(FieldValue::Null);
    }
    let value = match codec {
        FieldCodec::Str => FieldValue::Str(atom.to_owned()),
        FieldCodec::Int => FieldValue::Int(
            atom.parse()
                .map_err(|_| CodecError::Parse(format!("bad int atom {atom:?}")))?,
        ),
        FieldCodec::Float => FieldValue::Float(
            atom.parse()
                .map_err(|_| CodecError::Parse(format!("bad float atom {atom:?}")))?,
        ),
        FieldCodec::Bool => match atom {
            "1" => FieldValue::Bool(true),
            "0" => FieldValue::Bool(false),
            other => return Err(CodecError::Parse(format!("bad bool atom {other:?}"))),
        },
        FieldCodec::Time => FieldValue::Time(timefmt::parse_ts(atom)?),
        FieldCodec::Uuid => FieldValue::Uuid(
            atom.parse()
                .map_err(|_| CodecError::Parse(format!("bad uuid atom {atom:?}")))?,
        ),
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Serialize / deserialize
// ---------------------------------------------------------------------------

/// Serialize `values` in declaration order into an escaped, pipe-joined
/// field string. `values` shorter than `specs` is padded with `Null`.
pub fn serialize_fields(specs: &[FieldSpec], values: &[FieldValue]) -> String {
    let mut atoms: Vec<String> = Vec::with_capacity(specs.len());
    for i in 0..specs.len() {
        let value = values.get(i).unwrap_or(&FieldValue::Null);
        atoms.push(escape(&encode_value(value)));
    }
    atoms.join("|")
}

/// Inverse of [`serialize_fields`]. Extra trailing atoms from a newer peer
/// are ignored; missing trailing atoms decode as `Null`.
pub fn deserialize_fields(
    specs: &[FieldSpec],
    field_string: &str,
) -> Result<Vec<FieldValue>, CodecError> {
    let atoms: Vec<&str> = if field_string.is_empty() {
        Vec::new()
    } else {
        split_raw(field_string, '|', 0)
    };
    let mut values = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        match atoms.get(i) {
            None => values.push(FieldValue::Null),
            Some(atom) => {
                let raw = unescape(atom)?;
                values.push(decode_value(&raw, spec.codec).map_err(|e| {
                    CodecError::Parse(format!("field '{}': {e}", spec.name))
                })?);
            }
        }
    }
    Ok(values)
}
