//! Wire codec primitives for the meshwire line protocol.
//!
//! Everything in this crate is pure: no I/O, no clocks, no shared state.
//! The three concerns are
//!
//! - delimiter escaping ([`escape`]): the wire format is a comma/pipe
//!   delimited text line, so payload atoms must be escaped reversibly;
//! - delta compression ([`delta`]): successive frames for the same key are
//!   transmitted as positional field deltas against a keyframe predecessor;
//! - field encoding ([`fields`]): each object type declares an ordered
//!   field description that replaces runtime reflection, and the codec
//!   serializes values in declaration order.
//!
//! Timestamps use the fixed `ddMMyyHHmmssSSS` representation ([`timefmt`])
//! with optional 10 ms / 100 ms rounded shorthands.

pub mod delta;
pub mod escape;
pub mod fields;
pub mod timefmt;

use thiserror::Error;

/// Errors produced while encoding or decoding wire atoms.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed input that cannot be decoded.
    #[error("parse error: {0}")]
    Parse(String),
    /// A frame carried a different number of fields than the type declares.
    #[error("field count mismatch: expected {expected}, got {got}")]
    FieldCount { expected: usize, got: usize },
    /// A timestamp atom that does not match any accepted width.
    #[error("bad timestamp: {0:?}")]
    BadTimestamp(String),
}
