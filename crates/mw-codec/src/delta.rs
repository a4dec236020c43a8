//! Positional field-delta compression.
//!
//! Successive frames for the same key tuple usually differ in one or two
//! fields. The transmitter keeps the previously sent (escaped) field string
//! per key as a *keyframe predecessor* and emits only the changed slots;
//! the receiver reverses the transform against its own copy of the
//! predecessor. Both sides operate on escaped atoms, so embedded
//! delimiters can never corrupt the positional split.
//!
//! Slot encoding:
//! - the ditto mark `\d`: slot unchanged from the predecessor;
//! - the empty mark `\e`: slot is now the empty string;
//! - anything else: the new (escaped) value.
//!
//! The empty delta string means the frame is identical to the predecessor.
//! Neither mark collides with [`crate::escape`] output, which never emits
//! `\d` or `\e`.

use crate::CodecError;
use crate::escape::split_raw;

/// Slot marker: unchanged from the predecessor.
pub const DITTO: &str = "\\d";
/// Slot marker: value is now empty.
pub const EMPTY: &str = "\\e";

const SEP: char = '|';

/// Compress `current` against `previous`. Inputs are escaped,
/// pipe-joined field strings as produced by [`crate::fields`].
pub fn compress(previous: &str, current: &str) -> String {
    if previous == current {
        return String::new();
    }
    let prev: Vec<&str> = split_raw(previous, SEP, 0);
    let cur: Vec<&str> = split_raw(current, SEP, 0);
    let mut out: Vec<&str> = Vec::with_capacity(cur.len());
    for (i, slot) in cur.iter().enumerate() {
        if prev.get(i) == Some(slot) {
            out.push(DITTO);
        } else if slot.is_empty() {
            out.push(EMPTY);
        } else {
            out.push(slot);
        }
    }
    out.join(&SEP.to_string())
}

/// Exact inverse of [`compress`].
pub fn decompress(previous: &str, delta: &str) -> Result<String, CodecError> {
    if delta.is_empty() {
        return Ok(previous.to_owned());
    }
    let prev: Vec<&str> = split_raw(previous, SEP, 0);
    let mut out: Vec<&str> = Vec::with_capacity(prev.len());
    for (i, slot) in split_raw(delta, SEP, 0).into_iter().enumerate() {
        match slot {
            s if s == DITTO => out.push(prev.get(i).copied().ok_or_else(|| {
                CodecError::Parse(format!("ditto slot {i} without predecessor"))
            })?),
            s if s == EMPTY => out.push(""),
            s => out.push(s),
        }
    }
    Ok(out.join(&SEP.to_string()))
}

/// Compress an ordered value tuple (e.g. the key path of a frame) against
/// its predecessor. Same slot rules as [`compress`], applied to a
/// pre-split tuple.
pub fn compress_values(previous: &[String], current: &[String]) -> String {
    let prev = previous.join(&SEP.to_string());
    let cur = current.join(&SEP.to_string());
    compress(&prev, &cur)
}

/// Inverse of [`compress_values`].
///
/// Key tuples always have at least one element (a root-level singleton has
/// the single empty id), so the empty reconstruction decodes to `[""]`.
pub fn decompress_values(previous: &[String], delta: &str) -> Result<Vec<String>, CodecError> {
    let prev = previous.join(&SEP.to_string());
    let full = decompress(&prev, delta)?;
    Ok(split_raw(&full, SEP, 0).into_iter().map(String::from).collect())
}

/// Delta-encode a destination set against its predecessor.
///
/// Sets are unordered, so the positional rules do not apply; instead every
/// delta element carries an explicit mark: `+` for an addition, `~` for a
/// removal (UUID text never starts with either). The marks keep a delta
/// distinguishable from a full replacement list on the wire. An empty
/// delta means the set is unchanged.
pub fn compress_map(previous: &[String], current: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for item in current {
        if !previous.contains(item) {
            parts.push(format!("+{item}"));
        }
    }
    for item in previous {
        if !current.contains(item) {
            parts.push(format!("~{item}"));
        }
    }
    parts.join(";")
}

/// Inverse of [`compress_map`]. Unmarked elements are tolerated as
/// additions.
pub fn decompress_map(previous: &[String], delta: &str) -> Vec<String> {
    let mut out: Vec<String> = previous.to_vec();
    if delta.is_empty() {
        return out;
    }
    for item in delta.split(';') {
        if let Some(removed) = item.strip_prefix('~') {
            out.retain(|x| x != removed);
        } else {
            let added = item.strip_prefix('+').unwrap_or(item);
            if !out.iter().any(|x| x == added) {
                out.push(added.to_owned());
            }
        }
    }
    out
}
