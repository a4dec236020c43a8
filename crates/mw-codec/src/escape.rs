//! Reversible escaping of wire delimiters.
//!
//! The line protocol reserves `,` (component separator), `|` (sub-field and
//! key-tuple separator), `;` (set element separator), backslash and newline.
//! Any of these occurring in a payload atom is rewritten to a two-character
//! backslash sequence before the atom is placed on the wire.
//!
//! `unescape(escape(s)) == s` holds for every `s`, including strings that
//! already contain backslashes.

use crate::CodecError;

const ESCAPES: &[(char, char)] = &[
    ('\\', '\\'),
    (',', 'c'),
    ('|', 'p'),
    (';', 's'),
    ('\n', 'n'),
];

/// Escape all reserved delimiter characters in `s`.
pub fn escape(s: &str) -> String {
    // Fast path: most atoms contain no reserved characters.
    if !s.chars().any(is_reserved) {
        return s.to_owned();
    }
    let mut out = String::with_capacity(s.len() + 4);
    for ch in s.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == ch) {
            Some((_, code)) => {
                out.push('\\');
                out.push(*code);
            }
            None => out.push(ch),
        }
    }
    out
}

/// Invert [`escape`]. Unknown escape sequences are a parse error.
pub fn unescape(s: &str) -> Result<String, CodecError> {
    if !s.contains('\\') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let code = chars
            .next()
            .ok_or_else(|| CodecError::Parse(format!("dangling escape in {s:?}")))?;
        match ESCAPES.iter().find(|(_, c)| *c == code) {
            Some((raw, _)) => out.push(*raw),
            None => {
                return Err(CodecError::Parse(format!(
                    "unknown escape '\\{code}' in {s:?}"
                )));
            }
        }
    }
    Ok(out)
}

fn is_reserved(ch: char) -> bool {
    ESCAPES.iter().any(|(raw, _)| *raw == ch)
}

/// Escape each part and join with `sep`.
///
/// `sep` must be one of the reserved delimiters so the join is unambiguous.
pub fn escape_and_concatenate(sep: char, parts: &[&str]) -> String {
    debug_assert!(is_reserved(sep));
    parts
        .iter()
        .map(|p| escape(p))
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}

/// Split `s` on `sep` into at most `limit` parts (0 = unlimited) and
/// unescape each part. Inverse of [`escape_and_concatenate`].
pub fn split_and_unescape(s: &str, sep: char, limit: usize) -> Result<Vec<String>, CodecError> {
    split_raw(s, sep, limit)
        .into_iter()
        .map(|p| unescape(p))
        .collect()
}

/// Split on `sep` without unescaping the parts.
///
/// Used where the caller needs the still-escaped atoms (delta compression
/// compares escaped atoms so delimiters inside values cannot corrupt the
/// positional split).
pub fn split_raw(s: &str, sep: char, limit: usize) -> Vec<&str> {
    if limit == 0 {
        s.split(sep).collect()
    } else {
        s.splitn(limit, sep).collect()
    }
}
