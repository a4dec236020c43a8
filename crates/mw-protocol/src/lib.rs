// mw-protocol: wire frame and control message vocabulary.
//
// One line = one message, UTF-8, `\n` terminated. The first character is
// the prefix; `^` lines are control messages, everything else is a data
// frame. Payload atoms are escaped (mw-codec), so splitting on the raw
// delimiters is always safe.

use thiserror::Error;
use uuid::Uuid;

use mw_codec::CodecError;
use mw_codec::escape::split_raw;

pub mod consts;
pub mod control;

pub use control::Control;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame prefix {0:?}")]
    BadPrefix(char),
    #[error("malformed frame: {0}")]
    BadFrame(String),
    #[error("malformed control message: {0}")]
    BadControl(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// Prefix
// ---------------------------------------------------------------------------

/// The one-character frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// `$`: normal commit.
    Normal,
    /// `~`: object removal (or rename shadow).
    Remove,
    /// `#`: urgent commit.
    Urgent,
    /// `?`: query.
    Query,
    /// `!`: urgent query.
    UrgentQuery,
    /// `^`: control message.
    Control,
}

impl Prefix {
    pub fn as_char(self) -> char {
        match self {
            Prefix::Normal => '$',
            Prefix::Remove => '~',
            Prefix::Urgent => '#',
            Prefix::Query => '?',
            Prefix::UrgentQuery => '!',
            Prefix::Control => '^',
        }
    }

    pub fn from_char(ch: char) -> Result<Self, ProtocolError> {
        Ok(match ch {
            '$' => Prefix::Normal,
            '~' => Prefix::Remove,
            '#' => Prefix::Urgent,
            '?' => Prefix::Query,
            '!' => Prefix::UrgentQuery,
            '^' => Prefix::Control,
            other => return Err(ProtocolError::BadPrefix(other)),
        })
    }

    /// Query frames (urgent or not) enter the query overlay instead of the
    /// object tree.
    pub fn is_query(self) -> bool {
        matches!(self, Prefix::Query | Prefix::UrgentQuery)
    }

    pub fn is_urgent(self) -> bool {
        matches!(self, Prefix::Urgent | Prefix::UrgentQuery)
    }
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Where a commit is addressed.
///
/// Wire tokens: `*` = all nodes, `-` = no other nodes (but local export is
/// allowed), `a;b;c` = an explicit UUID set. The empty token is reserved
/// for "same as previous frame" and never appears in a resolved value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destinations {
    All,
    Empty,
    Set(Vec<Uuid>),
}

impl Destinations {
    pub fn encode(&self) -> String {
        match self {
            Destinations::All => "*".to_owned(),
            Destinations::Empty => "-".to_owned(),
            Destinations::Set(uuids) => uuids
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(";"),
        }
    }

    pub fn parse(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "*" => Ok(Destinations::All),
            "-" => Ok(Destinations::Empty),
            "" => Err(ProtocolError::BadFrame(
                "empty destinations token outside delta context".to_owned(),
            )),
            list => {
                let mut uuids = Vec::new();
                for part in list.split(';') {
                    uuids.push(part.parse().map_err(|_| {
                        ProtocolError::BadFrame(format!("bad destination uuid {part:?}"))
                    })?);
                }
                Ok(Destinations::Set(uuids))
            }
        }
    }

    /// True when `uuid` is addressed by this set.
    pub fn includes(&self, uuid: Uuid) -> bool {
        match self {
            Destinations::All => true,
            Destinations::Empty => false,
            Destinations::Set(uuids) => uuids.contains(&uuid),
        }
    }
}

// ---------------------------------------------------------------------------
// RawFrame
// ---------------------------------------------------------------------------

/// A data frame as it appears on the wire, before delta resolution.
///
/// `ts`, `origin`, `destinations`, `keys` and `fields` are the raw
/// (possibly delta-compressed, possibly empty-meaning-unchanged) atoms;
/// the sequencer owns the predecessors needed to resolve them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub prefix: Prefix,
    pub type_code: String,
    pub ts: String,
    pub seq: u32,
    pub origin: String,
    pub destinations: String,
    /// Signed: the wire carries the difference against the per-origin
    /// object counter, which can run backwards across a replay.
    pub obj_seq_delta: i64,
    pub ack_seq: Option<u64>,
    pub keys: String,
    pub fields: String,
}

impl RawFrame {
    /// Parse one wire line. The caller has already stripped the newline.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut chars = line.chars();
        let prefix = Prefix::from_char(
            chars
                .next()
                .ok_or_else(|| ProtocolError::BadFrame("empty line".to_owned()))?,
        )?;
        if prefix == Prefix::Control {
            return Err(ProtocolError::BadFrame(
                "control line fed to RawFrame::parse".to_owned(),
            ));
        }
        let rest = chars.as_str();
        let parts = split_raw(rest, ',', 6);
        if parts.len() != 6 {
            return Err(ProtocolError::BadFrame(format!(
                "expected 6 components, got {} in {line:?}",
                parts.len()
            )));
        }
        let type_code = parts[0];
        if type_code.is_empty() {
            return Err(ProtocolError::BadFrame("empty type code".to_owned()));
        }
        let seq = u32::from_str_radix(parts[2], 16)
            .map_err(|_| ProtocolError::BadFrame(format!("bad seq {:?}", parts[2])))?;

        let sub = split_raw(parts[3], '|', 0);
        if sub.len() < 3 || sub.len() > 4 {
            return Err(ProtocolError::BadFrame(format!(
                "subheader needs 3-4 fields, got {} in {line:?}",
                sub.len()
            )));
        }
        let obj_seq_delta = if sub[2].is_empty() {
            0
        } else {
            sub[2]
                .parse()
                .map_err(|_| ProtocolError::BadFrame(format!("bad obj seq {:?}", sub[2])))?
        };
        let ack_seq = match sub.get(3) {
            None => None,
            Some(s) if s.is_empty() => None,
            Some(s) => Some(
                s.parse()
                    .map_err(|_| ProtocolError::BadFrame(format!("bad ack seq {s:?}")))?,
            ),
        };

        Ok(RawFrame {
            prefix,
            type_code: type_code.to_owned(),
            ts: parts[1].to_owned(),
            seq,
            origin: sub[0].to_owned(),
            destinations: sub[1].to_owned(),
            obj_seq_delta,
            ack_seq,
            keys: parts[4].to_owned(),
            fields: parts[5].to_owned(),
        })
    }

    /// Encode back to a wire line (no trailing newline).
    pub fn encode(&self) -> String {
        let mut sub = format!("{}|{}|{}", self.origin, self.destinations, self.obj_seq_delta);
        if let Some(ack) = self.ack_seq {
            sub.push('|');
            sub.push_str(&ack.to_string());
        }
        format!(
            "{}{},{},{:x},{},{},{}",
            self.prefix.as_char(),
            self.type_code,
            self.ts,
            self.seq,
            sub,
            self.keys,
            self.fields
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trip() {
        for ch in ['$', '~', '#', '?', '!', '^'] {
            assert_eq!(Prefix::from_char(ch).unwrap().as_char(), ch);
        }
        assert!(Prefix::from_char('@').is_err());
    }

    #[test]
    fn destinations_tokens() {
        assert_eq!(Destinations::All.encode(), "*");
        assert_eq!(Destinations::Empty.encode(), "-");
        let set = Destinations::Set(vec![Uuid::nil()]);
        assert_eq!(Destinations::parse(&set.encode()).unwrap(), set);
        assert!(Destinations::parse("").is_err());
        assert!(Destinations::parse("not-a-uuid").is_err());
    }

    #[test]
    fn frame_round_trip() {
        let frame = RawFrame {
            prefix: Prefix::Normal,
            type_code: "Px".to_owned(),
            ts: "140326092653589".to_owned(),
            seq: 0x1f,
            origin: Uuid::nil().to_string(),
            destinations: "*".to_owned(),
            obj_seq_delta: 3,
            ack_seq: Some(12),
            keys: "id1".to_owned(),
            fields: "a|\\d|c".to_owned(),
        };
        let line = frame.encode();
        assert_eq!(RawFrame::parse(&line).unwrap(), frame);
    }

    #[test]
    fn delta_frame_with_empty_header_atoms_parses() {
        // Everything-same-as-previous except one field slot.
        let line = "$Px,,20,||1,,\\d|x";
        let frame = RawFrame::parse(line).unwrap();
        assert_eq!(frame.seq, 0x20);
        assert!(frame.ts.is_empty());
        assert!(frame.origin.is_empty());
        assert!(frame.destinations.is_empty());
        assert_eq!(frame.obj_seq_delta, 1);
        assert_eq!(frame.ack_seq, None);
        assert_eq!(frame.encode(), line);
    }

    #[test]
    fn escaped_commas_in_fields_do_not_break_the_split() {
        let line = "$Px,140326092653589,0,||0,id\\c1,va\\cl|b";
        let frame = RawFrame::parse(line).unwrap();
        assert_eq!(frame.keys, "id\\c1");
        assert_eq!(frame.fields, "va\\cl|b");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(RawFrame::parse("").is_err());
        assert!(RawFrame::parse("$Px,only,three").is_err());
        assert!(RawFrame::parse("$Px,ts,zz,||0,k,f").is_err());
        assert!(RawFrame::parse("$,ts,0,||0,k,f").is_err());
        assert!(RawFrame::parse("^L,producer").is_err());
    }
}
