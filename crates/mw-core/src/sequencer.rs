//! Per-(channel, type) frame sequencing and delta compression.
//!
//! Each direction of each channel keeps one sequencer per object type.
//! The send side numbers frames modulo [`consts::SEQ_MODULUS`], emits a
//! full keyframe at `seq = 0` (first frame after connect, after a reset,
//! and after the counter wraps) and delta-compresses everything else
//! against per-key predecessors. The receive side reconstructs the stream,
//! detects gaps, and throttles reset requests.
//!
//! Sequencers are owned by their channel's reader or writer path and are
//! never shared across tasks; all methods take `&mut self`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use mw_codec::delta;
use mw_codec::escape::{escape, split_raw, unescape};
use mw_codec::timefmt;
use mw_protocol::consts::{RESET_THROTTLE, SEQ_MODULUS};
use mw_protocol::{Destinations, Prefix, ProtocolError, RawFrame};

// ---------------------------------------------------------------------------
// FullFrame
// ---------------------------------------------------------------------------

/// A fully resolved data frame: what the send side starts from and the
/// receive side reconstructs.
#[derive(Debug, Clone, PartialEq)]
pub struct FullFrame {
    pub prefix: Prefix,
    pub type_code: String,
    pub ts: DateTime<Utc>,
    pub origin: Uuid,
    pub destinations: Destinations,
    /// Absolute per-(origin, type) application object sequence.
    pub obj_seq: u64,
    pub ack_seq: Option<u64>,
    /// Unescaped object id path, root-most first.
    pub keys: Vec<String>,
    /// Full escaped field string (pipe-joined atoms).
    pub fields: String,
}

impl FullFrame {
    /// The canonical (escaped, pipe-joined) key string used as the
    /// keyframe map key.
    pub fn key_string(&self) -> String {
        join_keys(&self.keys)
    }
}

fn join_keys(keys: &[String]) -> String {
    keys.iter()
        .map(|k| escape(k))
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SendSequencer {
    next_seq: u32,
    need_keyframe: bool,
    keyframes: HashMap<String, String>,
    obj_counters: HashMap<Uuid, u64>,
    prev_ts: String,
    prev_origin: Option<Uuid>,
    prev_destinations: Option<Destinations>,
    prev_keys: String,
}

impl SendSequencer {
    pub fn new() -> Self {
        SendSequencer {
            need_keyframe: true,
            ..Default::default()
        }
    }

    /// Force the next frame to be a full keyframe (`seq = 0`). Used on
    /// connect and when starting a reset replay.
    pub fn reset(&mut self) {
        *self = SendSequencer::new();
    }

    /// Encode `frame` as the next wire frame for this stream.
    pub fn encode(&mut self, frame: &FullFrame) -> RawFrame {
        let keyframe = self.need_keyframe;
        let seq = if keyframe {
            self.keyframes.clear();
            self.obj_counters.clear();
            self.prev_ts.clear();
            self.prev_origin = None;
            self.prev_destinations = None;
            self.prev_keys.clear();
            self.need_keyframe = false;
            self.next_seq = 1;
            0
        } else {
            let seq = self.next_seq;
            self.next_seq = (self.next_seq + 1) % SEQ_MODULUS;
            if self.next_seq == 0 {
                // Wrapped: the next emission must re-key the stream.
                self.need_keyframe = true;
            }
            seq
        };

        let ts_string = timefmt::format_ts(frame.ts);
        let ts = if !keyframe && ts_string == self.prev_ts {
            String::new()
        } else {
            ts_string.clone()
        };
        self.prev_ts = ts_string;

        let origin = if !keyframe && self.prev_origin == Some(frame.origin) {
            String::new()
        } else {
            frame.origin.to_string()
        };
        self.prev_origin = Some(frame.origin);

        let destinations = self.encode_destinations(keyframe, &frame.destinations);
        self.prev_destinations = Some(frame.destinations.clone());

        let key_string = join_keys(&frame.keys);
        let keys = if keyframe {
            key_string.clone()
        } else {
            delta::compress(&self.prev_keys, &key_string)
        };
        self.prev_keys = key_string.clone();

        let last_obj = self.obj_counters.get(&frame.origin).copied().unwrap_or(0);
        let obj_seq_delta = frame.obj_seq as i64 - last_obj as i64;
        self.obj_counters.insert(frame.origin, frame.obj_seq);

        let fields = if frame.prefix.is_query() {
            // Queries are one-shot objects; keyframing them would only
            // grow the predecessor map.
            frame.fields.clone()
        } else {
            let predecessor = self
                .keyframes
                .get(&key_string)
                .map(String::as_str)
                .unwrap_or("");
            let encoded = if keyframe {
                frame.fields.clone()
            } else {
                delta::compress(predecessor, &frame.fields)
            };
            if frame.prefix == Prefix::Remove {
                self.keyframes.remove(&key_string);
            } else {
                self.keyframes.insert(key_string, frame.fields.clone());
            }
            encoded
        };

        RawFrame {
            prefix: frame.prefix,
            type_code: frame.type_code.clone(),
            ts,
            seq,
            origin,
            destinations,
            obj_seq_delta,
            ack_seq: frame.ack_seq,
            keys,
            fields,
        }
    }

    fn encode_destinations(&self, keyframe: bool, current: &Destinations) -> String {
        if !keyframe && self.prev_destinations.as_ref() == Some(current) {
            return String::new();
        }
        if !keyframe {
            if let (Some(Destinations::Set(prev)), Destinations::Set(cur)) =
                (&self.prev_destinations, current)
            {
                let prev_s: Vec<String> = prev.iter().map(Uuid::to_string).collect();
                let cur_s: Vec<String> = cur.iter().map(Uuid::to_string).collect();
                let d = delta::compress_map(&prev_s, &cur_s);
                if d.len() < current.encode().len() {
                    return d;
                }
            }
        }
        current.encode()
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

/// Result of feeding one raw frame to the receive side.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// In sequence; here is the reconstructed frame.
    Frame(Box<FullFrame>),
    /// Out of sequence and a reset request is due for this type.
    NeedReset,
    /// Out of sequence, reset already requested recently; frame dropped.
    Discarded,
}

#[derive(Debug, Default)]
pub struct ReceiveSequencer {
    next_seq: u32,
    in_sequence: bool,
    keyframes: HashMap<String, String>,
    obj_counters: HashMap<Uuid, u64>,
    prev_ts: Option<DateTime<Utc>>,
    prev_origin: Option<Uuid>,
    prev_destinations: Option<Destinations>,
    prev_keys: String,
    last_reset: Option<Instant>,
}

impl ReceiveSequencer {
    pub fn new() -> Self {
        ReceiveSequencer::default()
    }

    pub fn in_sequence(&self) -> bool {
        self.in_sequence
    }

    /// Feed one raw frame.
    ///
    /// A decode error never advances the sequence counter; it also drops
    /// the stream out of sequence, because the per-key predecessors can no
    /// longer be trusted once a frame is lost to a parse failure.
    pub fn decode(&mut self, raw: &RawFrame) -> Result<ReceiveOutcome, ProtocolError> {
        let keyframe = raw.seq == 0;
        if keyframe {
            self.keyframes.clear();
            self.obj_counters.clear();
            self.prev_ts = None;
            self.prev_origin = None;
            self.prev_destinations = None;
            self.prev_keys.clear();
        } else if !self.in_sequence {
            return Ok(self.out_of_sequence());
        } else if raw.seq != self.next_seq {
            tracing::warn!(
                type_code = %raw.type_code,
                expected = self.next_seq,
                got = raw.seq,
                "sequence gap"
            );
            self.in_sequence = false;
            return Ok(self.out_of_sequence());
        }

        match self.resolve(raw) {
            Ok(frame) => {
                self.in_sequence = true;
                self.next_seq = (raw.seq + 1) % SEQ_MODULUS;
                Ok(ReceiveOutcome::Frame(Box::new(frame)))
            }
            Err(e) => {
                self.in_sequence = false;
                Err(e)
            }
        }
    }

    fn out_of_sequence(&mut self) -> ReceiveOutcome {
        let due = match self.last_reset {
            None => true,
            Some(at) => at.elapsed() >= RESET_THROTTLE,
        };
        if due {
            self.last_reset = Some(Instant::now());
            ReceiveOutcome::NeedReset
        } else {
            ReceiveOutcome::Discarded
        }
    }

    fn resolve(&mut self, raw: &RawFrame) -> Result<FullFrame, ProtocolError> {
        let bad = |what: &str| ProtocolError::BadFrame(format!("{what} without predecessor"));

        let ts = if raw.ts.is_empty() {
            self.prev_ts.ok_or_else(|| bad("empty timestamp"))?
        } else {
            timefmt::parse_ts(&raw.ts)?
        };
        self.prev_ts = Some(ts);

        let origin = if raw.origin.is_empty() {
            self.prev_origin.ok_or_else(|| bad("empty origin"))?
        } else {
            raw.origin
                .parse()
                .map_err(|_| ProtocolError::BadFrame(format!("bad origin {:?}", raw.origin)))?
        };
        self.prev_origin = Some(origin);

        let destinations = self.resolve_destinations(&raw.destinations)?;
        self.prev_destinations = Some(destinations.clone());

        let key_string = delta::decompress(&self.prev_keys, &raw.keys)?;
        self.prev_keys = key_string.clone();
        let keys = split_raw(&key_string, '|', 0)
            .into_iter()
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()?;

        let counter = self.obj_counters.entry(origin).or_insert(0);
        let obj_seq = (*counter as i64 + raw.obj_seq_delta).max(0) as u64;
        *counter = obj_seq;

        let fields = if raw.prefix.is_query() {
            raw.fields.clone()
        } else {
            let predecessor = self
                .keyframes
                .get(&key_string)
                .map(String::as_str)
                .unwrap_or("");
            let full = delta::decompress(predecessor, &raw.fields)?;
            if raw.prefix == Prefix::Remove {
                self.keyframes.remove(&key_string);
            } else {
                self.keyframes.insert(key_string, full.clone());
            }
            full
        };

        Ok(FullFrame {
            prefix: raw.prefix,
            type_code: raw.type_code.clone(),
            ts,
            origin,
            destinations,
            obj_seq,
            ack_seq: raw.ack_seq,
            keys,
            fields,
        })
    }

    fn resolve_destinations(&self, token: &str) -> Result<Destinations, ProtocolError> {
        if token.is_empty() {
            return self
                .prev_destinations
                .clone()
                .ok_or_else(|| ProtocolError::BadFrame("empty destinations without predecessor".into()));
        }
        if token.starts_with('+') || token.starts_with('~') {
            let Some(Destinations::Set(prev)) = &self.prev_destinations else {
                return Err(ProtocolError::BadFrame(
                    "destination delta without a set predecessor".into(),
                ));
            };
            let prev_s: Vec<String> = prev.iter().map(Uuid::to_string).collect();
            let merged = delta::decompress_map(&prev_s, token);
            let mut uuids = Vec::with_capacity(merged.len());
            for item in merged {
                uuids.push(item.parse().map_err(|_| {
                    ProtocolError::BadFrame(format!("bad destination uuid {item:?}"))
                })?);
            }
            return Ok(Destinations::Set(uuids));
        }
        Destinations::parse(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn frame(obj_seq: u64, id: &str, fields: &str) -> FullFrame {
        FullFrame {
            prefix: Prefix::Normal,
            type_code: "Px".to_owned(),
            ts: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
            origin: Uuid::nil(),
            destinations: Destinations::All,
            obj_seq,
            ack_seq: None,
            keys: vec![id.to_owned()],
            fields: fields.to_owned(),
        }
    }

    #[test]
    fn clean_stream_reconstructs_exactly() {
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();
        let frames = [
            frame(1, "a", "7|on"),
            frame(2, "a", "8|on"),
            frame(3, "b", "1|off"),
            frame(4, "a", "8|off"),
        ];
        for f in &frames {
            let raw = tx.encode(f);
            match rx.decode(&raw).unwrap() {
                ReceiveOutcome::Frame(got) => assert_eq!(*got, *f),
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn first_frame_is_a_keyframe() {
        let mut tx = SendSequencer::new();
        let raw = tx.encode(&frame(1, "a", "7|on"));
        assert_eq!(raw.seq, 0);
        assert_eq!(raw.fields, "7|on");
        assert!(!raw.ts.is_empty());
        assert!(!raw.origin.is_empty());
    }

    #[test]
    fn repeated_headers_compress_to_empty_atoms() {
        let mut tx = SendSequencer::new();
        let _ = tx.encode(&frame(1, "a", "7|on"));
        let raw = tx.encode(&frame(2, "a", "7|off"));
        assert!(raw.ts.is_empty());
        assert!(raw.origin.is_empty());
        assert!(raw.destinations.is_empty());
        assert!(raw.keys.is_empty());
        assert_eq!(raw.obj_seq_delta, 1);
    }

    #[test]
    fn dropped_frame_triggers_exactly_one_reset_request() {
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();

        let r1 = tx.encode(&frame(1, "a", "1|x"));
        let _dropped = tx.encode(&frame(2, "a", "2|x"));
        let r3 = tx.encode(&frame(3, "a", "3|x"));
        let r4 = tx.encode(&frame(4, "a", "4|x"));

        assert!(matches!(rx.decode(&r1).unwrap(), ReceiveOutcome::Frame(_)));
        assert!(matches!(rx.decode(&r3).unwrap(), ReceiveOutcome::NeedReset));
        assert!(matches!(rx.decode(&r4).unwrap(), ReceiveOutcome::Discarded));
        assert!(!rx.in_sequence());
    }

    #[test]
    fn keyframe_recovers_an_out_of_sequence_stream() {
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();

        let r1 = tx.encode(&frame(1, "a", "1|x"));
        let _ = rx.decode(&r1).unwrap();
        let _dropped = tx.encode(&frame(2, "a", "2|x"));
        let r3 = tx.encode(&frame(3, "a", "3|x"));
        assert!(matches!(rx.decode(&r3).unwrap(), ReceiveOutcome::NeedReset));

        // Producer restarts the stream with a keyframe.
        tx.reset();
        let r4 = tx.encode(&frame(4, "a", "4|x"));
        assert_eq!(r4.seq, 0);
        match rx.decode(&r4).unwrap() {
            ReceiveOutcome::Frame(got) => {
                assert_eq!(got.fields, "4|x");
                assert_eq!(got.obj_seq, 4);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(rx.in_sequence());
    }

    #[test]
    fn removal_clears_the_keyframe_predecessor() {
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();

        let r1 = tx.encode(&frame(1, "a", "1|x"));
        let mut remove = frame(2, "a", "");
        remove.prefix = Prefix::Remove;
        let r2 = tx.encode(&remove);
        // Re-create under the same key: predecessor must be gone.
        let r3 = tx.encode(&frame(3, "a", "9|y"));

        for raw in [&r1, &r2, &r3] {
            assert!(matches!(rx.decode(raw).unwrap(), ReceiveOutcome::Frame(_)));
        }
        assert_eq!(r3.fields, "9|y");
    }

    #[test]
    fn destination_set_changes_ride_a_map_delta() {
        let u1 = Uuid::from_u128(1);
        let u2 = Uuid::from_u128(2);
        let u3 = Uuid::from_u128(3);
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();

        let mut f1 = frame(1, "a", "1|x");
        f1.destinations = Destinations::Set(vec![u1, u2, u3]);
        let mut f2 = frame(2, "a", "2|x");
        f2.destinations = Destinations::Set(vec![u2, u3]);

        let r1 = tx.encode(&f1);
        let r2 = tx.encode(&f2);
        // One removal is cheaper than re-listing the surviving members.
        assert!(r2.destinations.starts_with('~'));

        let _ = rx.decode(&r1).unwrap();
        match rx.decode(&r2).unwrap() {
            ReceiveOutcome::Frame(got) => {
                assert_eq!(got.destinations, Destinations::Set(vec![u2, u3]));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_error_does_not_advance_the_stream() {
        let mut tx = SendSequencer::new();
        let mut rx = ReceiveSequencer::new();
        let r1 = tx.encode(&frame(1, "a", "1|x"));
        let _ = rx.decode(&r1).unwrap();

        let mut broken = tx.encode(&frame(2, "a", "2|x"));
        broken.ts = "not-a-timestamp".to_owned();
        assert!(rx.decode(&broken).is_err());
        // The predecessors are tainted; the stream must wait for a keyframe.
        assert!(!rx.in_sequence());

        tx.reset();
        let r3 = tx.encode(&frame(3, "a", "3|x"));
        assert!(matches!(rx.decode(&r3).unwrap(), ReceiveOutcome::Frame(_)));
    }
}
