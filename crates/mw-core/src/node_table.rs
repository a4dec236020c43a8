//! Mesh-wide reset ordering.
//!
//! Every reset request carries `(deploy_time, ts, reset_seq)` from its
//! origin. Requests rebroadcast around the mesh arrive repeatedly; the
//! table accepts each origin's requests only in strictly increasing order,
//! which both suppresses rebroadcast loops and makes "a later reset wins".
//!
//! `reset_seq` compares modulo 2^32 with half-range wrap semantics. A
//! newer `deploy_time` always wins outright: a restarted node starts its
//! counters from scratch and must not be ignored until they catch up.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct ResetOrder {
    deploy_time: DateTime<Utc>,
    ts: DateTime<Utc>,
    seq: u32,
}

/// `true` when `a` is ahead of `b` modulo 2^32 (half-range rule:
/// differences beyond half the range count as negative).
pub fn seq_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[derive(Debug, Default)]
pub struct PeerNodeTable {
    entries: Mutex<HashMap<Uuid, ResetOrder>>,
}

impl PeerNodeTable {
    pub fn new() -> Self {
        PeerNodeTable::default()
    }

    /// Check and record one reset request. `true` = fresh, act on it;
    /// `false` = already seen (or superseded), drop silently.
    pub fn accept_reset(
        &self,
        origin: Uuid,
        deploy_time: DateTime<Utc>,
        ts: DateTime<Utc>,
        seq: u32,
    ) -> bool {
        let mut entries = self.entries.lock().expect("node table poisoned");
        let accept = match entries.get(&origin) {
            None => true,
            Some(last) => {
                if deploy_time != last.deploy_time {
                    deploy_time > last.deploy_time
                } else if ts != last.ts {
                    ts > last.ts
                } else {
                    seq_newer(seq, last.seq)
                }
            }
        };
        if accept {
            entries.insert(origin, ResetOrder { deploy_time, ts, seq });
        }
        accept
    }

    /// Forget an origin entirely (it left the mesh).
    pub fn forget(&self, origin: Uuid) {
        self.entries.lock().expect("node table poisoned").remove(&origin);
    }
}
