//! Query/reply overlay.
//!
//! A query is a short-lived object riding the normal frame transport with
//! the `?` (or `!`) prefix. Its identity is `(requester UUID, query id)`,
//! carried in the key so replies can be matched without trusting the frame
//! origin (replies originate at the replier). The state machine is
//! `Query → {Replied | Next* → End} | Aborted`, with an expiration timer
//! on the requester side.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use mw_codec::fields::{FieldValue, deserialize_fields, serialize_fields};
use mw_protocol::ProtocolError;

use crate::error::CoreError;
use crate::registry::TypeSpec;
use crate::sequencer::FullFrame;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Query,
    Replied,
    Next,
    End,
    Aborted,
}

impl QueryState {
    pub fn as_code(self) -> i64 {
        match self {
            QueryState::Query => 0,
            QueryState::Replied => 1,
            QueryState::Next => 2,
            QueryState::End => 3,
            QueryState::Aborted => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CoreError> {
        Ok(match code {
            0 => QueryState::Query,
            1 => QueryState::Replied,
            2 => QueryState::Next,
            3 => QueryState::End,
            4 => QueryState::Aborted,
            other => {
                return Err(CoreError::Parse(ProtocolError::BadFrame(format!(
                    "bad query state {other}"
                ))));
            }
        })
    }

    /// After a terminal state no further replies are delivered.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::End | QueryState::Aborted)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, QueryState::Replied | QueryState::Next | QueryState::End)
    }
}

// ---------------------------------------------------------------------------
// QueryObject
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct QueryObject {
    pub type_code: String,
    /// The node that issued the query.
    pub requester: Uuid,
    /// Unique per requester.
    pub query_id: u32,
    pub state: QueryState,
    pub values: Vec<FieldValue>,
    pub ts: DateTime<Utc>,
    pub urgent: bool,
}

impl QueryObject {
    /// Wire key: `requester:query_id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.requester, self.query_id)
    }

    /// Field string: the state code atom followed by the payload fields.
    pub fn encode_fields(&self, spec: &TypeSpec) -> String {
        let payload = serialize_fields(&spec.fields, &self.values);
        if payload.is_empty() {
            self.state.as_code().to_string()
        } else {
            format!("{}|{payload}", self.state.as_code())
        }
    }

    /// Rebuild from a reconstructed inbound frame.
    pub fn from_frame(spec: &TypeSpec, frame: &FullFrame) -> Result<Self, CoreError> {
        let key = frame.keys.last().cloned().unwrap_or_default();
        let (requester, query_id) = parse_key(&key)?;
        let (state_atom, payload) = match frame.fields.split_once('|') {
            Some((s, rest)) => (s, rest),
            None => (frame.fields.as_str(), ""),
        };
        let state_code: i64 = state_atom.parse().map_err(|_| {
            CoreError::Parse(ProtocolError::BadFrame(format!(
                "bad query state atom {state_atom:?}"
            )))
        })?;
        Ok(QueryObject {
            type_code: frame.type_code.clone(),
            requester,
            query_id,
            state: QueryState::from_code(state_code)?,
            values: deserialize_fields(&spec.fields, payload)?,
            ts: frame.ts,
            urgent: frame.prefix == mw_protocol::Prefix::UrgentQuery,
        })
    }
}

fn parse_key(key: &str) -> Result<(Uuid, u32), CoreError> {
    let (uuid, id) = key.split_once(':').ok_or_else(|| {
        CoreError::Parse(ProtocolError::BadFrame(format!("bad query key {key:?}")))
    })?;
    let requester = uuid.parse().map_err(|_| {
        CoreError::Parse(ProtocolError::BadFrame(format!("bad query requester {uuid:?}")))
    })?;
    let query_id = id.parse().map_err(|_| {
        CoreError::Parse(ProtocolError::BadFrame(format!("bad query id {id:?}")))
    })?;
    Ok((requester, query_id))
}

/// One application-provided reply, transmitted by the framework.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReply {
    pub state: QueryState,
    pub values: Vec<FieldValue>,
}

// ---------------------------------------------------------------------------
// Pending-query table (requester side)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingQuery {
    expires: DateTime<Utc>,
}

/// What to do with an incoming reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Deliver to the application; the query stays open.
    Deliver,
    /// Deliver; the query is now closed.
    DeliverFinal,
    /// Late, unknown or expired: ignore.
    Ignore,
}

#[derive(Debug, Default)]
pub struct QueryTable {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingQuery>>,
}

impl QueryTable {
    pub fn new() -> Self {
        QueryTable::default()
    }

    pub fn allocate(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, query_id: u32, expires: DateTime<Utc>) {
        self.pending
            .lock()
            .expect("query table poisoned")
            .insert(query_id, PendingQuery { expires });
    }

    /// Route an incoming reply for one of our queries.
    pub fn on_reply(&self, query_id: u32, state: QueryState, now: DateTime<Utc>) -> ReplyDisposition {
        let mut pending = self.pending.lock().expect("query table poisoned");
        let Some(entry) = pending.get(&query_id) else {
            return ReplyDisposition::Ignore;
        };
        if now > entry.expires {
            pending.remove(&query_id);
            return ReplyDisposition::Ignore;
        }
        if !state.is_reply() && state != QueryState::Aborted {
            return ReplyDisposition::Ignore;
        }
        if state.is_terminal() {
            pending.remove(&query_id);
            return ReplyDisposition::DeliverFinal;
        }
        ReplyDisposition::Deliver
    }

    /// Fired by the expiration timer. `true` when the query was still open
    /// (the application's `on_expire` should run).
    pub fn expire(&self, query_id: u32) -> bool {
        self.pending
            .lock()
            .expect("query table poisoned")
            .remove(&query_id)
            .is_some()
    }

    /// Requester-side abort; `true` when there was anything to abort.
    pub fn abort(&self, query_id: u32) -> bool {
        self.pending
            .lock()
            .expect("query table poisoned")
            .remove(&query_id)
            .is_some()
    }

    pub fn open_count(&self) -> usize {
        self.pending.lock().expect("query table poisoned").len()
    }
}
