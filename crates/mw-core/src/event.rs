//! Dispatcher event variants and the lossless acknowledgment ticket.

use std::sync::Arc;

use uuid::Uuid;

use mw_protocol::Control;
use mw_protocol::control::Ack;

use crate::channel::ChannelHandle;
use crate::object::DataObject;
use crate::query::QueryObject;
use crate::resetter::Resetter;

/// Pending acknowledgment for one losslessly delivered frame. Fired only
/// after the application callback reports success.
#[derive(Clone)]
pub struct AckTicket {
    pub channel: ChannelHandle,
    pub type_code: String,
    pub origin: Uuid,
    pub destination: Uuid,
    pub ack_seq: u64,
}

impl AckTicket {
    /// Send the `^ACK` back along the arrival channel.
    pub fn fire(&self) {
        let line = Control::Ack(Ack {
            type_code: self.type_code.clone(),
            origin: self.origin,
            destination: self.destination,
            ack_seq: self.ack_seq,
        })
        .encode();
        self.channel.try_transmit(&line, false);
    }
}

impl std::fmt::Debug for AckTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTicket")
            .field("type_code", &self.type_code)
            .field("ack_seq", &self.ack_seq)
            .finish_non_exhaustive()
    }
}

/// One unit of work for a type's dispatcher pool.
pub enum Event {
    /// A live object commit that needs `on_async_event`.
    Object { obj: DataObject, ack: Option<AckTicket> },
    /// A removal (`old_id: None`) or rename (`old_id: Some`).
    Obsolete {
        obj: DataObject,
        old_id: Option<String>,
        ack: Option<AckTicket>,
    },
    /// Producer side: stream the current tree through the resetter.
    ResetDump { resetter: Arc<Resetter> },
    /// Producer side: a reset replay finished streaming.
    ResetCompleted { type_code: String },
    /// A query arrived for a type we produce.
    Enquire { query: QueryObject },
    /// A reply arrived for a query we issued. `terminal` closes it.
    Reply { query: QueryObject, terminal: bool },
    /// A query we issued expired unanswered.
    Expired { query: QueryObject },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Object { obj, .. } => write!(f, "Object({}/{})", obj.type_code, obj.id),
            Event::Obsolete { obj, old_id, .. } => {
                write!(f, "Obsolete({}/{}, old={old_id:?})", obj.type_code, obj.id)
            }
            Event::ResetDump { resetter } => write!(f, "ResetDump({})", resetter.type_code()),
            Event::ResetCompleted { type_code } => write!(f, "ResetCompleted({type_code})"),
            Event::Enquire { query } => write!(f, "Enquire({})", query.key()),
            Event::Reply { query, terminal } => {
                write!(f, "Reply({}, terminal={terminal})", query.key())
            }
            Event::Expired { query } => write!(f, "Expired({})", query.key()),
        }
    }
}
