//! Bulk state replay.
//!
//! When a peer requests a reset for a type we produce, a `Resetter` is
//! created for that (type, channel): a bounded buffer that the producer
//! side fills (either the application's own dump or the built-in tree
//! walk) and a drain task empties through the channel's send sequencer at
//! a moderated rate, starting with a `seq = 0` keyframe.
//!
//! A second reset for the same (type, channel) aborts the previous
//! resetter; its remaining buffer is drained to the void.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use mw_protocol::consts::DEFAULT_QUEUE_CAPACITY;

use crate::object::DataObject;

pub struct Resetter {
    type_code: String,
    origin: uuid::Uuid,
    tx: Mutex<Option<mpsc::Sender<DataObject>>>,
    aborted: Arc<AtomicBool>,
}

/// The drain side handed to the streaming task.
pub struct ResetStream {
    rx: mpsc::Receiver<DataObject>,
    aborted: Arc<AtomicBool>,
}

impl ResetStream {
    /// Next object to replay; `None` when the dump is complete or the
    /// resetter was aborted.
    pub async fn next(&mut self) -> Option<DataObject> {
        if self.aborted.load(Ordering::Acquire) {
            // Drain and discard whatever the producer already buffered.
            while self.rx.try_recv().is_ok() {}
            return None;
        }
        match self.rx.recv().await {
            Some(obj) if !self.aborted.load(Ordering::Acquire) => Some(obj),
            _ => None,
        }
    }
}

impl Resetter {
    pub fn new(type_code: impl Into<String>, origin: uuid::Uuid) -> (Arc<Resetter>, ResetStream) {
        Self::with_capacity(type_code, origin, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        type_code: impl Into<String>,
        origin: uuid::Uuid,
        capacity: usize,
    ) -> (Arc<Resetter>, ResetStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let aborted = Arc::new(AtomicBool::new(false));
        let resetter = Arc::new(Resetter {
            type_code: type_code.into(),
            origin,
            tx: Mutex::new(Some(tx)),
            aborted: aborted.clone(),
        });
        (resetter, ResetStream { rx, aborted })
    }

    pub fn type_code(&self) -> &str {
        &self.type_code
    }

    /// Offer one object to the replay. Filters out foreign origins, other
    /// types and obsolete entries; suspends when the buffer is full
    /// (back-pressure on the dumping task). Returns whether the object was
    /// taken.
    pub async fn reset_object(&self, obj: DataObject) -> bool {
        if self.aborted.load(Ordering::Acquire) {
            return false;
        }
        if obj.type_code != self.type_code || obj.origin != self.origin || obj.is_obsolete() {
            return false;
        }
        let tx = { self.tx.lock().expect("resetter poisoned").clone() };
        match tx {
            Some(tx) => tx.send(obj).await.is_ok(),
            None => false,
        }
    }

    /// Close the stream; the drain task finishes the buffered tail and
    /// fires `on_reset_completed`.
    pub fn end_of_data(&self) {
        self.tx.lock().expect("resetter poisoned").take();
    }

    /// Abandon the replay (superseded by a newer reset).
    pub fn abort(&self) {
        debug!(type_code = %self.type_code, "resetter aborted");
        self.aborted.store(true, Ordering::Release);
        self.end_of_data();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn obj(code: &str, id: &str, origin: Uuid) -> DataObject {
        DataObject::new(code, id, origin)
    }

    #[tokio::test]
    async fn replays_own_objects_in_order() {
        let me = Uuid::from_u128(1);
        let (resetter, mut stream) = Resetter::new("Px", me);
        assert!(resetter.reset_object(obj("Px", "a", me)).await);
        assert!(resetter.reset_object(obj("Px", "b", me)).await);
        resetter.end_of_data();

        assert_eq!(stream.next().await.unwrap().id, "a");
        assert_eq!(stream.next().await.unwrap().id, "b");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn filters_foreign_and_obsolete_objects() {
        let me = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);
        let (resetter, _stream) = Resetter::new("Px", me);
        assert!(!resetter.reset_object(obj("Px", "x", other)).await);
        assert!(!resetter.reset_object(obj("Qy", "x", me)).await);
        let mut dead = obj("Px", "x", me);
        dead.tombstone = true;
        assert!(!resetter.reset_object(dead).await);
    }

    #[tokio::test]
    async fn abort_discards_the_buffered_tail() {
        let me = Uuid::from_u128(1);
        let (resetter, mut stream) = Resetter::new("Px", me);
        assert!(resetter.reset_object(obj("Px", "a", me)).await);
        resetter.abort();
        assert!(stream.next().await.is_none());
        assert!(!resetter.reset_object(obj("Px", "b", me)).await);
        assert!(resetter.is_aborted());
    }
}
