//! Test harness for the meshwire suites.
//!
//! Provides in-memory transports, a raw line-level peer for speaking the
//! wire protocol directly, a recording behavior for asserting delivered
//! events, and helpers for wiring runtimes together into small meshes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use mw_codec::fields::FieldValue;
use mw_core::channel::ChannelConfig;
use mw_core::hub::Peer;
use mw_core::registry::ObjectBehavior;
use mw_core::runtime::Runtime;
use mw_core::transport::{BoxTransport, OnceConnector};
use mw_core::{DataObject, QueryObject, QueryReply, QueryState};

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// An in-memory byte pipe pair: what one side writes, the other reads.
pub fn transport_pair() -> (BoxTransport, BoxTransport) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (Box::new(a), Box::new(b))
}

/// Wire two runtimes together: `consumer` dials, `producer` answers.
/// Channel names make the direction readable in logs.
pub fn link(consumer: &Runtime, producer: &Runtime, name: &str) -> (Arc<Peer>, Arc<Peer>) {
    let (near, far) = transport_pair();
    let consumer_peer = consumer.connect(
        ChannelConfig::new(format!("{name}-up")),
        Arc::new(OnceConnector::new(near)),
    );
    let producer_peer = producer.serve(&format!("{name}-down"), far);
    (consumer_peer, producer_peer)
}

// ---------------------------------------------------------------------------
// Raw line peer
// ---------------------------------------------------------------------------

/// Speaks the wire protocol directly over one transport half: the
/// counterpart of a real node for protocol-level tests.
pub struct LinePeer {
    reader: BufReader<ReadHalf<BoxTransport>>,
    writer: WriteHalf<BoxTransport>,
}

impl LinePeer {
    pub fn new(transport: BoxTransport) -> Self {
        let (r, w) = tokio::io::split(transport);
        LinePeer { reader: BufReader::new(r), writer: w }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send_line");
        self.writer.flush().await.expect("flush");
    }

    /// Next non-empty line, or `None` on EOF. Panics after two seconds of
    /// silence so a hung test fails loudly.
    pub async fn recv_line(&mut self) -> Option<String> {
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
                .await
                .expect("recv_line timed out")
                .expect("recv_line");
            if n == 0 {
                return None;
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                return Some(line.to_owned());
            }
        }
    }

    /// Read lines until one starts with `prefix`.
    pub async fn recv_until(&mut self, prefix: &str) -> String {
        loop {
            match self.recv_line().await {
                Some(line) if line.starts_with(prefix) => return line,
                Some(_) => continue,
                None => panic!("stream ended while waiting for {prefix:?}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording behavior
// ---------------------------------------------------------------------------

/// Everything a behavior callback can observe, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Happened {
    New { id: String },
    Event { id: String, values: Vec<FieldValue> },
    AsyncEvent { id: String, values: Vec<FieldValue> },
    Removed { id: String },
    Renamed { old_id: String, new_id: String },
    Enquire { query_id: u32 },
    Reply { query_id: u32, state: QueryState },
    Expired { query_id: u32 },
    ResetCompleted,
}

/// An [`ObjectBehavior`] that records every callback.
///
/// `sync_ok = false` pushes object events onto the async path;
/// `async_ok = false` makes the async handler fail (no ack).
pub struct Recorder {
    log: Mutex<Vec<Happened>>,
    pub sync_ok: AtomicBool,
    pub async_ok: AtomicBool,
    enquire_replies: Mutex<Vec<QueryReply>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
            sync_ok: AtomicBool::new(true),
            async_ok: AtomicBool::new(true),
            enquire_replies: Mutex::new(Vec::new()),
        })
    }

    /// An instance whose object events always take the async path.
    pub fn async_path() -> Arc<Recorder> {
        let r = Recorder::new();
        r.sync_ok.store(false, Ordering::SeqCst);
        r
    }

    /// Script the replies returned from the next `on_enquire`.
    pub fn script_replies(&self, replies: Vec<QueryReply>) {
        *self.enquire_replies.lock().unwrap() = replies;
    }

    pub fn log(&self) -> Vec<Happened> {
        self.log.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&Happened) -> bool>(&self, pred: F) -> usize {
        self.log.lock().unwrap().iter().filter(|h| pred(h)).count()
    }

    fn push(&self, happened: Happened) {
        self.log.lock().unwrap().push(happened);
    }

    /// Poll until `pred` over the log returns true.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&[Happened]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.log.lock().unwrap()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ObjectBehavior for Recorder {
    fn on_event(&self, obj: &DataObject) -> bool {
        if self.sync_ok.load(Ordering::SeqCst) {
            self.push(Happened::Event { id: obj.id.clone(), values: obj.values.clone() });
            true
        } else {
            false
        }
    }

    fn on_async_event(&self, obj: &DataObject) -> bool {
        if self.async_ok.load(Ordering::SeqCst) {
            self.push(Happened::AsyncEvent { id: obj.id.clone(), values: obj.values.clone() });
            true
        } else {
            false
        }
    }

    fn on_new(&self, obj: &DataObject) {
        self.push(Happened::New { id: obj.id.clone() });
    }

    fn on_removal(&self, obj: &DataObject) -> bool {
        self.push(Happened::Removed { id: obj.id.clone() });
        true
    }

    fn on_rename(&self, obj: &DataObject, old_id: &str) {
        self.push(Happened::Renamed { old_id: old_id.to_owned(), new_id: obj.id.clone() });
    }

    fn on_reset_completed(&self) {
        self.push(Happened::ResetCompleted);
    }

    fn on_enquire(&self, query: &QueryObject) -> Vec<QueryReply> {
        self.push(Happened::Enquire { query_id: query.query_id });
        std::mem::take(&mut *self.enquire_replies.lock().unwrap())
    }

    fn on_reply(&self, query: &QueryObject) {
        self.push(Happened::Reply { query_id: query.query_id, state: query.state });
    }

    fn on_expire(&self, query: &QueryObject) {
        self.push(Happened::Expired { query_id: query.query_id });
    }
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

/// Poll an arbitrary condition until it holds or the timeout passes.
pub async fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
