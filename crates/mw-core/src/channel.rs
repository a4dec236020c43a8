//! Buffered line channel over an abstract transport.
//!
//! A channel owns three long-lived jobs: a reader draining the transport
//! into line events, a writer draining the bounded send queue, and the
//! reconnect loop that re-dials the connector after a drop. (The protocol
//! monitor (ping, relogin, obsolescence) lives with the peer handler.)
//!
//! # Flushing
//! The writer tracks writes/sec over 30-second windows and adapts the
//! flush interval between 20 ms (quiet) and 1 s (busy) with a linear ramp.
//! Urgent items jump the queue and force an immediate flush.
//!
//! # Compression
//! Output stays plain UTF-8 until [`ChannelHandle::compress_output`] is
//! called; the writer then emits a single sentinel byte and gzips
//! everything after it. The reader watches for the same sentinel and
//! switches its direction independently.
//!
//! # Overflow
//! When the send queue is full and a backup file is configured, excess
//! lines spill to disk and are drained back in order once the queue has
//! room. Without a file the configured mode decides: block the producer
//! (lossless), drop all queued normal traffic (empty-on-full), or drop
//! the oldest item (discard-on-full).

use std::collections::VecDeque;
use std::io::{BufRead, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mw_protocol::consts::COMPRESS_SENTINEL;

use crate::transport::Connector;

// ---------------------------------------------------------------------------
// Config & events
// ---------------------------------------------------------------------------

/// What to do with a normal item when the send queue is full and no
/// backup file is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Block the producer until the writer frees space.
    Lossless,
    /// Drop everything queued (non-urgent) and accept the new item.
    EmptyOnFull,
    /// Drop the oldest queued item and accept the new one.
    DiscardOnFull,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    /// In-memory send queue bound.
    pub capacity: usize,
    /// Emit an empty keep-alive line after this much output silence;
    /// zero disables.
    pub keep_alive: Duration,
    /// `None` = do not reconnect after a drop.
    pub reconnect_wait: Option<Duration>,
    pub backup_file: Option<PathBuf>,
    pub backup_mode: BackupMode,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ChannelConfig {
            name: name.into(),
            capacity: mw_protocol::consts::DEFAULT_QUEUE_CAPACITY,
            keep_alive: mw_protocol::consts::KEEP_ALIVE_INTERVAL,
            reconnect_wait: None,
            backup_file: None,
            backup_mode: BackupMode::DiscardOnFull,
        }
    }
}

/// What the channel reports to its peer handler.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Transport (re-)established. Sequencers must restart from keyframes.
    Connected,
    /// One inbound line (never empty; keep-alives are swallowed).
    Line(String),
    /// Transport dropped. `reconnecting` tells whether a re-dial follows.
    Disconnected { reason: String, reconnecting: bool },
    /// The channel is done for good.
    Closed,
}

// ---------------------------------------------------------------------------
// Send queue
// ---------------------------------------------------------------------------

enum QueueItem {
    Line { line: String, urgent: bool },
    /// Flush, write the sentinel byte, and gzip from here on.
    StartCompress,
}

enum EnqueueOutcome {
    Accepted,
    Refused,
    WouldBlock,
}

struct SendQueue {
    items: VecDeque<QueueItem>,
    normal_count: usize,
    overflow: Option<OverflowFile>,
}

impl SendQueue {
    fn push(&mut self, line: String, urgent: bool, capacity: usize, mode: BackupMode) -> EnqueueOutcome {
        if urgent {
            self.items.push_front(QueueItem::Line { line, urgent: true });
            return EnqueueOutcome::Accepted;
        }
        if self.normal_count < capacity && self.overflow_is_empty() {
            self.items.push_back(QueueItem::Line { line, urgent: false });
            self.normal_count += 1;
            return EnqueueOutcome::Accepted;
        }
        if let Some(overflow) = &mut self.overflow {
            return match overflow.append(&line) {
                Ok(()) => EnqueueOutcome::Accepted,
                Err(e) => {
                    warn!(error = %e, "overflow file write failed, dropping line");
                    EnqueueOutcome::Refused
                }
            };
        }
        match mode {
            BackupMode::Lossless => EnqueueOutcome::WouldBlock,
            BackupMode::EmptyOnFull => {
                self.items.retain(|item| match item {
                    QueueItem::Line { urgent, .. } => *urgent,
                    QueueItem::StartCompress => true,
                });
                self.normal_count = 1;
                self.items.push_back(QueueItem::Line { line, urgent: false });
                EnqueueOutcome::Accepted
            }
            BackupMode::DiscardOnFull => {
                if let Some(pos) = self.items.iter().position(
                    |item| matches!(item, QueueItem::Line { urgent: false, .. }),
                ) {
                    self.items.remove(pos);
                    self.normal_count -= 1;
                }
                self.items.push_back(QueueItem::Line { line, urgent: false });
                self.normal_count += 1;
                EnqueueOutcome::Accepted
            }
        }
    }

    fn overflow_is_empty(&self) -> bool {
        self.overflow.as_ref().is_none_or(|o| o.pending == 0)
    }

    fn pop(&mut self, capacity: usize) -> Option<QueueItem> {
        if let Some(item) = self.items.pop_front() {
            if matches!(item, QueueItem::Line { urgent: false, .. }) {
                self.normal_count -= 1;
            }
            return Some(item);
        }
        // Queue drained: pull a batch back from the spill file.
        if let Some(overflow) = &mut self.overflow {
            match overflow.pop_batch(capacity.min(1024)) {
                Ok(lines) => {
                    for line in lines {
                        self.items.push_back(QueueItem::Line { line, urgent: false });
                        self.normal_count += 1;
                    }
                }
                Err(e) => warn!(error = %e, "overflow file read failed"),
            }
            if let Some(item) = self.items.pop_front() {
                if matches!(item, QueueItem::Line { urgent: false, .. }) {
                    self.normal_count -= 1;
                }
                return Some(item);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.overflow_is_empty()
    }
}

// ---------------------------------------------------------------------------
// Overflow file
// ---------------------------------------------------------------------------

/// Plain-text spill file: appended when the queue is full, drained from a
/// read offset, truncated once empty.
struct OverflowFile {
    path: PathBuf,
    read_offset: u64,
    pending: u64,
}

impl OverflowFile {
    fn new(path: PathBuf) -> Self {
        // A leftover file from a previous run is re-queued from the start.
        let pending = std::fs::File::open(&path)
            .map(|f| std::io::BufReader::new(f).lines().count() as u64)
            .unwrap_or(0);
        OverflowFile { path, read_offset: 0, pending }
    }

    fn append(&mut self, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        self.pending += 1;
        Ok(())
    }

    fn pop_batch(&mut self, max: usize) -> std::io::Result<Vec<String>> {
        if self.pending == 0 {
            return Ok(Vec::new());
        }
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.read_offset))?;
        let mut reader = std::io::BufReader::new(file);
        let mut lines = Vec::new();
        let mut consumed = 0u64;
        let mut buf = String::new();
        while lines.len() < max {
            buf.clear();
            let n = reader.read_line(&mut buf)?;
            if n == 0 {
                break;
            }
            consumed += n as u64;
            lines.push(buf.trim_end_matches('\n').to_owned());
        }
        self.read_offset += consumed;
        self.pending = self.pending.saturating_sub(lines.len() as u64);
        if self.pending == 0 {
            let _ = std::fs::remove_file(&self.path);
            self.read_offset = 0;
        }
        Ok(lines)
    }
}

// ---------------------------------------------------------------------------
// Shared state & handle
// ---------------------------------------------------------------------------

struct Shared {
    cfg: ChannelConfig,
    queue: Mutex<SendQueue>,
    wake_writer: Notify,
    space: Notify,
    closed: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Cloneable handle for submitting output and controlling the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Queue one line. May suspend when the queue is full in lossless
    /// mode; every other configuration returns promptly. Returns whether
    /// the line was accepted.
    pub async fn transmit(&self, line: String, urgent: bool) -> bool {
        loop {
            match self.try_transmit_inner(&line, urgent) {
                Ok(accepted) => return accepted,
                Err(()) => self.shared.space.notified().await,
            }
        }
    }

    /// Non-suspending variant: a full lossless queue refuses the line.
    pub fn try_transmit(&self, line: &str, urgent: bool) -> bool {
        self.try_transmit_inner(line, urgent).unwrap_or(false)
    }

    fn try_transmit_inner(&self, line: &str, urgent: bool) -> Result<bool, ()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let outcome = {
            let mut queue = self.shared.queue.lock().expect("queue poisoned");
            queue.push(
                line.to_owned(),
                urgent,
                self.shared.cfg.capacity,
                self.shared.cfg.backup_mode,
            )
        };
        match outcome {
            EnqueueOutcome::Accepted => {
                self.shared.wake_writer.notify_one();
                Ok(true)
            }
            EnqueueOutcome::Refused => Ok(false),
            EnqueueOutcome::WouldBlock => Err(()),
        }
    }

    /// Switch the outbound direction to gzip after flushing what is
    /// already queued.
    pub fn compress_output(&self) {
        let mut queue = self.shared.queue.lock().expect("queue poisoned");
        queue.items.push_back(QueueItem::StartCompress);
        drop(queue);
        self.shared.wake_writer.notify_one();
    }

    /// Shut the channel down for good (no reconnect).
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake_writer.notify_one();
        self.shared.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.cfg.name
    }

    pub fn bytes_in(&self) -> u64 {
        self.shared.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out.load(Ordering::Relaxed)
    }

    /// Queue depth (in-memory only), for back-pressure decisions.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().expect("queue poisoned").items.len()
    }
}

/// Bare handle over an undriven queue, for unit tests that only need
/// somewhere to enqueue.
#[cfg(test)]
pub(crate) fn test_handle() -> ChannelHandle {
    let shared = Arc::new(Shared {
        cfg: ChannelConfig::new("test"),
        queue: Mutex::new(SendQueue {
            items: VecDeque::new(),
            normal_count: 0,
            overflow: None,
        }),
        wake_writer: Notify::new(),
        space: Notify::new(),
        closed: AtomicBool::new(false),
        bytes_in: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
    });
    ChannelHandle { shared }
}

// ---------------------------------------------------------------------------
// Channel driver
// ---------------------------------------------------------------------------

/// Spawn a channel: returns the submit handle and the event stream.
pub fn spawn_channel(
    cfg: ChannelConfig,
    connector: Arc<dyn Connector>,
) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
    let overflow = cfg.backup_file.clone().map(OverflowFile::new);
    let shared = Arc::new(Shared {
        cfg,
        queue: Mutex::new(SendQueue {
            items: VecDeque::new(),
            normal_count: 0,
            overflow,
        }),
        wake_writer: Notify::new(),
        space: Notify::new(),
        closed: AtomicBool::new(false),
        bytes_in: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
    });
    let handle = ChannelHandle { shared: shared.clone() };
    let (events_tx, events_rx) = mpsc::channel(4096);
    tokio::spawn(drive(shared, connector, events_tx));
    (handle, events_rx)
}

async fn drive(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let transport = match connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                let reconnecting = shared.cfg.reconnect_wait.is_some();
                debug!(channel = %shared.cfg.name, error = %e, "connect failed");
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        reason: format!("connect: {e}"),
                        reconnecting,
                    })
                    .await;
                match shared.cfg.reconnect_wait {
                    Some(wait) => {
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => break,
                }
            }
        };

        info!(channel = %shared.cfg.name, "transport established");
        // Compression is negotiated per connection; drop stale markers.
        shared
            .queue
            .lock()
            .expect("queue poisoned")
            .items
            .retain(|item| matches!(item, QueueItem::Line { .. }));
        if events.send(ChannelEvent::Connected).await.is_err() {
            break;
        }

        let (read_half, write_half) = tokio::io::split(transport);
        let writer = tokio::spawn(write_loop(shared.clone(), write_half));
        let reason = read_loop(shared.clone(), read_half, &events).await;
        writer.abort();

        let reconnecting =
            shared.cfg.reconnect_wait.is_some() && !shared.closed.load(Ordering::Acquire);
        info!(channel = %shared.cfg.name, %reason, reconnecting, "transport dropped");
        let _ = events
            .send(ChannelEvent::Disconnected { reason, reconnecting })
            .await;
        if !reconnecting {
            break;
        }
        if let Some(wait) = shared.cfg.reconnect_wait {
            tokio::time::sleep(wait).await;
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.space.notify_waiters();
    let _ = events.send(ChannelEvent::Closed).await;
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

async fn read_loop(
    shared: Arc<Shared>,
    mut transport: tokio::io::ReadHalf<crate::transport::BoxTransport>,
    events: &mpsc::Sender<ChannelEvent>,
) -> String {
    let mut chunk = vec![0u8; 16 * 1024];
    let mut pending: Vec<u8> = Vec::new();
    let mut decoder: Option<GzDecoder<Vec<u8>>> = None;

    loop {
        let n = match transport.read(&mut chunk).await {
            Ok(0) => return "end of stream".to_owned(),
            Ok(n) => n,
            Err(e) => return format!("read: {e}"),
        };
        if shared.closed.load(Ordering::Acquire) {
            return "closed".to_owned();
        }
        shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

        let mut data = &chunk[..n];
        if decoder.is_none() {
            if let Some(pos) = data.iter().position(|b| *b == COMPRESS_SENTINEL) {
                pending.extend_from_slice(&data[..pos]);
                decoder = Some(GzDecoder::new(Vec::new()));
                debug!(channel = %shared.cfg.name, "inbound compression on");
                data = &data[pos + 1..];
            } else {
                pending.extend_from_slice(data);
                data = &[];
            }
        }
        if let Some(dec) = &mut decoder {
            if !data.is_empty() {
                if let Err(e) = dec.write_all(data).and_then(|()| dec.flush()) {
                    return format!("gunzip: {e}");
                }
                pending.append(dec.get_mut());
            }
        }

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = match std::str::from_utf8(&raw[..raw.len() - 1]) {
                Ok(s) => s.trim_end_matches('\r'),
                Err(_) => {
                    warn!(channel = %shared.cfg.name, "non-UTF-8 line dropped");
                    continue;
                }
            };
            if line.is_empty() {
                continue; // keep-alive
            }
            if events
                .send(ChannelEvent::Line(line.to_owned()))
                .await
                .is_err()
            {
                return "handler gone".to_owned();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

const FLUSH_MIN: Duration = Duration::from_millis(20);
const FLUSH_MAX: Duration = Duration::from_secs(1);
const RATE_WINDOW: Duration = Duration::from_secs(30);
/// Below this rate (writes/sec) the interval pins to `FLUSH_MIN`.
const RATE_LOW: f64 = 5.0;
/// Above this rate the interval pins to `FLUSH_MAX`.
const RATE_HIGH: f64 = 200.0;

/// Linear ramp between the two pins.
fn flush_interval(rate: f64) -> Duration {
    if rate <= RATE_LOW {
        return FLUSH_MIN;
    }
    if rate >= RATE_HIGH {
        return FLUSH_MAX;
    }
    let span = FLUSH_MAX.as_secs_f64() - FLUSH_MIN.as_secs_f64();
    let frac = (rate - RATE_LOW) / (RATE_HIGH - RATE_LOW);
    Duration::from_secs_f64(FLUSH_MIN.as_secs_f64() + span * frac)
}

async fn write_loop(
    shared: Arc<Shared>,
    mut transport: tokio::io::WriteHalf<crate::transport::BoxTransport>,
) {
    let mut out: Vec<u8> = Vec::new();
    let mut encoder: Option<GzEncoder<Vec<u8>>> = None;
    let mut encoder_dirty = false;
    let mut window_start = Instant::now();
    let mut window_writes = 0u32;
    let mut rate = 0.0f64;
    let mut last_flush = Instant::now();
    let mut last_output = Instant::now();

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let mut flush_urgent = false;
        let mut start_compress = false;
        loop {
            let item = {
                let mut queue = shared.queue.lock().expect("queue poisoned");
                queue.pop(shared.cfg.capacity)
            };
            let Some(item) = item else { break };
            match item {
                QueueItem::Line { line, urgent } => {
                    append_line(&mut out, &mut encoder, &line);
                    encoder_dirty = encoder.is_some();
                    window_writes += 1;
                    if urgent {
                        flush_urgent = true;
                    }
                }
                QueueItem::StartCompress => {
                    start_compress = true;
                    break;
                }
            }
        }
        shared.space.notify_waiters();

        if window_start.elapsed() >= RATE_WINDOW {
            rate = f64::from(window_writes) / window_start.elapsed().as_secs_f64();
            window_start = Instant::now();
            window_writes = 0;
        }

        let interval = flush_interval(rate);
        let due = flush_urgent || start_compress || last_flush.elapsed() >= interval;
        if due && (!out.is_empty() || encoder_dirty) {
            if encoder_dirty {
                if let Some(enc) = &mut encoder {
                    if enc.flush().is_ok() {
                        out.append(enc.get_mut());
                    }
                }
                encoder_dirty = false;
            }
            if !out.is_empty() {
                if let Err(e) = transport.write_all(&out).await {
                    warn!(channel = %shared.cfg.name, error = %e, "write failed");
                    return;
                }
                if transport.flush().await.is_err() {
                    return;
                }
                shared.bytes_out.fetch_add(out.len() as u64, Ordering::Relaxed);
                out.clear();
                last_output = Instant::now();
            }
            last_flush = Instant::now();
        }

        if start_compress {
            if transport.write_all(&[COMPRESS_SENTINEL]).await.is_err() {
                return;
            }
            let _ = transport.flush().await;
            encoder = Some(GzEncoder::new(Vec::new(), Compression::default()));
            info!(channel = %shared.cfg.name, "outbound compression on");
            continue;
        }

        // Keep-alive: an empty line during prolonged output silence.
        if !shared.cfg.keep_alive.is_zero() && last_output.elapsed() >= shared.cfg.keep_alive {
            append_line(&mut out, &mut encoder, "");
            last_output = Instant::now();
            continue;
        }

        let idle_wait = if shared.cfg.keep_alive.is_zero() {
            Duration::from_secs(3600)
        } else {
            shared.cfg.keep_alive
        };
        let wait = if out.is_empty() && shared.queue.lock().expect("queue poisoned").is_empty() {
            idle_wait.min(Duration::from_secs(5))
        } else {
            interval
        };
        tokio::select! {
            () = shared.wake_writer.notified() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }
}

fn append_line(out: &mut Vec<u8>, encoder: &mut Option<GzEncoder<Vec<u8>>>, line: &str) {
    match encoder {
        Some(enc) => {
            let _ = enc.write_all(line.as_bytes());
            let _ = enc.write_all(b"\n");
        }
        None => {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
    }
}

// ---------------------------------------------------------------------------
// Clock sync
// ---------------------------------------------------------------------------

/// Round-trip and skew from one ping/pong exchange, standard NTP-style:
/// the remote clock is compared against the midpoint of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    pub round_trip_ms: i64,
    pub clock_diff_ms: i64,
}

pub fn clock_sync(
    ping_sent: chrono::DateTime<chrono::Utc>,
    pong_remote: chrono::DateTime<chrono::Utc>,
    pong_received: chrono::DateTime<chrono::Utc>,
) -> ClockSync {
    let round_trip_ms = (pong_received - ping_sent).num_milliseconds();
    let midpoint = ping_sent + chrono::Duration::milliseconds(round_trip_ms / 2);
    ClockSync {
        round_trip_ms,
        clock_diff_ms: (pong_remote - midpoint).num_milliseconds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxTransport, FnConnector, OnceConnector};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncReadExt as _;

    fn duplex_connector(other: &mut Option<tokio::io::DuplexStream>) -> Arc<OnceConnector> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        *other = Some(b);
        Arc::new(OnceConnector::new(Box::new(a) as BoxTransport))
    }

    async fn read_some(side: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), side.read(&mut buf))
            .await
            .expect("read timeout")
            .expect("read");
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn transmitted_lines_reach_the_peer() {
        let mut far = None;
        let connector = duplex_connector(&mut far);
        let (handle, mut events) = spawn_channel(ChannelConfig::new("t"), connector);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));

        assert!(handle.transmit("$Px,a,0,||1,k,f".to_owned(), false).await);
        let bytes = read_some(far.as_mut().unwrap()).await;
        assert_eq!(bytes, b"$Px,a,0,||1,k,f\n");
        assert!(handle.bytes_out() > 0);
        handle.close();
    }

    #[tokio::test]
    async fn inbound_lines_surface_as_events() {
        let mut far = None;
        let connector = duplex_connector(&mut far);
        let (handle, mut events) = spawn_channel(ChannelConfig::new("t"), connector);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));

        far.as_mut()
            .unwrap()
            .write_all(b"hello-line\n\nsecond\n")
            .await
            .unwrap();
        match events.recv().await {
            Some(ChannelEvent::Line(l)) => assert_eq!(l, "hello-line"),
            other => panic!("expected line, got {other:?}"),
        }
        // The empty keep-alive line is swallowed.
        match events.recv().await {
            Some(ChannelEvent::Line(l)) => assert_eq!(l, "second"),
            other => panic!("expected line, got {other:?}"),
        }
        handle.close();
    }

    #[tokio::test]
    async fn urgent_lines_jump_the_queue() {
        // Hold the connector shut so the backlog builds deterministically.
        let gate: Arc<StdMutex<Option<tokio::io::DuplexStream>>> = Arc::new(StdMutex::new(None));
        let gate2 = gate.clone();
        let connector = Arc::new(FnConnector(move || {
            let gate = gate2.clone();
            async move {
                loop {
                    if let Some(t) = gate.lock().unwrap().take() {
                        return Ok(Box::new(t) as BoxTransport);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }));
        let (handle, mut events) = spawn_channel(ChannelConfig::new("t"), connector);

        for i in 0..50 {
            assert!(handle.transmit(format!("normal-{i}"), false).await);
        }
        assert!(handle.transmit("urgent-now".to_owned(), true).await);

        let (a, mut b) = tokio::io::duplex(256 * 1024);
        *gate.lock().unwrap() = Some(a);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));

        let mut text = String::new();
        while text.matches('\n').count() < 51 {
            let chunk = read_some(&mut b).await;
            text.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        // The urgent line was pushed to the front of the backlog.
        assert_eq!(text.lines().next(), Some("urgent-now"));
        handle.close();
    }

    #[tokio::test]
    async fn compression_switchover_is_marked_and_decodable() {
        let mut far = None;
        let connector = duplex_connector(&mut far);
        let (handle, mut events) = spawn_channel(ChannelConfig::new("t"), connector);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));

        assert!(handle.transmit("plain".to_owned(), true).await);
        handle.compress_output();
        // Non-urgent so the line stays behind the switchover marker.
        assert!(handle.transmit("squeezed".to_owned(), false).await);

        let mut bytes = Vec::new();
        loop {
            bytes.extend_from_slice(&read_some(far.as_mut().unwrap()).await);
            if bytes.contains(&COMPRESS_SENTINEL) && bytes.len() > b"plain\n".len() + 1 + 10 {
                break;
            }
        }
        let sentinel = bytes.iter().position(|b| *b == COMPRESS_SENTINEL).unwrap();
        assert_eq!(&bytes[..sentinel], b"plain\n");

        let mut dec = GzDecoder::new(Vec::new());
        dec.write_all(&bytes[sentinel + 1..]).unwrap();
        dec.flush().unwrap();
        assert_eq!(dec.get_ref().as_slice(), b"squeezed\n");
        handle.close();
    }

    #[tokio::test]
    async fn discard_on_full_drops_the_oldest() {
        let mut cfg = ChannelConfig::new("t");
        cfg.capacity = 3;
        // Connector that never resolves: the writer cannot drain.
        let connector = Arc::new(FnConnector(|| async {
            std::future::pending::<std::io::Result<BoxTransport>>().await
        }));
        let (handle, _events) = spawn_channel(cfg, connector);

        for i in 0..5 {
            assert!(handle.transmit(format!("n{i}"), false).await);
        }
        assert_eq!(handle.queued(), 3);
        handle.close();
    }

    #[tokio::test]
    async fn overflow_file_preserves_order_across_the_spill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.txt");

        let gate: Arc<StdMutex<Option<tokio::io::DuplexStream>>> = Arc::new(StdMutex::new(None));
        let gate2 = gate.clone();
        let connector = Arc::new(FnConnector(move || {
            let gate = gate2.clone();
            async move {
                loop {
                    if let Some(t) = gate.lock().unwrap().take() {
                        return Ok(Box::new(t) as BoxTransport);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }));

        let mut cfg = ChannelConfig::new("t");
        cfg.capacity = 2;
        cfg.backup_file = Some(path.clone());
        cfg.reconnect_wait = Some(Duration::from_millis(10));
        let (handle, mut events) = spawn_channel(cfg, connector);

        for i in 0..6 {
            assert!(handle.transmit(format!("line-{i}"), false).await);
        }
        assert!(path.exists(), "spill file should exist while blocked");

        // Now let the channel connect and drain everything.
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        *gate.lock().unwrap() = Some(a);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connected)));

        let mut text = String::new();
        while text.matches('\n').count() < 6 {
            let chunk = read_some(&mut b).await;
            text.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        let got: Vec<&str> = text.lines().collect();
        assert_eq!(got, ["line-0", "line-1", "line-2", "line-3", "line-4", "line-5"]);
        handle.close();
    }

    #[test]
    fn flush_interval_ramps_between_the_pins() {
        assert_eq!(flush_interval(0.0), FLUSH_MIN);
        assert_eq!(flush_interval(1000.0), FLUSH_MAX);
        let mid = flush_interval((RATE_LOW + RATE_HIGH) / 2.0);
        assert!(mid > FLUSH_MIN && mid < FLUSH_MAX);
    }

    #[test]
    fn clock_sync_uses_the_ntp_midpoint() {
        use chrono::TimeZone;
        let t0 = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let remote = t0 + chrono::Duration::milliseconds(150); // remote clock at pong
        let t1 = t0 + chrono::Duration::milliseconds(100); // received after 100ms RTT
        let sync = clock_sync(t0, remote, t1);
        assert_eq!(sync.round_trip_ms, 100);
        assert_eq!(sync.clock_diff_ms, 100);
    }
}
