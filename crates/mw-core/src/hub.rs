//! Routing core: the peer table, destination filtering, duplicate
//! suppression and lossless acknowledgment bookkeeping.
//!
//! One [`Peer`] exists per channel. The hub owns the peer list plus the
//! per-(origin, type) receive counters used to guarantee that a frame is
//! never processed twice, and decides which peers a frame is forwarded to:
//! peers that need the type (subscription or hub mode) and whose reachable
//! node set intersects the frame's destinations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mw_protocol::consts::LOSSLESS_SUFFIX;
use mw_protocol::control::AppInfo;
use mw_protocol::Destinations;

use crate::channel::ChannelHandle;
use crate::sequencer::{FullFrame, SendSequencer};
use crate::stats::ChannelStats;

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Login-handshake progress of one channel peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    LoginSent,
    LoggedIn,
    Monitoring,
    Disconnected,
}

/// Which nodes (by UUID) need a type through this channel, and whether
/// any of them subscribed losslessly.
#[derive(Debug, Default)]
pub struct WantEntry {
    pub nodes: HashSet<Uuid>,
    pub lossless: bool,
}

/// Subscription wildcard: a hub peer that forwards everything.
pub const WANT_ALL: &str = "*";

#[derive(Default)]
struct SendState {
    seqs: HashMap<String, SendSequencer>,
}

struct PendingAck {
    frame: FullFrame,
    first_sent: DateTime<Utc>,
    last_sent: DateTime<Utc>,
}

#[derive(Default)]
struct AckTable {
    next_seq: u64,
    pending: BTreeMap<u64, PendingAck>,
}

pub struct Peer {
    pub name: String,
    pub channel: ChannelHandle,
    /// We accepted this connection and wait for the remote's login.
    pub server_side: bool,
    state: Mutex<PeerState>,
    info: RwLock<Option<AppInfo>>,
    connected_nodes: RwLock<HashSet<Uuid>>,
    wants: RwLock<HashMap<String, WantEntry>>,
    // tokio mutex: held across the transmit await so that sequence
    // numbering order equals queue order.
    send: tokio::sync::Mutex<SendState>,
    acks: Mutex<HashMap<String, AckTable>>,
    pub stats: ChannelStats,
    last_input: Mutex<DateTime<Utc>>,
    clock_diff_ms: AtomicI64,
    pub connected_since: Mutex<DateTime<Utc>>,
}

impl Peer {
    pub fn new(name: impl Into<String>, channel: ChannelHandle, server_side: bool) -> Arc<Peer> {
        Arc::new(Peer {
            name: name.into(),
            channel,
            server_side,
            state: Mutex::new(PeerState::Connecting),
            info: RwLock::new(None),
            connected_nodes: RwLock::new(HashSet::new()),
            wants: RwLock::new(HashMap::new()),
            send: tokio::sync::Mutex::new(SendState::default()),
            acks: Mutex::new(HashMap::new()),
            stats: ChannelStats::new(),
            last_input: Mutex::new(Utc::now()),
            clock_diff_ms: AtomicI64::new(0),
            connected_since: Mutex::new(Utc::now()),
        })
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("peer poisoned")
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().expect("peer poisoned") = state;
    }

    pub fn logged_in(&self) -> bool {
        matches!(self.state(), PeerState::LoggedIn | PeerState::Monitoring)
    }

    pub fn set_info(&self, info: AppInfo) {
        *self.info.write().expect("peer poisoned") = Some(info);
    }

    pub fn info(&self) -> Option<AppInfo> {
        self.info.read().expect("peer poisoned").clone()
    }

    pub fn remote_uuid(&self) -> Option<Uuid> {
        self.info.read().expect("peer poisoned").as_ref().map(|i| i.app_uuid)
    }

    pub fn touch_input(&self) {
        *self.last_input.lock().expect("peer poisoned") = Utc::now();
    }

    pub fn last_input(&self) -> DateTime<Utc> {
        *self.last_input.lock().expect("peer poisoned")
    }

    pub fn set_clock_diff_ms(&self, diff: i64) {
        self.clock_diff_ms.store(diff, Ordering::Relaxed);
    }

    pub fn clock_diff_ms(&self) -> i64 {
        self.clock_diff_ms.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connected-node and subscription tracking
    // -----------------------------------------------------------------------

    /// Record a node as reachable through this channel. `true` if new.
    pub fn add_connected_node(&self, uuid: Uuid) -> bool {
        self.connected_nodes.write().expect("peer poisoned").insert(uuid)
    }

    pub fn connected_nodes(&self) -> HashSet<Uuid> {
        self.connected_nodes.read().expect("peer poisoned").clone()
    }

    /// Drop departed nodes; returns the ones that were actually present.
    pub fn remove_connected_nodes(&self, gone: &[Uuid]) -> Vec<Uuid> {
        let mut nodes = self.connected_nodes.write().expect("peer poisoned");
        gone.iter().filter(|u| nodes.remove(u)).copied().collect()
    }

    /// Register a subscription from `node` for a (possibly `+`-suffixed)
    /// type code arriving in a reset request.
    pub fn register_want(&self, code_with_suffix: &str, node: Uuid) {
        let (code, lossless) = split_lossless(code_with_suffix);
        let mut wants = self.wants.write().expect("peer poisoned");
        let entry = wants.entry(code.to_owned()).or_default();
        entry.nodes.insert(node);
        entry.lossless |= lossless;
    }

    /// Remove departed nodes from every subscription; returns the type
    /// codes that no connected node needs any more.
    pub fn prune_wants(&self, gone: &[Uuid]) -> Vec<String> {
        let mut wants = self.wants.write().expect("peer poisoned");
        let mut dead = Vec::new();
        for (code, entry) in wants.iter_mut() {
            for uuid in gone {
                entry.nodes.remove(uuid);
            }
            if entry.nodes.is_empty() {
                dead.push(code.clone());
            }
        }
        for code in &dead {
            wants.remove(code);
        }
        dead
    }

    /// Does any node behind this channel need the type? Returns the
    /// lossless flag when yes.
    pub fn wants_type(&self, code: &str) -> Option<bool> {
        let wants = self.wants.read().expect("peer poisoned");
        if let Some(entry) = wants.get(code) {
            return Some(entry.lossless);
        }
        wants.get(WANT_ALL).map(|entry| entry.lossless)
    }

    // -----------------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------------

    /// Encode through this channel's per-type send sequencer and queue the
    /// line. Returns whether the channel accepted it. The send lock stays
    /// held until the line is queued so that sequence numbering order
    /// equals transmit order.
    pub async fn send_frame(&self, frame: &FullFrame, urgent: bool) -> bool {
        let mut send = self.send.lock().await;
        let seq = send.seqs.entry(frame.type_code.clone()).or_insert_with(SendSequencer::new);
        let line = seq.encode(frame).encode();
        let accepted = self.channel.transmit(line, urgent).await;
        drop(send);
        if accepted {
            self.stats.output.record(1, None);
        }
        accepted
    }

    /// Force the next frame of a type into a keyframe (reset replay).
    pub async fn reset_send_sequencer(&self, type_code: &str) {
        let mut send = self.send.lock().await;
        send.seqs.entry(type_code.to_owned()).or_insert_with(SendSequencer::new).reset();
    }

    /// Transport dropped: every stream restarts from a keyframe and the
    /// handshake starts over.
    pub async fn clear_session(&self) {
        self.send.lock().await.seqs.clear();
        self.set_state(PeerState::Connecting);
        *self.info.write().expect("peer poisoned") = None;
    }

    // -----------------------------------------------------------------------
    // Lossless acknowledgment bookkeeping
    // -----------------------------------------------------------------------

    /// Assign the next ack sequence for the frame's type and remember the
    /// frame until the peer acknowledges it.
    pub fn arm_ack(&self, frame: &mut FullFrame) {
        let mut acks = self.acks.lock().expect("peer poisoned");
        let table = acks.entry(frame.type_code.clone()).or_default();
        table.next_seq += 1;
        frame.ack_seq = Some(table.next_seq);
        let now = Utc::now();
        table.pending.insert(
            table.next_seq,
            PendingAck { frame: frame.clone(), first_sent: now, last_sent: now },
        );
    }

    /// The peer confirmed one frame. `true` if it was outstanding.
    pub fn ack_received(&self, type_code: &str, ack_seq: u64) -> bool {
        let mut acks = self.acks.lock().expect("peer poisoned");
        match acks.get_mut(type_code) {
            Some(table) => table.pending.remove(&ack_seq).is_some(),
            None => false,
        }
    }

    /// Outstanding frames due for a resend; drops entries past the
    /// retention cutoff (the consumer is considered gone).
    pub fn collect_resends(
        &self,
        resend_after: ChronoDuration,
        retention: ChronoDuration,
    ) -> Vec<FullFrame> {
        let now = Utc::now();
        let mut due = Vec::new();
        let mut acks = self.acks.lock().expect("peer poisoned");
        for (code, table) in acks.iter_mut() {
            let expired: Vec<u64> = table
                .pending
                .iter()
                .filter(|(_, p)| now - p.first_sent >= retention)
                .map(|(s, _)| *s)
                .collect();
            for seq in expired {
                warn!(type_code = %code, ack_seq = seq, "lossless retention exceeded, dropping");
                table.pending.remove(&seq);
            }
            for pending in table.pending.values_mut() {
                if now - pending.last_sent >= resend_after {
                    pending.last_sent = now;
                    due.push(pending.frame.clone());
                }
            }
        }
        due
    }

    pub fn pending_ack_count(&self, type_code: &str) -> usize {
        self.acks
            .lock()
            .expect("peer poisoned")
            .get(type_code)
            .map_or(0, |t| t.pending.len())
    }
}

fn split_lossless(code: &str) -> (&str, bool) {
    match code.strip_suffix(LOSSLESS_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (code, false),
    }
}

// ---------------------------------------------------------------------------
// Destination relevance
// ---------------------------------------------------------------------------

/// Is a destination set addressed to us, and to anyone else?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForMe {
    /// Not addressed to this node.
    Not,
    /// Addressed to this node along with others.
    Shared,
    /// Addressed exclusively to this node.
    Exclusive,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    uuid: Uuid,
    hub_mode: bool,
    peers: RwLock<Vec<Arc<Peer>>>,
    seen: Mutex<HashMap<(Uuid, String), u64>>,
}

impl Hub {
    pub fn new(uuid: Uuid, hub_mode: bool) -> Self {
        Hub {
            uuid,
            hub_mode,
            peers: RwLock::new(Vec::new()),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn hub_mode(&self) -> bool {
        self.hub_mode
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        info!(peer = %peer.name, "peer registered");
        self.peers.write().expect("hub poisoned").push(peer);
    }

    pub fn drop_peer(&self, peer: &Arc<Peer>) {
        self.peers
            .write()
            .expect("hub poisoned")
            .retain(|p| !Arc::ptr_eq(p, peer));
    }

    /// Copy-on-read snapshot for broadcast enumeration.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().expect("hub poisoned").clone()
    }

    pub fn peer_named(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("hub poisoned")
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn is_me(&self, uuid: Uuid) -> bool {
        uuid == self.uuid
    }

    pub fn for_me(&self, destinations: &Destinations) -> ForMe {
        match destinations {
            Destinations::All => ForMe::Shared,
            Destinations::Empty => ForMe::Not,
            Destinations::Set(uuids) => {
                if !uuids.contains(&self.uuid) {
                    ForMe::Not
                } else if uuids.len() == 1 {
                    ForMe::Exclusive
                } else {
                    ForMe::Shared
                }
            }
        }
    }

    /// Per-(origin, type) monotone duplicate filter. `true` = fresh.
    pub fn register_seen(&self, origin: Uuid, type_code: &str, obj_seq: u64) -> bool {
        let mut seen = self.seen.lock().expect("hub poisoned");
        let entry = seen.entry((origin, type_code.to_owned())).or_insert(0);
        if obj_seq <= *entry {
            debug!(%origin, type_code, obj_seq, last = *entry, "duplicate frame suppressed");
            return false;
        }
        *entry = obj_seq;
        true
    }

    /// Forget receive counters for an origin (it reset or left the mesh,
    /// and will restart its object sequences).
    pub fn clear_seen_for(&self, origin: Uuid) {
        self.seen
            .lock()
            .expect("hub poisoned")
            .retain(|(o, _), _| *o != origin);
    }

    /// Should `frame` go out on `peer`? `Some(lossless)` when yes.
    pub fn peer_eligible(&self, peer: &Arc<Peer>, frame: &FullFrame) -> Option<bool> {
        if !peer.logged_in() {
            return None;
        }
        // Query frames chase producers, which never subscribe; they go to
        // every peer the destination filter allows. Acks are never armed
        // for them.
        let lossless = if frame.prefix.is_query() {
            false
        } else {
            peer.wants_type(&frame.type_code)?
        };
        let addressed = match &frame.destinations {
            Destinations::All => true,
            Destinations::Empty => false,
            Destinations::Set(uuids) => {
                let nodes = peer.connected_nodes();
                uuids.iter().any(|u| nodes.contains(u))
                    || peer.remote_uuid().is_some_and(|r| uuids.contains(&r))
            }
        };
        addressed.then_some(lossless)
    }

    /// Fan a frame out to every eligible peer except the arrival channel.
    /// Returns how many peers accepted it.
    pub async fn route(
        &self,
        frame: &FullFrame,
        exclude: Option<&Arc<Peer>>,
        urgent: bool,
    ) -> usize {
        let mut sent = 0;
        for peer in self.peers() {
            if let Some(exclude) = exclude {
                if Arc::ptr_eq(&peer, exclude) {
                    continue;
                }
            }
            let Some(lossless) = self.peer_eligible(&peer, frame) else {
                continue;
            };
            let mut out = frame.clone();
            out.ack_seq = None;
            if lossless {
                peer.arm_ack(&mut out);
            }
            if peer.send_frame(&out, urgent).await {
                sent += 1;
            }
        }
        sent
    }

    /// Send a control line to every logged-in peer except one.
    pub async fn broadcast_control(&self, line: &str, exclude: Option<&Arc<Peer>>) {
        for peer in self.peers() {
            if let Some(exclude) = exclude {
                if Arc::ptr_eq(&peer, exclude) {
                    continue;
                }
            }
            if peer.logged_in() {
                peer.channel.transmit(line.to_owned(), true).await;
            }
        }
    }
}
