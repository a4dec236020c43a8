//! The runtime handle.
//!
//! One `Runtime` is constructed per process (no globals): it owns the type
//! registry, the object tree, the hub and the per-type dispatchers, and is
//! cheap to clone into every task that needs it. The embedding application
//! builds it with [`RuntimeBuilder`], registers types, declares what it
//! produces and consumes, starts it, and attaches channels.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mw_codec::fields::FieldValue;
use mw_codec::timefmt;
use mw_protocol::consts::{
    CORE_VERSION, DEFAULT_ACK_TIMEOUT, DEFAULT_RESET_RATE, LOSSLESS_SUFFIX,
};
use mw_protocol::control::{AppInfo, ResetRequest};
use mw_protocol::{Control, Destinations, Prefix};

use crate::channel::{ChannelConfig, ChannelHandle, spawn_channel};
use crate::config::Config;
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::CoreError;
use crate::event::{AckTicket, Event};
use crate::hub::{ForMe, Hub, Peer, WANT_ALL};
use crate::import;
use crate::moderator::TransmitModerator;
use crate::node_table::PeerNodeTable;
use crate::object::DataObject;
use crate::query::{QueryObject, QueryState, QueryTable, ReplyDisposition};
use crate::registry::{TypeRegistry, TypeSpec};
use crate::resetter::Resetter;
use crate::sequencer::FullFrame;
use crate::transport::{BoxTransport, Connector, OnceConnector};
use crate::tree::{ObjectTree, TreeNode, TreeUpdate};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RuntimeBuilder {
    config: Config,
    registry: TypeRegistry,
    produced: HashSet<String>,
    consumed: HashMap<String, bool>,
    app_name: String,
    app_version: String,
    user_id: Option<String>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            config: Config::new(),
            registry: TypeRegistry::new(),
            produced: HashSet::new(),
            consumed: HashMap::new(),
            app_name: "meshwire-node".to_owned(),
            app_version: "0".to_owned(),
            user_id: None,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        RuntimeBuilder::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn app(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.app_name = name.into();
        self.app_version = version.into();
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn register(mut self, spec: TypeSpec) -> Self {
        self.registry.register(spec);
        self
    }

    /// Declare a produced type (must be registered).
    pub fn produce(mut self, code: impl Into<String>) -> Self {
        self.produced.insert(code.into());
        self
    }

    /// Declare a consumed type; a trailing `+` subscribes losslessly.
    pub fn consume(mut self, code: impl Into<String>) -> Self {
        let code = code.into();
        match code.strip_suffix(LOSSLESS_SUFFIX) {
            Some(stripped) => self.consumed.insert(stripped.to_owned(), true),
            None => self.consumed.insert(code, false),
        };
        self
    }

    pub fn build(self) -> Result<Runtime, CoreError> {
        self.registry.validate()?;
        for code in self.produced.iter().chain(self.consumed.keys()) {
            if !self.registry.contains(code) {
                return Err(CoreError::Fatal(format!(
                    "declared type '{code}' is not registered"
                )));
            }
        }
        let app_name = match self.config.get("node-name") {
            Some(name) => name.to_owned(),
            None => self.app_name,
        };
        let (shutdown, _) = watch::channel(false);
        let uuid = Uuid::new_v4();
        let hub = Hub::new(uuid, self.config.get_bool("hub-mode"));
        let inner = RuntimeInner {
            uuid,
            app_name,
            app_version: self.app_version,
            user_id: self.user_id,
            hub,
            config: self.config,
            registry: self.registry,
            tree: ObjectTree::new(),
            produced: self.produced,
            consumed: self.consumed,
            dispatchers: RwLock::new(HashMap::new()),
            queries: QueryTable::new(),
            node_table: PeerNodeTable::new(),
            deploy_time: Utc::now(),
            commit_counters: Mutex::new(HashMap::new()),
            reset_seq: AtomicU32::new(0),
            resetters: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown,
        };
        Ok(Runtime { inner: Arc::new(inner) })
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub(crate) struct RuntimeInner {
    uuid: Uuid,
    app_name: String,
    app_version: String,
    user_id: Option<String>,
    config: Config,
    registry: TypeRegistry,
    tree: ObjectTree,
    hub: Hub,
    produced: HashSet<String>,
    consumed: HashMap<String, bool>,
    dispatchers: RwLock<HashMap<String, Arc<Dispatcher>>>,
    queries: QueryTable,
    node_table: PeerNodeTable,
    deploy_time: chrono::DateTime<Utc>,
    commit_counters: Mutex<HashMap<String, u64>>,
    reset_seq: AtomicU32,
    resetters: Mutex<HashMap<(String, String), Arc<Resetter>>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn tree(&self) -> &ObjectTree {
        &self.inner.tree
    }

    pub(crate) fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn produces(&self, code: &str) -> bool {
        self.inner.produced.contains(code)
    }

    pub fn consumes(&self, code: &str) -> bool {
        self.inner.consumed.contains_key(code)
    }

    pub fn consumes_lossless(&self, code: &str) -> bool {
        self.inner.consumed.get(code).copied().unwrap_or(false)
    }

    pub(crate) fn app_info(&self) -> AppInfo {
        AppInfo {
            app_name: self.inner.app_name.clone(),
            app_version: self.inner.app_version.clone(),
            core_version: CORE_VERSION.to_owned(),
            app_uuid: self.inner.uuid,
            user_id: self.inner.user_id.clone(),
        }
    }

    /// Type codes we consume, `+`-suffixed where lossless, for the
    /// subscription reset request. Hub mode subscribes to everything.
    pub(crate) fn subscription_codes(&self) -> Vec<String> {
        if self.inner.hub.hub_mode() {
            return vec![WANT_ALL.to_owned()];
        }
        let mut codes: Vec<String> = self
            .inner
            .consumed
            .iter()
            .map(|(code, lossless)| {
                if *lossless {
                    format!("{code}{LOSSLESS_SUFFIX}")
                } else {
                    code.clone()
                }
            })
            .collect();
        codes.sort();
        codes
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start dispatcher pools and background sweeps. Idempotent.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handler = self.event_handler();
        let mut dispatchers = self.inner.dispatchers.write().expect("runtime poisoned");
        for code in self.inner.registry.codes() {
            let spec = self.inner.registry.get(code).expect("registered");
            let lossless = self.consumes_lossless(code);
            let workers = Dispatcher::worker_count(spec.threads, lossless);
            let capacity = self
                .inner
                .config
                .get_u64("queue-capacity", mw_protocol::consts::DEFAULT_QUEUE_CAPACITY as u64)
                as usize;
            dispatchers.insert(
                code.to_owned(),
                Arc::new(Dispatcher::start(code, workers, capacity, lossless, handler.clone())),
            );
        }
        drop(dispatchers);
        self.spawn_ack_sweep();
        info!(app = %self.inner.app_name, uuid = %self.inner.uuid, "runtime started");
        Ok(())
    }

    /// Cooperative shutdown. With `flush` the channels get a bounded
    /// chance to drain their queues first.
    pub async fn shutdown(&self, flush: bool) {
        let _ = self.inner.shutdown.send(true);
        let peers = self.inner.hub.peers();
        if flush {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            for peer in &peers {
                while peer.channel.queued() > 0 && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
        for peer in &peers {
            peer.channel.close();
        }
        // Grace period for readers/writers to notice.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.tree.cleanup();
        info!(app = %self.inner.app_name, "runtime stopped");
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Attach an outgoing channel (we dial; consumer→producer login).
    pub fn connect(&self, cfg: ChannelConfig, connector: Arc<dyn Connector>) -> Arc<Peer> {
        let (handle, events) = spawn_channel(cfg, connector);
        self.attach(handle, events, false)
    }

    /// Attach an accepted connection (we answer the remote's login).
    pub fn serve(&self, name: &str, transport: BoxTransport) -> Arc<Peer> {
        let cfg = ChannelConfig::new(name);
        let (handle, events) = spawn_channel(cfg, Arc::new(OnceConnector::new(transport)));
        self.attach(handle, events, true)
    }

    fn attach(
        &self,
        handle: ChannelHandle,
        events: tokio::sync::mpsc::Receiver<crate::channel::ChannelEvent>,
        server_side: bool,
    ) -> Arc<Peer> {
        let peer = Peer::new(handle.name(), handle.clone(), server_side);
        self.inner.hub.add_peer(peer.clone());
        tokio::spawn(crate::handler::run_peer(self.clone(), peer.clone(), events));
        peer
    }

    /// Attach an import channel: every inbound line is a foreign payload.
    pub fn import_channel(&self, cfg: ChannelConfig, connector: Arc<dyn Connector>) {
        let (handle, mut events) = spawn_channel(cfg, connector);
        let rt = self.clone();
        let name = handle.name().to_owned();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    crate::channel::ChannelEvent::Line(line) => {
                        rt.import_foreign(&line, &name).await;
                    }
                    crate::channel::ChannelEvent::Closed => break,
                    _ => {}
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Producer API
    // -----------------------------------------------------------------------

    /// Create (idempotently) an object we produce.
    pub fn create(&self, type_code: &str, keys: &[&str]) -> Result<Arc<TreeNode>, CoreError> {
        let owned: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        let uuid = self.inner.uuid;
        let code = type_code.to_owned();
        let (node, _) = self.inner.tree.create(&self.inner.registry, type_code, &owned, move || {
            DataObject::new(code, String::new(), uuid)
        })?;
        Ok(node)
    }

    /// Mutate an object's field values in place (no transmission).
    pub fn update(
        &self,
        type_code: &str,
        keys: &[&str],
        values: Vec<FieldValue>,
    ) -> Result<Arc<TreeNode>, CoreError> {
        let node = self.create(type_code, keys)?;
        node.with_object_mut(|obj| obj.values = values);
        Ok(node)
    }

    /// Publish the current state of an object to the mesh.
    pub async fn commit(&self, type_code: &str, keys: &[&str]) -> Result<(), CoreError> {
        let node = self
            .inner
            .tree
            .get(&self.inner.registry, type_code, keys)
            .ok_or_else(|| {
                CoreError::Application(format!("commit: no object {type_code}/{keys:?}"))
            })?;
        let obj = node.snapshot().ok_or_else(|| {
            CoreError::Application("commit: node without object record".to_owned())
        })?;
        self.commit_object(obj).await
    }

    /// Publish a free-standing object (disposable types, imports).
    pub async fn commit_object(&self, mut obj: DataObject) -> Result<(), CoreError> {
        let spec = self.inner.registry.get(&obj.type_code).ok_or_else(|| {
            CoreError::Fatal(format!("unknown type code '{}'", obj.type_code))
        })?;
        obj.command_ts = Utc::now();
        let frame = self.frame_for(&spec, &obj)?;
        let urgent = frame.prefix.is_urgent();
        self.inner.hub.route(&frame, None, urgent).await;
        Ok(())
    }

    /// Remove an object and propagate the removal.
    pub async fn remove(&self, type_code: &str, keys: &[&str]) -> Result<(), CoreError> {
        let Some(obj) = self.inner.tree.remove(&self.inner.registry, type_code, keys) else {
            return Ok(());
        };
        self.commit_object(obj).await
    }

    /// Rename an object and propagate the rename; downstream nodes re-key
    /// atomically and fire `on_rename`.
    pub async fn rename(
        &self,
        type_code: &str,
        keys: &[&str],
        new_id: &str,
    ) -> Result<(), CoreError> {
        let (_node, shadow) =
            self.inner.tree.rename(&self.inner.registry, type_code, keys, new_id)?;
        self.commit_object(shadow).await
    }

    fn frame_for(&self, spec: &TypeSpec, obj: &DataObject) -> Result<FullFrame, CoreError> {
        let prefix = if obj.is_obsolete() {
            Prefix::Remove
        } else if spec.urgent {
            Prefix::Urgent
        } else {
            Prefix::Normal
        };
        Ok(FullFrame {
            prefix,
            type_code: obj.type_code.clone(),
            ts: obj.command_ts,
            origin: self.inner.uuid,
            destinations: obj.destinations.clone(),
            obj_seq: self.next_obj_seq(&obj.type_code),
            ack_seq: None,
            keys: obj.key_path(),
            fields: obj.serialize(spec),
        })
    }

    fn next_obj_seq(&self, type_code: &str) -> u64 {
        let mut counters = self.inner.commit_counters.lock().expect("runtime poisoned");
        let counter = counters.entry(type_code.to_owned()).or_insert(0);
        *counter += 1;
        *counter
    }

    // -----------------------------------------------------------------------
    // Query API (requester side)
    // -----------------------------------------------------------------------

    /// Issue a query; replies arrive through the type behavior's
    /// `on_reply`, expiry through `on_expire`.
    pub async fn query(
        &self,
        type_code: &str,
        values: Vec<FieldValue>,
        timeout: Duration,
    ) -> Result<u32, CoreError> {
        let spec = self.inner.registry.get(type_code).ok_or_else(|| {
            CoreError::Fatal(format!("unknown type code '{type_code}'"))
        })?;
        let query_id = self.inner.queries.allocate();
        let expires = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();
        self.inner.queries.register(query_id, expires);
        let query = QueryObject {
            type_code: type_code.to_owned(),
            requester: self.inner.uuid,
            query_id,
            state: QueryState::Query,
            values,
            ts: Utc::now(),
            urgent: spec.urgent,
        };
        self.send_query(&spec, &query, Destinations::All).await;

        let rt = self.clone();
        let expired = query.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if rt.inner.queries.expire(query_id) {
                debug!(query_id, "query expired");
                rt.dispatch_event(&expired.type_code.clone(), Event::Expired { query: expired })
                    .await;
            }
        });
        Ok(query_id)
    }

    /// Abort one of our queries; peers stop working on it.
    pub async fn abort_query(&self, type_code: &str, query_id: u32) -> Result<(), CoreError> {
        let spec = self.inner.registry.get(type_code).ok_or_else(|| {
            CoreError::Fatal(format!("unknown type code '{type_code}'"))
        })?;
        if !self.inner.queries.abort(query_id) {
            return Ok(());
        }
        let query = QueryObject {
            type_code: type_code.to_owned(),
            requester: self.inner.uuid,
            query_id,
            state: QueryState::Aborted,
            values: Vec::new(),
            ts: Utc::now(),
            urgent: false,
        };
        self.send_query(&spec, &query, Destinations::All).await;
        Ok(())
    }

    /// Producer side: transmit one reply for a pending query.
    pub async fn reply(
        &self,
        query: &QueryObject,
        state: QueryState,
        values: Vec<FieldValue>,
    ) -> Result<(), CoreError> {
        let spec = self.inner.registry.get(&query.type_code).ok_or_else(|| {
            CoreError::Fatal(format!("unknown type code '{}'", query.type_code))
        })?;
        let mut reply = query.clone();
        reply.state = state;
        reply.values = values;
        reply.ts = Utc::now();
        self.send_query(&spec, &reply, Destinations::Set(vec![query.requester]))
            .await;
        Ok(())
    }

    async fn send_query(&self, spec: &TypeSpec, query: &QueryObject, destinations: Destinations) {
        let frame = FullFrame {
            prefix: if query.urgent { Prefix::UrgentQuery } else { Prefix::Query },
            type_code: query.type_code.clone(),
            ts: query.ts,
            origin: self.inner.uuid,
            destinations,
            obj_seq: self.next_obj_seq(&query.type_code),
            ack_seq: None,
            keys: vec![query.key()],
            fields: query.encode_fields(spec),
        };
        self.inner.hub.route(&frame, None, query.urgent).await;
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Feed one foreign payload through the produced types' importers and
    /// optionally relay the raw line across the mesh.
    pub async fn import_foreign(&self, payload: &str, channel: &str) {
        let ts = Utc::now();
        let claims = import::offer(&self.inner.registry, &self.inner.produced, payload, channel, ts);
        for claim in claims {
            match self.inner.tree.create(&self.inner.registry, &claim.type_code, &claim.keys, {
                let code = claim.type_code.clone();
                let uuid = self.inner.uuid;
                move || DataObject::new(code, String::new(), uuid)
            }) {
                Ok((node, _)) => {
                    node.with_object_mut(|obj| obj.values = claim.values);
                    let keys: Vec<&str> = claim.keys.iter().map(String::as_str).collect();
                    if let Err(e) = self.commit(&claim.type_code, &keys).await {
                        warn!(error = %e, "import commit failed");
                    }
                }
                Err(e) => warn!(error = %e, "import create failed"),
            }
        }
        if self.produces(import::RAW_IMPORT_CODE) {
            let mut raw = DataObject::new(import::RAW_IMPORT_CODE, channel, self.inner.uuid);
            raw.values = vec![
                FieldValue::Str(payload.to_owned()),
                FieldValue::Str(channel.to_owned()),
                FieldValue::Time(ts),
            ];
            if let Err(e) = self.commit_object(raw).await {
                warn!(error = %e, "raw import relay failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound path (called by the peer handler)
    // -----------------------------------------------------------------------

    pub(crate) async fn on_frame(&self, peer: &Arc<Peer>, frame: FullFrame, raw_line: &str) {
        if self.inner.hub.is_me(frame.origin) {
            return; // our own frame came back around the mesh
        }
        peer.add_connected_node(frame.origin);

        if !self.inner.hub.register_seen(frame.origin, &frame.type_code, frame.obj_seq) {
            // Duplicate. A lossless resend means our previous ack was lost
            // or the event never completed; run the delivery again (the
            // ack fires on success). Anything else is a routing echo:
            // re-ack if asked, deliver nothing, never forward.
            if frame.ack_seq.is_some() && !frame.prefix.is_query() && self.consumes(&frame.type_code)
            {
                match self.deliver_object(peer, &frame, raw_line).await {
                    Ok(true) => {}
                    Ok(false) => self.hop_ack(peer, &frame),
                    Err(e) => {
                        warn!(peer = %peer.name, error = %e, "lossless redelivery failed");
                    }
                }
            } else {
                self.hop_ack(peer, &frame);
            }
            return;
        }

        let for_me = self.inner.hub.for_me(&frame.destinations);
        let mut ack_tied_to_event = false;

        if for_me != ForMe::Not {
            if frame.prefix.is_query() {
                self.on_query_frame(&frame).await;
            } else if self.consumes(&frame.type_code) {
                match self.deliver_object(peer, &frame, raw_line).await {
                    Ok(tied) => ack_tied_to_event = tied,
                    Err(e) => {
                        // Parse failure: drop, never forward, never ack.
                        peer.stats.input.record(0, None);
                        warn!(peer = %peer.name, error = %e, "inbound frame dropped");
                        return;
                    }
                }
            }
        }

        if for_me != ForMe::Exclusive {
            self.inner
                .hub
                .route(&frame, Some(peer), frame.prefix.is_urgent())
                .await;
        }

        if !ack_tied_to_event {
            self.hop_ack(peer, &frame);
        }
    }

    fn hop_ack(&self, peer: &Arc<Peer>, frame: &FullFrame) {
        if let (Some(ack_seq), Some(remote)) = (frame.ack_seq, peer.remote_uuid()) {
            AckTicket {
                channel: peer.channel.clone(),
                type_code: frame.type_code.clone(),
                origin: frame.origin,
                destination: remote,
                ack_seq,
            }
            .fire();
        }
    }

    fn ack_ticket(&self, peer: &Arc<Peer>, frame: &FullFrame) -> Option<AckTicket> {
        match (frame.ack_seq, peer.remote_uuid()) {
            (Some(ack_seq), Some(remote)) => Some(AckTicket {
                channel: peer.channel.clone(),
                type_code: frame.type_code.clone(),
                origin: frame.origin,
                destination: remote,
                ack_seq,
            }),
            _ => None,
        }
    }

    /// Apply a data frame to the tree and deliver events. Returns whether
    /// the acknowledgment was tied to event completion.
    async fn deliver_object(
        &self,
        peer: &Arc<Peer>,
        frame: &FullFrame,
        raw_line: &str,
    ) -> Result<bool, CoreError> {
        let spec = match self.inner.registry.get(&frame.type_code) {
            Some(spec) => spec,
            None => return Ok(false), // consumed but unregistered: config error, skip
        };
        let update = self.inner.tree.apply_frame(
            &self.inner.registry,
            &spec,
            frame,
            Some(raw_line.to_owned()),
        )?;
        let ack = self.ack_ticket(peer, frame);
        let delay = (Utc::now() - frame.ts).num_milliseconds() - peer.clock_diff_ms();
        peer.stats.input.record(raw_line.len() as u64, Some(delay));

        match update {
            TreeUpdate::Created(node) => {
                let Some(obj) = node.snapshot() else { return Ok(false) };
                self.deliver_live(&spec, obj, ack, true).await;
                Ok(true)
            }
            TreeUpdate::Updated(node) => {
                let Some(obj) = node.snapshot() else { return Ok(false) };
                self.deliver_live(&spec, obj, ack, false).await;
                Ok(true)
            }
            TreeUpdate::Disposable(obj) => {
                self.deliver_live(&spec, obj, ack, true).await;
                Ok(true)
            }
            TreeUpdate::Removed(obj) => {
                self.dispatch_event(
                    &spec.code,
                    Event::Obsolete { obj, old_id: None, ack },
                )
                .await;
                Ok(true)
            }
            TreeUpdate::Renamed { node, shadow } => {
                if let Some(obj) = node.snapshot() {
                    self.dispatch_event(
                        &spec.code,
                        Event::Obsolete { obj, old_id: Some(shadow.id), ack },
                    )
                    .await;
                }
                Ok(true)
            }
            TreeUpdate::Ignored => Ok(false),
        }
    }

    /// Synchronous attempt on the reader task; fall back to the worker
    /// pool when the behavior asks for async handling.
    async fn deliver_live(
        &self,
        spec: &Arc<TypeSpec>,
        obj: DataObject,
        ack: Option<AckTicket>,
        fresh: bool,
    ) {
        if fresh {
            spec.behavior.on_new(&obj);
        }
        if spec.behavior.on_event(&obj) {
            if let Some(ack) = ack {
                ack.fire();
            }
            return;
        }
        let code = spec.code.clone();
        self.dispatch_event(&code, Event::Object { obj, ack }).await;
    }

    async fn on_query_frame(&self, frame: &FullFrame) {
        let Some(spec) = self.inner.registry.get(&frame.type_code) else {
            return;
        };
        let query = match QueryObject::from_frame(&spec, frame) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "malformed query frame dropped");
                return;
            }
        };
        match query.state {
            QueryState::Query => {
                if self.produces(&query.type_code) {
                    self.dispatch_event(&spec.code, Event::Enquire { query }).await;
                }
            }
            QueryState::Aborted => {
                // The requester gave up; any replies we still produce will
                // be ignored on their side. Nothing to unwind here.
                debug!(key = %query.key(), "query aborted by requester");
            }
            _ => {
                if query.requester == self.inner.uuid {
                    let disposition = self.inner.queries.on_reply(
                        query.query_id,
                        query.state,
                        Utc::now(),
                    );
                    match disposition {
                        ReplyDisposition::Deliver => {
                            self.dispatch_event(&spec.code, Event::Reply { query, terminal: false })
                                .await;
                        }
                        ReplyDisposition::DeliverFinal => {
                            self.dispatch_event(&spec.code, Event::Reply { query, terminal: true })
                                .await;
                        }
                        ReplyDisposition::Ignore => {}
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reset protocol
    // -----------------------------------------------------------------------

    /// Send a reset request for `types` along one channel.
    pub(crate) async fn send_reset_request(&self, peer: &Arc<Peer>, types: &[String]) {
        let now = Utc::now();
        let request = ResetRequest {
            types: types.to_vec(),
            ts: timefmt::format_ts(now),
            reset_seq: self.inner.reset_seq.fetch_add(1, Ordering::Relaxed) + 1,
            requester: self.inner.uuid,
            target: None,
            deploy_time: timefmt::format_ts(self.inner.deploy_time),
            origin: self.inner.uuid,
            params: String::new(),
            app_name: self.inner.app_name.clone(),
            app_version: self.inner.app_version.clone(),
            core_version: CORE_VERSION.to_owned(),
            remote_addr: peer.name.clone(),
        };
        info!(peer = %peer.name, ?types, "requesting reset");
        peer.channel
            .transmit(Control::Reset(request).encode(), true)
            .await;
    }

    /// Handle a reset request arriving on `peer` (ours or to rebroadcast).
    pub(crate) async fn handle_reset_request(&self, peer: &Arc<Peer>, request: ResetRequest) {
        if self.inner.hub.is_me(request.origin) || self.inner.hub.is_me(request.requester) {
            return; // loopback
        }
        let (Ok(deploy), Ok(ts)) = (
            timefmt::parse_ts(&request.deploy_time),
            timefmt::parse_ts(&request.ts),
        ) else {
            warn!(peer = %peer.name, "reset request with bad timestamps dropped");
            return;
        };
        if !self.inner.node_table.accept_reset(request.origin, deploy, ts, request.reset_seq) {
            return; // replay or stale
        }

        peer.add_connected_node(request.origin);
        peer.add_connected_node(request.requester);
        for code in &request.types {
            peer.register_want(code, request.requester);
        }

        let targeted = request.target.is_none() || request.target == Some(self.inner.uuid);
        if targeted {
            let mut to_stream: Vec<String> = Vec::new();
            for code in &request.types {
                if code == WANT_ALL {
                    to_stream.extend(self.inner.produced.iter().cloned());
                } else {
                    let stripped = code.trim_end_matches(LOSSLESS_SUFFIX);
                    if self.produces(stripped) {
                        to_stream.push(stripped.to_owned());
                    }
                }
            }
            to_stream.sort();
            to_stream.dedup();
            for code in to_stream {
                self.start_reset_stream(peer, &code).await;
            }
        }

        // Propagate for nodes further out (not back where it came from).
        self.inner
            .hub
            .broadcast_control(&Control::Reset(request).encode(), Some(peer))
            .await;
    }

    /// Arm a keyframed replay of one produced type down one channel.
    async fn start_reset_stream(&self, peer: &Arc<Peer>, type_code: &str) {
        let (resetter, mut stream) = Resetter::new(type_code, self.inner.uuid);
        {
            let mut resetters = self.inner.resetters.lock().expect("runtime poisoned");
            if let Some(old) =
                resetters.insert((peer.name.clone(), type_code.to_owned()), resetter.clone())
            {
                old.abort();
            }
        }
        peer.reset_send_sequencer(type_code).await;
        info!(peer = %peer.name, type_code, "streaming reset replay");

        let rate = self.inner.config.get_u64("reset-rate", u64::from(DEFAULT_RESET_RATE)) as u32;
        let rt = self.clone();
        let drain_peer = peer.clone();
        let drain_resetter = resetter.clone();
        let code = type_code.to_owned();
        tokio::spawn(async move {
            let mut moderator = TransmitModerator::new(rate);
            let lossless = drain_peer.wants_type(&code).unwrap_or(false);
            while let Some(obj) = stream.next().await {
                moderator.pause().await;
                let Some(spec) = rt.inner.registry.get(&code) else { break };
                let mut frame = match rt.frame_for(&spec, &obj) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "reset frame build failed");
                        continue;
                    }
                };
                if lossless {
                    drain_peer.arm_ack(&mut frame);
                }
                if !drain_peer.send_frame(&frame, false).await {
                    debug!(type_code = %code, "reset replay item refused by channel");
                }
            }
            if !drain_resetter.is_aborted() {
                rt.dispatch_event(&code, Event::ResetCompleted { type_code: code.clone() })
                    .await;
            }
        });

        self.dispatch_event(type_code, Event::ResetDump { resetter }).await;
    }

    pub(crate) fn abort_peer_resetters(&self, peer: &Arc<Peer>) {
        let mut resetters = self.inner.resetters.lock().expect("runtime poisoned");
        resetters.retain(|(name, _), resetter| {
            if name == &peer.name {
                resetter.abort();
                false
            } else {
                true
            }
        });
    }

    // -----------------------------------------------------------------------
    // Event handling (dispatcher sink)
    // -----------------------------------------------------------------------

    pub(crate) async fn dispatch_event(&self, type_code: &str, event: Event) {
        let dispatcher = {
            let dispatchers = self.inner.dispatchers.read().expect("runtime poisoned");
            dispatchers.get(type_code).cloned()
        };
        match dispatcher {
            Some(d) => d.submit(event).await,
            // Not started yet (or unknown type): handle inline.
            None => self.handle_event(event).await,
        }
    }

    fn event_handler(&self) -> EventHandler {
        let rt = self.clone();
        Arc::new(move |event| {
            let rt = rt.clone();
            Box::pin(async move { rt.handle_event(event).await })
        })
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::Object { obj, ack } => {
                let Some(spec) = self.inner.registry.get(&obj.type_code) else { return };
                if spec.behavior.on_async_event(&obj) {
                    if let Some(ack) = ack {
                        ack.fire();
                    }
                } else {
                    error!(type_code = %obj.type_code, id = %obj.id, "async event handler failed");
                }
            }
            Event::Obsolete { obj, old_id, ack } => {
                let Some(spec) = self.inner.registry.get(&obj.type_code) else { return };
                match old_id {
                    Some(old) => spec.behavior.on_rename(&obj, &old),
                    None => {
                        if !spec.behavior.on_removal(&obj) {
                            // Veto: un-delete by re-indexing the object.
                            let keys = obj.key_path();
                            let mut revived = obj.clone();
                            revived.tombstone = false;
                            let _ = self.inner.tree.create(
                                &self.inner.registry,
                                &obj.type_code,
                                &keys,
                                move || revived,
                            );
                        }
                    }
                }
                if let Some(ack) = ack {
                    ack.fire();
                }
            }
            Event::ResetDump { resetter } => {
                let code = resetter.type_code().to_owned();
                let Some(spec) = self.inner.registry.get(&code) else { return };
                if !spec.behavior.on_reset_dump() {
                    for obj in self.inner.tree.collect_type(&self.inner.registry, &code) {
                        resetter.reset_object(obj).await;
                    }
                }
                resetter.end_of_data();
            }
            Event::ResetCompleted { type_code } => {
                if let Some(spec) = self.inner.registry.get(&type_code) {
                    spec.behavior.on_reset_completed();
                }
            }
            Event::Enquire { query } => {
                let Some(spec) = self.inner.registry.get(&query.type_code) else { return };
                let replies = spec.behavior.on_enquire(&query);
                for reply in replies {
                    if let Err(e) = self.reply(&query, reply.state, reply.values).await {
                        warn!(error = %e, "query reply failed");
                    }
                }
            }
            Event::Reply { query, .. } => {
                if let Some(spec) = self.inner.registry.get(&query.type_code) {
                    spec.behavior.on_reply(&query);
                }
            }
            Event::Expired { query } => {
                if let Some(spec) = self.inner.registry.get(&query.type_code) {
                    spec.behavior.on_expire(&query);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lossless resend sweep
    // -----------------------------------------------------------------------

    fn spawn_ack_sweep(&self) {
        let rt = self.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let period = rt
                .inner
                .config
                .get_duration_secs("ack-timeout-secs", DEFAULT_ACK_TIMEOUT);
            let resend_after = chrono::Duration::from_std(period).unwrap_or_else(|_| {
                chrono::Duration::seconds(DEFAULT_ACK_TIMEOUT.as_secs() as i64)
            });
            let retention = chrono::Duration::from_std(
                mw_protocol::consts::LOSSLESS_RETENTION,
            )
            .unwrap_or_else(|_| chrono::Duration::hours(24));
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => return,
                }
                for peer in rt.inner.hub.peers() {
                    let due = peer.collect_resends(resend_after, retention);
                    for frame in due {
                        debug!(peer = %peer.name, type_code = %frame.type_code,
                               ack_seq = ?frame.ack_seq, "resending unacknowledged frame");
                        peer.send_frame(&frame, false).await;
                    }
                }
            }
        });
    }
}
