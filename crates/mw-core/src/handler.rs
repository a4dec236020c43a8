//! Per-peer protocol handling.
//!
//! One task per channel consumes [`ChannelEvent`]s and drives the login
//! state machine, the control vocabulary, and the inbound data path
//! through this channel's receive sequencers. A companion monitor task
//! owns ping cadence, login retry and the obsolescence disconnect.
//!
//! Login direction is consumer→producer: the dialing side announces
//! itself with `^L`, the answering side replies `^LA` and only accepts
//! consumer logins.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mw_codec::timefmt;
use mw_protocol::consts::{LOGIN_OBSOLESCENCE, LOGIN_RETRY, DEFAULT_PING_RATE};
use mw_protocol::control::{Login, LoginAck, RemoveNodes, Role};
use mw_protocol::{Control, RawFrame};

use crate::channel::{ChannelEvent, clock_sync};
use crate::hub::{Peer, PeerState};
use crate::runtime::Runtime;
use crate::sequencer::{ReceiveOutcome, ReceiveSequencer};

// ---------------------------------------------------------------------------
// Peer task
// ---------------------------------------------------------------------------

pub(crate) async fn run_peer(rt: Runtime, peer: Arc<Peer>, mut events: mpsc::Receiver<ChannelEvent>) {
    let monitor = tokio::spawn(monitor_loop(rt.clone(), peer.clone()));
    let mut rx_seqs: HashMap<String, ReceiveSequencer> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Connected => {
                rx_seqs.clear();
                peer.clear_session().await;
                *peer.connected_since.lock().expect("peer poisoned") = Utc::now();
                if !peer.server_side {
                    send_login(&rt, &peer).await;
                    peer.set_state(PeerState::LoginSent);
                }
            }
            ChannelEvent::Line(line) => {
                peer.touch_input();
                on_line(&rt, &peer, &mut rx_seqs, &line).await;
            }
            ChannelEvent::Disconnected { reason, reconnecting } => {
                info!(peer = %peer.name, %reason, reconnecting, "peer channel dropped");
                peer.set_state(if reconnecting {
                    PeerState::Connecting
                } else {
                    PeerState::Disconnected
                });
                rt.abort_peer_resetters(&peer);
                announce_departures(&rt, &peer).await;
            }
            ChannelEvent::Closed => break,
        }
    }

    monitor.abort();
    peer.set_state(PeerState::Disconnected);
    rt.hub().drop_peer(&peer);
    debug!(peer = %peer.name, "peer task finished");
}

/// Tell the rest of the mesh which nodes just became unreachable.
async fn announce_departures(rt: &Runtime, peer: &Arc<Peer>) {
    let gone: Vec<uuid::Uuid> = peer.connected_nodes().into_iter().collect();
    if gone.is_empty() {
        return;
    }
    peer.remove_connected_nodes(&gone);
    peer.prune_wants(&gone);
    for uuid in &gone {
        rt.hub().clear_seen_for(*uuid);
    }
    let line = Control::RemoveNodes(RemoveNodes { uuids: gone }).encode();
    rt.hub().broadcast_control(&line, Some(peer)).await;
}

// ---------------------------------------------------------------------------
// Inbound lines
// ---------------------------------------------------------------------------

async fn on_line(
    rt: &Runtime,
    peer: &Arc<Peer>,
    rx_seqs: &mut HashMap<String, ReceiveSequencer>,
    line: &str,
) {
    if line.starts_with('^') {
        match Control::parse(line) {
            Ok(control) => handle_control(rt, peer, control).await,
            Err(e) => warn!(peer = %peer.name, error = %e, "bad control line dropped"),
        }
        return;
    }

    let raw = match RawFrame::parse(line) {
        Ok(raw) => raw,
        Err(e) => {
            peer.stats.input.record(line.len() as u64, None);
            warn!(peer = %peer.name, error = %e, "unparseable frame dropped");
            return;
        }
    };
    if !peer.logged_in() {
        debug!(peer = %peer.name, "data frame before login dropped");
        return;
    }

    let sequencer = rx_seqs.entry(raw.type_code.clone()).or_default();
    match sequencer.decode(&raw) {
        Ok(ReceiveOutcome::Frame(frame)) => rt.on_frame(peer, *frame, line).await,
        Ok(ReceiveOutcome::NeedReset) => {
            rt.send_reset_request(peer, &[raw.type_code.clone()]).await;
        }
        Ok(ReceiveOutcome::Discarded) => {}
        Err(e) => {
            warn!(peer = %peer.name, type_code = %raw.type_code, error = %e,
                  "frame decode failed, stream out of sequence");
        }
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

async fn handle_control(rt: &Runtime, peer: &Arc<Peer>, control: Control) {
    match control {
        Control::Login(login) => handle_login(rt, peer, login).await,
        Control::LoginAck(ack) => handle_login_ack(rt, peer, ack).await,
        Control::Reset(request) => rt.handle_reset_request(peer, request).await,
        Control::RemoveNodes(removal) => {
            let removed = peer.remove_connected_nodes(&removal.uuids);
            if removed.is_empty() {
                return;
            }
            peer.prune_wants(&removed);
            for uuid in &removed {
                rt.hub().clear_seen_for(*uuid);
            }
            let line = Control::RemoveNodes(RemoveNodes { uuids: removed }).encode();
            rt.hub().broadcast_control(&line, Some(peer)).await;
        }
        Control::Ack(ack) => {
            if !peer.ack_received(&ack.type_code, ack.ack_seq) {
                debug!(peer = %peer.name, type_code = %ack.type_code, ack_seq = ack.ack_seq,
                       "ack for unknown frame");
            }
        }
        Control::Ping { send_ts } => {
            let pong = Control::Pong {
                pong_ts: timefmt::format_ts(Utc::now()),
                echoed_send_ts: send_ts,
            };
            peer.channel.transmit(pong.encode(), true).await;
        }
        Control::Pong { pong_ts, echoed_send_ts } => {
            if let (Ok(sent), Ok(remote)) =
                (timefmt::parse_ts(&echoed_send_ts), timefmt::parse_ts(&pong_ts))
            {
                let sync = clock_sync(sent, remote, Utc::now());
                peer.set_clock_diff_ms(sync.clock_diff_ms);
                debug!(peer = %peer.name, rtt_ms = sync.round_trip_ms,
                       diff_ms = sync.clock_diff_ms, "clock sync");
            }
        }
        Control::CompressReq => {
            // Ack first (urgent → ahead of queued traffic), then switch.
            peer.channel
                .transmit(Control::CompressAck.encode(), true)
                .await;
            peer.channel.compress_output();
        }
        Control::CompressAck => {
            peer.channel.compress_output();
        }
    }
}

async fn handle_login(rt: &Runtime, peer: &Arc<Peer>, login: Login) {
    if !peer.server_side || login.role != Role::Consumer {
        warn!(peer = %peer.name, app = %login.info.app_name, "login refused");
        let nack = Control::LoginAck(LoginAck {
            ok: false,
            compress_mask: 0,
            alert_flag: 0,
            info: rt.app_info(),
        });
        peer.channel.transmit(nack.encode(), true).await;
        peer.channel.close();
        return;
    }

    info!(peer = %peer.name, app = %login.info.app_name,
          version = %login.info.app_version, uuid = %login.info.app_uuid, "consumer logged in");
    peer.add_connected_node(login.info.app_uuid);
    peer.set_info(login.info);
    peer.set_state(PeerState::LoggedIn);
    log_peer_event(rt, peer, "login accepted");

    let ack = Control::LoginAck(LoginAck {
        ok: true,
        compress_mask: if rt.config().get_bool("compress") { 1 } else { 0 },
        alert_flag: login.alert_flag,
        info: rt.app_info(),
    });
    peer.channel.transmit(ack.encode(), true).await;
}

async fn handle_login_ack(rt: &Runtime, peer: &Arc<Peer>, ack: LoginAck) {
    if !ack.ok {
        warn!(peer = %peer.name, "login refused by remote");
        peer.channel.close();
        return;
    }
    info!(peer = %peer.name, app = %ack.info.app_name, uuid = %ack.info.app_uuid,
          "logged in to producer");
    peer.add_connected_node(ack.info.app_uuid);
    peer.set_info(ack.info);
    peer.set_state(PeerState::LoggedIn);
    log_peer_event(rt, peer, "login acknowledged");

    // Subscribe: producers answer with a keyframed replay per type.
    let codes = rt.subscription_codes();
    if !codes.is_empty() {
        rt.send_reset_request(peer, &codes).await;
    }
    if rt.config().get_bool("compress") {
        peer.channel.transmit(Control::CompressReq.encode(), true).await;
    }
}

async fn send_login(rt: &Runtime, peer: &Arc<Peer>) {
    let login = Control::Login(Login {
        role: Role::Consumer,
        info: rt.app_info(),
        compress_mask: if rt.config().get_bool("compress") { 1 } else { 0 },
        alert_flag: 0,
    });
    peer.channel.transmit(login.encode(), true).await;
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

async fn monitor_loop(rt: Runtime, peer: Arc<Peer>) {
    let ping_rate = rt
        .config()
        .get_duration_secs("ping-rate", DEFAULT_PING_RATE);
    let obsolescence = rt
        .config()
        .get_duration_secs("idle-disconnect-secs", LOGIN_OBSOLESCENCE);
    let mut ticker = tokio::time::interval(ping_rate.min(LOGIN_RETRY));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ping = tokio::time::Instant::now();

    loop {
        ticker.tick().await;
        match peer.state() {
            PeerState::LoginSent => {
                let waited = Utc::now() - *peer.connected_since.lock().expect("peer poisoned");
                if waited
                    > chrono::Duration::from_std(LOGIN_OBSOLESCENCE).unwrap_or_default()
                {
                    warn!(peer = %peer.name, "login never answered, disconnecting");
                    peer.channel.close();
                } else if waited > chrono::Duration::from_std(LOGIN_RETRY).unwrap_or_default() {
                    debug!(peer = %peer.name, "re-issuing login");
                    send_login(&rt, &peer).await;
                }
            }
            PeerState::LoggedIn | PeerState::Monitoring => {
                peer.set_state(PeerState::Monitoring);
                if last_ping.elapsed() >= ping_rate {
                    last_ping = tokio::time::Instant::now();
                    let ping = Control::Ping { send_ts: timefmt::format_ts(Utc::now()) };
                    peer.channel.transmit(ping.encode(), false).await;
                }
                let idle = Utc::now() - peer.last_input();
                if idle > chrono::Duration::from_std(obsolescence).unwrap_or_default() {
                    warn!(peer = %peer.name, "peer obsolete (no input), disconnecting");
                    peer.channel.close();
                }
            }
            PeerState::Connecting | PeerState::Disconnected => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Per-peer channel log
// ---------------------------------------------------------------------------

/// Append a line to this peer's channel log under
/// `{log-root}/{Producers|Consumers}/{app.channel[.user]}/channel.log`.
/// Best-effort: logging never interferes with traffic.
fn log_peer_event(rt: &Runtime, peer: &Arc<Peer>, text: &str) {
    let Some(root) = rt.config().get("log-root") else { return };
    let Some(info) = peer.info() else { return };
    let side = if peer.server_side { "Consumers" } else { "Producers" };
    let mut leaf = format!("{}.{}", info.app_name, peer.name);
    if let Some(user) = &info.user_id {
        leaf.push('.');
        leaf.push_str(user);
    }
    let dir = PathBuf::from(root).join(side).join(leaf);
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join("channel.log");
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{} {}", timefmt::format_ts(Utc::now()), text);
    }
}
