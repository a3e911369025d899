//! Session controller: the top-level state machine tying transport, framing,
//! replay, channels, and listeners together (spec.md §4.3, §5, §6).
//!
//! Grounded on `channel/action_cable.rs`'s `run_connection_loop` for the
//! overall connect/run/backoff-and-reconnect loop shape (including its
//! `oneshot` shutdown signal and jittered exponential backoff), and on
//! `relay/stream_mux.rs`'s per-stream reader/writer task split for how each
//! channel's local TCP socket is pumped. The backoff *numbers* come from
//! spec.md (500ms initial, 30s cap, 5 minute total reconnect window), not
//! from `action_cable.rs`'s own constants (1s/30s) — the teacher is grounding
//! the loop shape here, not its literal tuning.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::channel::{ChannelTable, CloseReason, DEFAULT_FLOW_BUDGET};
use crate::dispatch::{
    self, AckPayload, AuthReplyPayload, ChannelClosePayload, ChannelDataPayload,
    ChannelOpenPayload, ChannelOpenReplyPayload, DisconnectPayload, EchoPayload, InitPayload,
    InitReplyPayload, ListenClosePayload, ListenPayload, ReconnectInit,
};
use crate::error::{DisconnectCause, TunnelError};
use crate::framer::Framer;
use crate::listener::{AcceptedConnection, ListenerTable};
use crate::message::{FramedMessage, MessageType};
use crate::proxy_resolve;
use crate::replay::{ReplayBuffer, DEFAULT_BUDGET_BYTES};
use crate::transport::Transport;
use crate::url::ServerUrl;

const PROTOCOL_VERSION: u8 = 1;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;
const MAX_RECONNECT_WINDOW_MS: u64 = 5 * 60_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 15_000;
const PEER_ALIVE_MULTIPLE: u32 = 3;
const DRAIN_BUDGET_BYTES: usize = 64 * 1024;
const LOCAL_READ_CHUNK: usize = 16 * 1024;

/// Where the session currently sits in its lifecycle (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    Connecting = 0,
    HandshakingTls = 1,
    PostingHeaders = 2,
    WaitingForWelcome = 3,
    Ready = 4,
    Reconnecting = 5,
    Closed = 6,
}

impl From<u8> for SessionPhase {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::HandshakingTls,
            2 => Self::PostingHeaders,
            3 => Self::WaitingForWelcome,
            4 => Self::Ready,
            5 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

/// Events delivered to the embedder in place of spec.md's raw callbacks —
/// the idiomatic Rust realization of "on_listener_announced" /
/// "on_listener_closed" / "on_disconnect" is a channel the embedder polls,
/// not `dyn Fn` trait objects threaded through every internal call site.
#[derive(Debug)]
pub enum SessionEvent {
    ListenerAnnounced { port: u16, name: String },
    ListenerClosed { port: u16 },
    Disconnected(DisconnectCause),
}

/// Parameters for a session (spec.md §4.8 public contract).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub connection_id: String,
    pub ca_path: Option<String>,
    pub allow_bind_addresses: Vec<std::net::IpAddr>,
    pub auth_token: Option<Vec<u8>>,
    /// spec.md §6/§9: rewrite a peer-announced bind address of the literal
    /// `localhost` to `127.0.0.1`. Default `true`.
    pub rewrite_localhost: bool,
}

struct SharedState {
    phase: AtomicU8,
    local_addr: AsyncMutex<Option<SocketAddr>>,
}

/// Handle to a running (or not-yet-started) tunnel session.
pub struct Session {
    shared: Arc<SharedState>,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel_tx: AsyncMutex<Option<oneshot::Sender<()>>>,
    cancel_rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session and its event stream. Nothing connects until
    /// [`Session::start`] is called.
    #[must_use]
    pub fn create(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let session = Self {
            shared: Arc::new(SharedState {
                phase: AtomicU8::new(SessionPhase::Connecting as u8),
                local_addr: AsyncMutex::new(None),
            }),
            config,
            events_tx,
            cancel_tx: AsyncMutex::new(Some(cancel_tx)),
            cancel_rx: AsyncMutex::new(Some(cancel_rx)),
        };
        (session, events_rx)
    }

    /// Current lifecycle phase, safe to poll from any task.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from(self.shared.phase.load(Ordering::Relaxed))
    }

    /// The local address of the current outer transport socket, if connected.
    pub async fn get_local_address(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().await
    }

    /// Request cancellation (spec.md §6: `TunnelError::ClientCancel`,
    /// terminal regardless of reconnect eligibility). Idempotent — a second
    /// call after the first is a no-op.
    pub async fn cancel(&self) {
        if let Some(tx) = self.cancel_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

impl Session {
    /// Spawn the session's run loop. Consumes the cancel receiver created in
    /// `create`; calling `start` twice on the same session panics via the
    /// `expect` below, since that would indicate a logic bug in the embedder
    /// rather than a recoverable runtime condition.
    pub fn start(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        let cancel_rx = self
            .cancel_rx
            .try_lock()
            .expect("start() called concurrently with itself")
            .take()
            .expect("start() called more than once");
        tokio::spawn(run_session(shared, config, events_tx, cancel_rx))
    }
}

async fn run_session(
    shared: Arc<SharedState>,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut window_started_at: Option<std::time::Instant> = None;

    let mut framer = Framer::new();
    let mut replay = ReplayBuffer::new(DEFAULT_BUDGET_BYTES);
    let mut channels = ChannelTable::new();
    let mut listeners = ListenerTable::new();
    for addr in &config.allow_bind_addresses {
        listeners.allow_bind_address(*addr);
    }
    listeners.set_rewrite_localhost(config.rewrite_localhost);
    let mut reconnect_secret: Option<Vec<u8>> = None;
    let mut last_received_seq: u32 = 0;
    // Cumulative-ACK ceiling (spec.md §8 invariant 5): only ever advances to
    // a sequence once every message up to and including it has been fully
    // dispatched to its channel. Persisted across reconnects, independent of
    // `last_received_seq`, so a backlog that was never acked before a drop
    // doesn't get silently acked afterward.
    let mut ack_ceiling: u32 = 0;

    let cause = loop {
        if cancel_rx.try_recv().is_ok() {
            break DisconnectCause::Error(TunnelError::ClientCancel);
        }

        shared.phase.store(SessionPhase::Connecting as u8, Ordering::Relaxed);
        match connect_and_handshake(
            &shared,
            &config,
            &mut framer,
            &mut replay,
            reconnect_secret.clone(),
            last_received_seq,
        )
        .await
        {
            Ok((transport, welcome, handshake_last_seq)) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                window_started_at = None;
                reconnect_secret = Some(welcome.reconnect_secret.clone());
                last_received_seq = handshake_last_seq;
                ack_ceiling = ack_ceiling.max(handshake_last_seq);
                let heartbeat_interval_ms = if welcome.heartbeat_interval_ms > 0 {
                    welcome.heartbeat_interval_ms
                } else {
                    DEFAULT_HEARTBEAT_INTERVAL_MS
                };

                shared.phase.store(SessionPhase::Ready as u8, Ordering::Relaxed);
                log::info!("tunnel: session ready, heartbeat every {heartbeat_interval_ms}ms");

                let result = run_ready(
                    &config,
                    transport,
                    &mut framer,
                    &mut replay,
                    &mut channels,
                    &mut listeners,
                    &mut last_received_seq,
                    &mut ack_ceiling,
                    heartbeat_interval_ms,
                    &events_tx,
                    &mut cancel_rx,
                )
                .await;

                match result {
                    Ok(()) => break DisconnectCause::Graceful,
                    Err(TunnelError::ClientCancel) => {
                        break DisconnectCause::Error(TunnelError::ClientCancel)
                    }
                    Err(e) if !e.is_recoverable() => break DisconnectCause::Error(e),
                    Err(e) => {
                        log::warn!("tunnel: lost connection ({e}), attempting reconnect");
                        shared
                            .phase
                            .store(SessionPhase::Reconnecting as u8, Ordering::Relaxed);
                    }
                }
            }
            Err(e) if !e.is_recoverable() || reconnect_secret.is_none() => {
                break DisconnectCause::Error(e);
            }
            Err(e) => {
                log::warn!("tunnel: connect attempt failed ({e}), will retry");
            }
        }

        let window_start = *window_started_at.get_or_insert_with(std::time::Instant::now);
        if window_start.elapsed() >= Duration::from_millis(MAX_RECONNECT_WINDOW_MS) {
            break DisconnectCause::Error(TunnelError::TransportConnectFailed(
                "reconnect window exhausted".into(),
            ));
        }

        let jitter_ms = rand::random::<u64>() % 250;
        let wait_ms = backoff_ms + jitter_ms;
        log::info!("tunnel: reconnecting in {wait_ms}ms");
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            _ = &mut cancel_rx => {
                break DisconnectCause::Error(TunnelError::ClientCancel);
            }
        }
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    };

    listeners.close_all();
    shared.phase.store(SessionPhase::Closed as u8, Ordering::Relaxed);
    let _ = events_tx.send(SessionEvent::Disconnected(cause));
}

/// Resolve the server URL/proxy, connect the outer transport, and perform
/// the INIT/INIT_REPLY (and, if configured, AUTHENTICATE/AUTH_REPLY)
/// handshake (spec.md §4.1, §4.3).
async fn connect_and_handshake(
    shared: &Arc<SharedState>,
    config: &SessionConfig,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    reconnect_secret: Option<Vec<u8>>,
    our_last_received_seq: u32,
) -> Result<(Transport, InitReplyPayload, u32), TunnelError> {
    let mut peer_last_seq = our_last_received_seq;
    let server = ServerUrl::parse(&config.server_url, false)?;
    let proxy = proxy_resolve::resolve_for(&server);

    shared
        .phase
        .store(SessionPhase::HandshakingTls as u8, Ordering::Relaxed);
    let (mut transport, local_addr) =
        Transport::connect(&server, proxy.as_ref(), config.ca_path.as_deref()).await?;
    *shared.local_addr.lock().await = Some(local_addr);

    shared
        .phase
        .store(SessionPhase::PostingHeaders as u8, Ordering::Relaxed);
    transport
        .handshake_http(&server.path, &server.host, server.port)
        .await?;

    shared
        .phase
        .store(SessionPhase::WaitingForWelcome as u8, Ordering::Relaxed);

    let init = InitPayload {
        protocol_version: PROTOCOL_VERSION,
        connection_id: config.connection_id.clone(),
        reconnect: reconnect_secret.map(|secret| ReconnectInit {
            secret,
            peer_last_received_seq: our_last_received_seq,
        }),
    };
    let msg = dispatch::build(MessageType::Init, init.encode());
    framer.enqueue(msg, replay);
    flush_framer(&mut transport, framer).await?;

    let welcome = 'handshake: loop {
        let bytes = transport.read_available().await?;
        for msg in framer.feed(&bytes)? {
            if msg.msg_type == MessageType::InitReply {
                let welcome = InitReplyPayload::decode(&msg.payload)?;
                if welcome.protocol_version != PROTOCOL_VERSION {
                    return Err(TunnelError::ProtocolViolation(format!(
                        "unsupported protocol version {}",
                        welcome.protocol_version
                    )));
                }
                if !replay.can_replay_from(welcome.peer_last_received_seq) {
                    return Err(TunnelError::ReplayWindowLost);
                }
                for retransmit in replay.messages_after(welcome.peer_last_received_seq) {
                    framer.enqueue_raw(&retransmit);
                }
                peer_last_seq = msg.sequence;
                break 'handshake welcome;
            }
            return Err(TunnelError::ProtocolViolation(format!(
                "expected INIT_REPLY, got {:?}",
                msg.msg_type
            )));
        }
    };

    if let Some(token) = &config.auth_token {
        let auth = dispatch::AuthenticatePayload { token: token.clone() };
        let msg = dispatch::build(MessageType::Authenticate, auth.encode());
        framer.enqueue(msg, replay);
        flush_framer(&mut transport, framer).await?;

        loop {
            let bytes = transport.read_available().await?;
            let mut done = false;
            let mut result = Ok(());
            for msg in framer.feed(&bytes)? {
                if msg.msg_type == MessageType::AuthReply {
                    let reply = AuthReplyPayload::decode(&msg.payload)?;
                    if !reply.ok {
                        result = Err(TunnelError::HttpRejected {
                            status: 401,
                            detail: reply.cause,
                        });
                    }
                    peer_last_seq = msg.sequence;
                    done = true;
                    break;
                }
            }
            if done {
                result?;
                break;
            }
        }
    }

    Ok((transport, welcome, peer_last_seq))
}

async fn flush_framer(transport: &mut Transport, framer: &mut Framer) -> Result<(), TunnelError> {
    while framer.has_pending_output() {
        let chunk = framer.drain_to(DRAIN_BUDGET_BYTES);
        transport.write_chunk(&chunk).await?;
    }
    Ok(())
}

/// Event fed back from a channel's local-socket pump task to the main loop.
enum PumpEvent {
    LocalData { id: u32, bytes: Vec<u8> },
    LocalEof { id: u32 },
    LocalError { id: u32 },
    /// A peer-initiated `CHANNEL_OPEN`'s outbound dial to the target succeeded.
    RemoteConnected { id: u32, socket: tokio::net::TcpStream },
    /// A peer-initiated `CHANNEL_OPEN`'s outbound dial failed.
    RemoteConnectFailed { id: u32, detail: String },
}

/// Control sent from the main loop down to a channel's pump task.
enum PumpControl {
    Opened,
    Rejected,
    SuspendReads,
    ResumeReads,
}

/// Drive the session while `Ready`: read/dispatch inbound frames, accept new
/// local connections for announced listeners, pump per-channel local
/// sockets, and maintain heartbeats. Returns once the transport drops, the
/// peer disconnects, or the embedder cancels.
#[allow(clippy::too_many_arguments)]
async fn run_ready(
    _config: &SessionConfig,
    mut transport: Transport,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    channels: &mut ChannelTable,
    listeners: &mut ListenerTable,
    last_received_seq: &mut u32,
    ack_ceiling: &mut u32,
    heartbeat_interval_ms: u32,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<(), TunnelError> {
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<AcceptedConnection>();
    let (pump_tx, mut pump_rx) = mpsc::unbounded_channel::<PumpEvent>();
    let mut pump_controls: std::collections::HashMap<u32, mpsc::UnboundedSender<PumpControl>> =
        std::collections::HashMap::new();

    let mut heartbeat_tick = tokio::time::interval(Duration::from_millis(u64::from(heartbeat_interval_ms)));
    let peer_alive_timeout =
        Duration::from_millis(u64::from(heartbeat_interval_ms) * u64::from(PEER_ALIVE_MULTIPLE));
    let mut peer_alive_deadline = tokio::time::Instant::now() + peer_alive_timeout;
    let mut outstanding_nonce: Option<u64> = None;
    let mut last_acked_seq: u32 = *ack_ceiling;

    loop {
        // Opportunistically retry any channel's inbound backlog before
        // deciding whether the ACK ceiling can advance: a local-socket
        // writer that was full earlier may have drained since.
        channels.retry_flush_inbound();
        if !channels.has_inbound_backlog() && *ack_ceiling < *last_received_seq {
            *ack_ceiling = *last_received_seq;
        }
        if *ack_ceiling > last_acked_seq {
            last_acked_seq = *ack_ceiling;
            let ack = dispatch::build(MessageType::Ack, AckPayload { acked_seq: last_acked_seq }.encode());
            framer.enqueue(ack, replay);
        }

        flush_framer(&mut transport, framer).await?;

        tokio::select! {
            biased;

            _ = &mut *cancel_rx => {
                send_disconnect(&mut transport, framer, replay, 0, "client cancel").await.ok();
                return Err(TunnelError::ClientCancel);
            }

            () = tokio::time::sleep_until(peer_alive_deadline) => {
                return Err(TunnelError::HeartbeatTimeout);
            }

            _ = heartbeat_tick.tick() => {
                let nonce = rand::random::<u64>();
                outstanding_nonce = Some(nonce);
                let msg = dispatch::build(MessageType::EchoReq, EchoPayload { nonce }.encode());
                framer.enqueue(msg, replay);
            }

            read_result = transport.read_available() => {
                let bytes = read_result?;
                let messages = framer.feed(&bytes)?;
                let had_messages = !messages.is_empty();
                if had_messages {
                    peer_alive_deadline = tokio::time::Instant::now() + peer_alive_timeout;
                }
                for msg in messages {
                    // spec.md §4.2: inbound sequence gaps are fatal.
                    let expected = last_received_seq.wrapping_add(1);
                    if msg.sequence != expected {
                        return Err(TunnelError::ProtocolViolation(format!(
                            "out-of-order sequence: expected {expected}, got {}",
                            msg.sequence
                        )));
                    }
                    *last_received_seq = msg.sequence;
                    let fully_dispatched = handle_inbound(
                        msg,
                        framer,
                        replay,
                        channels,
                        listeners,
                        &accepted_tx,
                        &pump_tx,
                        &mut pump_controls,
                        events_tx,
                        &mut outstanding_nonce,
                    )
                    .await?;
                    // spec.md §8 invariant 5: the ack ceiling only advances
                    // past this sequence once its payload is fully
                    // dispatched and no channel anywhere still has
                    // undelivered inbound bytes ahead of it.
                    if fully_dispatched && !channels.has_inbound_backlog() {
                        *ack_ceiling = *last_received_seq;
                    }
                }
            }

            Some(accepted) = accepted_rx.recv() => {
                open_outbound_channel(accepted, framer, replay, channels, &pump_tx, &mut pump_controls);
            }

            Some(event) = pump_rx.recv() => {
                handle_pump_event(event, framer, replay, channels, &mut pump_controls, &pump_tx);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    msg: FramedMessage,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    channels: &mut ChannelTable,
    listeners: &mut ListenerTable,
    accepted_tx: &mpsc::UnboundedSender<AcceptedConnection>,
    pump_tx: &mpsc::UnboundedSender<PumpEvent>,
    pump_controls: &mut std::collections::HashMap<u32, mpsc::UnboundedSender<PumpControl>>,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
    outstanding_nonce: &mut Option<u64>,
) -> Result<bool, TunnelError> {
    let fully_dispatched = match msg.msg_type {
        MessageType::Listen => {
            let listen = ListenPayload::decode(&msg.payload)?;
            let (port, name, bind_addr, target_host, target_port) =
                (listen.port, listen.name.clone(), listen.bind_addr, listen.target_host, listen.target_port);
            let result = listeners
                .announce(port, &bind_addr, name.clone(), target_host, target_port, accepted_tx.clone())
                .await;
            match result {
                Ok(()) => {
                    let _ = events_tx.send(SessionEvent::ListenerAnnounced { port, name });
                }
                Err(e) => {
                    log::warn!("tunnel: failed to announce listener on port {port}: {e}");
                }
            }
            true
        }
        MessageType::ListenClose => {
            let lc = ListenClosePayload::decode(&msg.payload)?;
            listeners.close(lc.port);
            let _ = events_tx.send(SessionEvent::ListenerClosed { port: lc.port });
            true
        }
        MessageType::ChannelOpen => {
            let open = ChannelOpenPayload::decode(&msg.payload)?;
            match channels.insert_with_id(open.channel_id, open.target_host.clone(), open.target_port) {
                Ok(()) => {
                    spawn_peer_initiated_connect(open, pump_tx.clone());
                }
                Err(e) => {
                    let reply = ChannelOpenReplyPayload {
                        channel_id: open.channel_id,
                        ok: false,
                        cause: e.to_string(),
                    };
                    let m = dispatch::build(MessageType::ChannelOpenReply, reply.encode());
                    framer.enqueue(m, replay);
                }
            }
            true
        }
        MessageType::ChannelOpenReply => {
            let reply = ChannelOpenReplyPayload::decode(&msg.payload)?;
            if reply.ok {
                channels.mark_open(reply.channel_id)?;
                if let Some(ctrl) = pump_controls.get(&reply.channel_id) {
                    let _ = ctrl.send(PumpControl::Opened);
                }
            } else {
                log::warn!(
                    "tunnel: channel {} open rejected: {}",
                    reply.channel_id,
                    reply.cause
                );
                if let Some(ctrl) = pump_controls.remove(&reply.channel_id) {
                    let _ = ctrl.send(PumpControl::Rejected);
                }
                channels.mark_remote_close(reply.channel_id, CloseReason::OpenRejected);
            }
            true
        }
        // spec.md §4.4: buffer against the per-channel budget rather than
        // dropping on a full local-write queue; the return value gates
        // whether the session may advance its ACK past this message.
        MessageType::ChannelData => {
            let data = ChannelDataPayload::decode(&msg.payload)?;
            channels.push_inbound(data.channel_id, data.data)
        }
        MessageType::ChannelClose => {
            let close = ChannelClosePayload::decode(&msg.payload)?;
            let reason = match close.reason {
                1 => CloseReason::RemoteReset,
                2 => CloseReason::OpenRejected,
                3 => CloseReason::SessionClosing,
                _ => CloseReason::LocalEof,
            };
            channels.mark_remote_close(close.channel_id, reason);
            pump_controls.remove(&close.channel_id);
            true
        }
        MessageType::Ack => {
            let ack = AckPayload::decode(&msg.payload)?;
            for acked in replay.newly_acked(ack.acked_seq) {
                if acked.msg_type == MessageType::ChannelData {
                    if let Ok(cd) = ChannelDataPayload::decode(&acked.payload) {
                        if channels.note_outbound_acked(cd.channel_id, cd.data.len()) {
                            if let Some(ctrl) = pump_controls.get(&cd.channel_id) {
                                let _ = ctrl.send(PumpControl::ResumeReads);
                            }
                        }
                    }
                }
            }
            replay.record_ack(ack.acked_seq);
            true
        }
        MessageType::EchoReq => {
            let echo = EchoPayload::decode(&msg.payload)?;
            let m = dispatch::build(MessageType::EchoReply, EchoPayload { nonce: echo.nonce }.encode());
            framer.enqueue(m, replay);
            true
        }
        MessageType::EchoReply => {
            let echo = EchoPayload::decode(&msg.payload)?;
            if *outstanding_nonce == Some(echo.nonce) {
                *outstanding_nonce = None;
            }
            true
        }
        MessageType::Disconnect => {
            let d = DisconnectPayload::decode(&msg.payload)?;
            return Err(TunnelError::ServerDisconnect(d.detail));
        }
        MessageType::Init | MessageType::InitReply | MessageType::Authenticate | MessageType::AuthReply => {
            return Err(TunnelError::ProtocolViolation(format!(
                "unexpected {:?} outside handshake",
                msg.msg_type
            )));
        }
    };
    Ok(fully_dispatched)
}

fn handle_pump_event(
    event: PumpEvent,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    channels: &mut ChannelTable,
    pump_controls: &mut std::collections::HashMap<u32, mpsc::UnboundedSender<PumpControl>>,
    pump_tx: &mpsc::UnboundedSender<PumpEvent>,
) {
    match event {
        PumpEvent::LocalData { id, bytes } => {
            if channels.get(id).is_some_and(|c| c.is_open()) {
                let should_suspend = channels.note_outbound_queued(id, bytes.len());
                let m = dispatch::build(
                    MessageType::ChannelData,
                    ChannelDataPayload { channel_id: id, data: bytes }.encode(),
                );
                framer.enqueue(m, replay);
                if should_suspend {
                    if let Some(ctrl) = pump_controls.get(&id) {
                        let _ = ctrl.send(PumpControl::SuspendReads);
                    }
                }
            }
        }
        PumpEvent::LocalEof { id } => {
            channels.mark_local_eof(id);
            if channels.get(id).is_some() {
                let m = dispatch::build(
                    MessageType::ChannelClose,
                    ChannelClosePayload { channel_id: id, reason: 0 }.encode(),
                );
                framer.enqueue(m, replay);
            }
        }
        PumpEvent::LocalError { id } => {
            channels.mark_local_eof(id);
            let m = dispatch::build(
                MessageType::ChannelClose,
                ChannelClosePayload { channel_id: id, reason: 1 }.encode(),
            );
            framer.enqueue(m, replay);
        }
        PumpEvent::RemoteConnected { id, socket } => {
            let (local_write_tx, local_write_rx) = mpsc::channel(64);
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            match channels.mark_open(id) {
                Ok(()) => {
                    if let Some(chan) = channels.get_mut(id) {
                        chan.local_write_tx = Some(local_write_tx);
                    }
                    pump_controls.insert(id, control_tx);
                    tokio::spawn(run_channel_pump(id, socket, local_write_rx, control_rx, pump_tx.clone(), false));
                    let reply = ChannelOpenReplyPayload { channel_id: id, ok: true, cause: String::new() };
                    let m = dispatch::build(MessageType::ChannelOpenReply, reply.encode());
                    framer.enqueue(m, replay);
                }
                Err(e) => {
                    log::warn!("tunnel: channel {id} vanished before its remote dial completed: {e}");
                }
            }
        }
        PumpEvent::RemoteConnectFailed { id, detail } => {
            channels.reject_connecting(id);
            let reply = ChannelOpenReplyPayload { channel_id: id, ok: false, cause: detail };
            let m = dispatch::build(MessageType::ChannelOpenReply, reply.encode());
            framer.enqueue(m, replay);
        }
    }
}

async fn send_disconnect(
    transport: &mut Transport,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    reason: u8,
    detail: &str,
) -> Result<(), TunnelError> {
    let m = dispatch::build(
        MessageType::Disconnect,
        DisconnectPayload { reason, detail: detail.into() }.encode(),
    );
    framer.enqueue(m, replay);
    flush_framer(transport, framer).await?;
    transport.write_final_chunk().await
}

/// Allocate a channel id for a locally accepted connection, spawn its pump
/// task (gated on the upcoming `CHANNEL_OPEN_REPLY`), and enqueue the
/// `CHANNEL_OPEN` request (spec.md §4.4/§4.5).
fn open_outbound_channel(
    accepted: AcceptedConnection,
    framer: &mut Framer,
    replay: &mut ReplayBuffer,
    channels: &mut ChannelTable,
    pump_tx: &mpsc::UnboundedSender<PumpEvent>,
    pump_controls: &mut std::collections::HashMap<u32, mpsc::UnboundedSender<PumpControl>>,
) {
    let id = match channels.allocate(accepted.target_host.clone(), accepted.target_port) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("tunnel: cannot open channel for port {}: {e}", accepted.port);
            return;
        }
    };

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    pump_controls.insert(id, control_tx);
    let (local_write_tx, local_write_rx) = mpsc::channel(64);
    if let Some(chan) = channels.get_mut(id) {
        chan.local_write_tx = Some(local_write_tx);
    }

    let msg = dispatch::build(
        MessageType::ChannelOpen,
        ChannelOpenPayload {
            channel_id: id,
            target_host: accepted.target_host,
            target_port: accepted.target_port,
        }
        .encode(),
    );
    framer.enqueue(msg, replay);

    tokio::spawn(run_channel_pump(
        id,
        accepted.socket,
        local_write_rx,
        control_rx,
        pump_tx.clone(),
        true,
    ));
}

/// Spawn the asynchronous local TCP connect for a peer-initiated
/// `CHANNEL_OPEN`; the result arrives as a regular `PumpEvent` so the main
/// loop's select stays the single place that mutates shared state.
fn spawn_peer_initiated_connect(open: ChannelOpenPayload, pump_tx: mpsc::UnboundedSender<PumpEvent>) {
    tokio::spawn(async move {
        let result = tokio::net::TcpStream::connect((open.target_host.as_str(), open.target_port)).await;
        let event = match result {
            Ok(socket) => PumpEvent::RemoteConnected { id: open.channel_id, socket },
            Err(e) => PumpEvent::RemoteConnectFailed { id: open.channel_id, detail: e.to_string() },
        };
        let _ = pump_tx.send(event);
    });
}

/// Bidirectional pump between one channel's local TCP socket and the tunnel.
///
/// Waits for `PumpControl::Opened` before reading from the socket (data must
/// not be forwarded until the peer has accepted the channel); `wait_for_open`
/// is `true` for client-initiated channels (always gated) and `false` for
/// peer-initiated ones, whose socket is already connected by the time this
/// is spawned (see `spawn_peer_initiated_connect` and its `RemoteConnected`
/// handling)
/// before replying rather than after.
async fn run_channel_pump(
    id: u32,
    socket: tokio::net::TcpStream,
    mut local_write_rx: mpsc::Receiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<PumpControl>,
    pump_tx: mpsc::UnboundedSender<PumpEvent>,
    wait_for_open: bool,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    if wait_for_open {
        loop {
            match control_rx.recv().await {
                Some(PumpControl::Opened) => break,
                Some(PumpControl::Rejected) | None => return,
                Some(_) => {}
            }
        }
    }

    let (mut read_half, mut write_half) = socket.into_split();
    let mut reads_suspended = false;

    let writer = tokio::spawn(async move {
        while let Some(data) = local_write_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let mut buf = vec![0u8; LOCAL_READ_CHUNK];
    loop {
        tokio::select! {
            biased;
            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(PumpControl::SuspendReads) => reads_suspended = true,
                    Some(PumpControl::ResumeReads) => reads_suspended = false,
                    Some(PumpControl::Rejected) | None => break,
                    Some(PumpControl::Opened) => {}
                }
            }
            result = read_half.read(&mut buf), if !reads_suspended => {
                match result {
                    Ok(0) => {
                        let _ = pump_tx.send(PumpEvent::LocalEof { id });
                        break;
                    }
                    Ok(n) => {
                        let _ = pump_tx.send(PumpEvent::LocalData { id, bytes: buf[..n].to_vec() });
                    }
                    Err(_) => {
                        let _ = pump_tx.send(PumpEvent::LocalError { id });
                        break;
                    }
                }
            }
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_follow_the_repr_order() {
        assert_eq!(SessionPhase::from(0), SessionPhase::Connecting);
        assert_eq!(SessionPhase::from(4), SessionPhase::Ready);
        assert_eq!(SessionPhase::from(255), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn cancel_before_start_is_observed_by_the_run_loop() {
        let (session, _events_rx) = Session::create(SessionConfig {
            server_url: "http://127.0.0.1:1".into(),
            connection_id: "test".into(),
            ca_path: None,
            allow_bind_addresses: vec![],
            auth_token: None,
            rewrite_localhost: true,
        });
        session.cancel().await;
        assert_eq!(session.phase(), SessionPhase::Connecting);
    }

    #[test]
    fn default_flow_budget_constant_is_reexported_consistently() {
        assert_eq!(DEFAULT_FLOW_BUDGET, 64 * 1024);
    }
}
