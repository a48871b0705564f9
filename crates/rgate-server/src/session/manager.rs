//! Session lifecycle management.
//!
//! Owns every session, its state machine, its correlation table and the
//! binding between a session and its current control channel. Each session
//! sits behind its own mutex, so transitions on one session are serialized
//! while different sessions progress in parallel. No lock is ever held
//! across an `.await`: socket and tunnel I/O happen outside the critical
//! sections and report back through channels.

use super::pending::PendingTable;
use super::state::SessionState;
use crate::channel::{ChannelEvent, ChannelHandle, CloseCause};
use crate::config::Timeouts;
use crate::dispatch::{RequestDispatcher, OP_SESSION_CLOSE};
use crate::heartbeat::{HeartbeatMonitor, Liveness, Unresponsive};
use crate::tunnel::{TunnelHandle, TunnelKey, TunnelPool};
use parking_lot::{Mutex, RwLock};
use rgate_core::messages::RequestPayload;
use rgate_core::{codec, Envelope, GatewayError, GatewayResult, Payload};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Envelopes buffered for a disconnected client before new ones are refused.
const MAX_OUTBOX: usize = 1024;

/// How often idle, grace and request deadlines are checked.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;

/// How long an admitted session may wait for its upgrade to finish.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event sent to the client right after its channel is bound.
pub const READY_EVENT: &str = "session.ready";

/// Event sent to the client just before the gateway closes its session.
pub const CLOSED_EVENT: &str = "session.closed";

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent a normal WebSocket close.
    ClientClosed,
    /// `session.close` request or an explicit API call.
    Requested,
    IdleTimeout,
    GraceExpired,
    /// The upgrade failed after the session was admitted.
    HandshakeFailed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Requested => "requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::GraceExpired => "grace_expired",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { session_id: String },
    /// The channel dropped and the session entered its reconnect grace.
    Disconnected { session_id: String },
    Reconnected { session_id: String },
    Closed { session_id: String, reason: CloseReason },
    /// An `event` envelope sent by the client.
    Client {
        session_id: String,
        name: String,
        data: Map<String, Value>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Connected { session_id }
            | SessionEvent::Disconnected { session_id }
            | SessionEvent::Reconnected { session_id }
            | SessionEvent::Closed { session_id, .. }
            | SessionEvent::Client { session_id, .. } => session_id,
        }
    }
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub connected: bool,
    pub pending: usize,
    pub buffered: usize,
    pub tunnel: Option<String>,
}

/// A handshake the manager agreed to. Must be followed by
/// [`SessionManager::bind`] or [`SessionManager::abandon`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New(String),
    Resume(String),
}

impl Admission {
    pub fn session_id(&self) -> &str {
        match self {
            Admission::New(id) | Admission::Resume(id) => id,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Admission::Resume(_))
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    NotFound(String),
    /// The session is gone or its reconnect grace ran out.
    Expired(String),
    /// Another channel is bound to, or resuming, this session.
    Duplicate(String),
    Full(usize),
}

impl fmt::Display for AdmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitError::NotFound(id) => write!(f, "session {id} not found"),
            AdmitError::Expired(id) => write!(f, "session {id} expired"),
            AdmitError::Duplicate(id) => write!(f, "session {id} is already connected"),
            AdmitError::Full(max) => write!(f, "max sessions ({max}) reached"),
        }
    }
}

struct RequestJob {
    id: String,
    request: RequestPayload,
}

struct Session {
    id: String,
    state: SessionState,
    created_at: Instant,
    last_activity: Instant,
    suspended_at: Option<Instant>,
    /// Set between a resume admission and its bind.
    resume_claimed: bool,
    channel: Option<ChannelHandle>,
    liveness: Arc<Liveness>,
    heartbeat: Option<CancellationToken>,
    tunnel: Option<TunnelHandle>,
    pending: PendingTable,
    outbox: VecDeque<Envelope>,
    /// Inbound request ids not yet answered, in receipt order.
    unanswered: Vec<String>,
    jobs: Option<mpsc::UnboundedSender<RequestJob>>,
    worker_cancel: CancellationToken,
}

impl Session {
    fn new(id: String, jobs: mpsc::UnboundedSender<RequestJob>, worker_cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SessionState::Connecting,
            created_at: now,
            last_activity: now,
            suspended_at: None,
            resume_claimed: false,
            channel: None,
            liveness: Arc::new(Liveness::new()),
            heartbeat: None,
            tunnel: None,
            pending: PendingTable::new(),
            outbox: VecDeque::new(),
            unanswered: Vec::new(),
            jobs: Some(jobs),
            worker_cancel,
        }
    }

    fn transition(&mut self, next: SessionState) -> GatewayResult<()> {
        let prev = self.state;
        self.state.advance(next)?;
        info!(session_id = %self.id, from = %prev, to = %next, "session state changed");
        Ok(())
    }

    fn is_bound_to(&self, channel_id: u64) -> bool {
        self.channel.as_ref().map(ChannelHandle::id) == Some(channel_id)
    }

    fn grace_expired(&self, grace: Duration) -> bool {
        self.suspended_at.is_some_and(|t| t.elapsed() >= grace)
    }

    /// Send now if connected, otherwise keep it for the next channel.
    fn deliver(&mut self, envelope: Envelope) -> GatewayResult<()> {
        match self.state {
            SessionState::Active => {
                if let Some(channel) = &self.channel {
                    match channel.send(&envelope) {
                        Ok(()) => return Ok(()),
                        // Lost under us; the reader will report it shortly.
                        Err(GatewayError::ChannelClosed) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.buffer(envelope)
            }
            SessionState::Connecting | SessionState::Suspended => self.buffer(envelope),
            SessionState::Draining | SessionState::Closed => Err(GatewayError::SessionTerminated),
        }
    }

    fn buffer(&mut self, envelope: Envelope) -> GatewayResult<()> {
        codec::encode(&envelope)?;
        if self.outbox.len() >= MAX_OUTBOX {
            warn!(session_id = %self.id, "reconnect buffer full, refusing envelope");
            return Err(GatewayError::ChannelClosed);
        }
        self.outbox.push_back(envelope);
        Ok(())
    }

    /// Drop a buffered request whose caller has already been answered.
    fn forget_request(&mut self, request_id: &str) {
        self.outbox.retain(|env| {
            !(matches!(env.payload, Payload::Request(_)) && env.id.as_deref() == Some(request_id))
        });
    }

    /// Claim the right to answer an inbound request. `false` once it has
    /// been answered by someone else.
    fn take_unanswered(&mut self, request_id: &str) -> bool {
        match self.unanswered.iter().position(|id| id == request_id) {
            Some(index) => {
                self.unanswered.remove(index);
                true
            }
            None => false,
        }
    }

    fn detach_channel(&mut self) {
        if let Some(cancel) = self.heartbeat.take() {
            cancel.cancel();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    fn suspend(&mut self) -> GatewayResult<()> {
        self.transition(SessionState::Suspended)?;
        self.detach_channel();
        self.suspended_at = Some(Instant::now());
        Ok(())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: self.last_activity.elapsed().as_millis() as u64,
            connected: self.channel.is_some(),
            pending: self.pending.len(),
            buffered: self.outbox.len(),
            tunnel: self.tunnel.as_ref().map(|t| t.key().to_string()),
        }
    }
}

enum ChannelLoss {
    Stale,
    Explicit,
    Suspended,
}

/// Manages all sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    pool: Arc<TunnelPool>,
    dispatcher: RequestDispatcher,
    timeouts: Timeouts,
    max_sessions: usize,
    events: broadcast::Sender<SessionEvent>,
    signals: mpsc::UnboundedSender<Unresponsive>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Unresponsive>>>,
    me: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        pool: Arc<TunnelPool>,
        dispatcher: RequestDispatcher,
        timeouts: Timeouts,
        max_sessions: usize,
    ) -> Arc<Self> {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            sessions: RwLock::new(HashMap::new()),
            pool,
            dispatcher,
            timeouts,
            max_sessions,
            events: broadcast::channel(EVENT_CAPACITY).0,
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            me: me.clone(),
        })
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(session_id).cloned()
    }

    fn require(&self, session_id: &str) -> GatewayResult<Arc<Mutex<Session>>> {
        self.get(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.get(session_id).map(|cell| cell.lock().state)
    }

    pub fn info(&self, session_id: &str) -> GatewayResult<SessionInfo> {
        Ok(self.require(session_id)?.lock().info())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let cells: Vec<_> = self.sessions.read().values().cloned().collect();
        cells.iter().map(|cell| cell.lock().info()).collect()
    }

    /// Decide whether a handshake may proceed.
    ///
    /// With `session_id` set, a `Suspended` session of that id is resumed; a
    /// live one is a duplicate. Without a matching session, `resume_only`
    /// refuses and otherwise a new session is registered in `Connecting`
    /// under that id (or a random one).
    pub fn admit(
        &self,
        session_id: Option<&str>,
        resume_only: bool,
    ) -> Result<Admission, AdmitError> {
        let mut sessions = self.sessions.write();

        if let Some(id) = session_id {
            if let Some(cell) = sessions.get(id) {
                let mut s = cell.lock();
                return match s.state {
                    SessionState::Suspended if s.resume_claimed => {
                        Err(AdmitError::Duplicate(id.to_string()))
                    }
                    SessionState::Suspended if s.grace_expired(self.timeouts.reconnect_grace) => {
                        info!(session_id = id, "resume refused, grace expired");
                        self.spawn_close(id.to_string(), CloseReason::GraceExpired);
                        Err(AdmitError::Expired(id.to_string()))
                    }
                    SessionState::Suspended => {
                        s.resume_claimed = true;
                        Ok(Admission::Resume(id.to_string()))
                    }
                    SessionState::Draining | SessionState::Closed => {
                        Err(AdmitError::Expired(id.to_string()))
                    }
                    SessionState::Connecting | SessionState::Active => {
                        Err(AdmitError::Duplicate(id.to_string()))
                    }
                };
            }
            if resume_only {
                return Err(AdmitError::NotFound(id.to_string()));
            }
        }

        if sessions.len() >= self.max_sessions {
            return Err(AdmitError::Full(self.max_sessions));
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(generate_session_id);
        let (jobs, worker_cancel) = self.spawn_worker(id.clone());
        sessions.insert(
            id.clone(),
            Arc::new(Mutex::new(Session::new(id.clone(), jobs, worker_cancel))),
        );
        info!(session_id = %id, "session created");
        Ok(Admission::New(id))
    }

    /// Undo an admission whose upgrade never completed.
    pub fn abandon(&self, admission: &Admission) {
        let id = admission.session_id();
        let Some(cell) = self.get(id) else { return };
        match admission {
            Admission::Resume(_) => {
                cell.lock().resume_claimed = false;
            }
            Admission::New(_) => {
                {
                    let mut s = cell.lock();
                    if s.state != SessionState::Connecting {
                        return;
                    }
                    if let Err(e) = s.transition(SessionState::Closed) {
                        warn!(session_id = id, error = %e, "cannot abandon session");
                        return;
                    }
                    s.worker_cancel.cancel();
                    s.jobs = None;
                }
                self.remove(id, &cell);
                self.emit(SessionEvent::Closed {
                    session_id: id.to_string(),
                    reason: CloseReason::HandshakeFailed,
                });
            }
        }
    }

    /// Bind a freshly upgraded channel to an admitted session and make it
    /// `Active`. Buffered envelopes follow the ready event in order.
    pub fn bind(
        &self,
        admission: &Admission,
        channel: ChannelHandle,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> GatewayResult<()> {
        let id = admission.session_id().to_string();
        let resumed = admission.is_resume();
        let Some(cell) = self.get(&id) else {
            channel.close();
            return Err(GatewayError::SessionNotFound(id));
        };

        {
            let mut s = cell.lock();
            if resumed {
                s.resume_claimed = false;
            }
            if let Err(e) = s.transition(SessionState::Active) {
                channel.close();
                return Err(e);
            }
            s.suspended_at = None;
            s.last_activity = Instant::now();

            let liveness = Arc::new(Liveness::new());
            let heartbeat = CancellationToken::new();
            HeartbeatMonitor::new(self.timeouts.ping_interval, self.timeouts.pong_timeout).spawn(
                id.clone(),
                liveness.clone(),
                channel.clone(),
                self.signals.clone(),
                heartbeat.clone(),
            );
            s.liveness = liveness;
            s.heartbeat = Some(heartbeat);
            s.channel = Some(channel.clone());

            let mut ready = Map::new();
            ready.insert("session_id".into(), Value::String(id.clone()));
            ready.insert("resumed".into(), Value::Bool(resumed));
            channel.send(&Envelope::event(READY_EVENT, ready))?;

            let flushed = s.outbox.len();
            while let Some(envelope) = s.outbox.front() {
                if channel.send(envelope).is_err() {
                    break;
                }
                s.outbox.pop_front();
            }
            if flushed > 0 {
                debug!(session_id = %id, flushed, "delivered buffered envelopes");
            }
        }

        self.spawn_pump(id.clone(), channel.id(), events);
        info!(session_id = %id, resumed, "control channel bound");
        self.emit(if resumed {
            SessionEvent::Reconnected { session_id: id }
        } else {
            SessionEvent::Connected { session_id: id }
        });
        Ok(())
    }

    /// Feed a channel's events into the manager until it closes.
    fn spawn_pump(&self, session_id: String, channel_id: u64, mut events: mpsc::Receiver<ChannelEvent>) {
        let manager = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    ChannelEvent::Envelope(envelope) => {
                        manager.handle_envelope(&session_id, channel_id, envelope)
                    }
                    ChannelEvent::Rejected { id, error } => {
                        manager.reject(&session_id, channel_id, id, &error)
                    }
                    ChannelEvent::Closed(cause) => {
                        manager.channel_lost(&session_id, channel_id, cause).await;
                        break;
                    }
                }
            }
        });
    }

    fn handle_envelope(&self, session_id: &str, channel_id: u64, envelope: Envelope) {
        let Some(cell) = self.get(session_id) else { return };
        let Envelope { id, payload, .. } = envelope;
        let mut s = cell.lock();
        if !s.is_bound_to(channel_id) {
            debug!(session_id, channel_id, "dropping envelope from stale channel");
            return;
        }

        match payload {
            Payload::Ping(ping) => {
                if let Some(channel) = &s.channel {
                    let _ = channel.send(&Envelope::pong(ping.seq));
                }
            }
            Payload::Pong(_) => s.liveness.record_pong(),
            Payload::Request(request) => {
                s.last_activity = Instant::now();
                let request_id = id.unwrap_or_default();
                debug!(session_id, request_id = %request_id, op = %request.op, "request received");
                let job = RequestJob {
                    id: request_id.clone(),
                    request,
                };
                let queued = s.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
                if queued {
                    s.unanswered.push(request_id);
                } else if let Some(channel) = &s.channel {
                    let _ = channel.send(&GatewayError::SessionTerminated.to_envelope(Some(request_id)));
                }
            }
            Payload::Response(value) => {
                s.last_activity = Instant::now();
                let request_id = id.unwrap_or_default();
                if !s.pending.resolve(&request_id, Ok(value)) {
                    warn!(session_id, request_id = %request_id, "response for unknown request");
                }
            }
            Payload::Error(error) => {
                s.last_activity = Instant::now();
                match id {
                    Some(request_id) => {
                        if !s.pending.resolve(&request_id, Err(error.into_error())) {
                            warn!(session_id, request_id = %request_id, "error for unknown request");
                        }
                    }
                    None => warn!(
                        session_id,
                        kind = %error.kind,
                        message = error.message.as_deref().unwrap_or(""),
                        "client reported error"
                    ),
                }
            }
            Payload::Event(event) => {
                s.last_activity = Instant::now();
                drop(s);
                self.emit(SessionEvent::Client {
                    session_id: session_id.to_string(),
                    name: event.event,
                    data: event.data,
                });
            }
        }
    }

    /// Answer a frame that failed to decode. The session is unaffected.
    fn reject(&self, session_id: &str, channel_id: u64, id: Option<String>, error: &GatewayError) {
        let Some(cell) = self.get(session_id) else { return };
        let s = cell.lock();
        if !s.is_bound_to(channel_id) {
            return;
        }
        warn!(session_id, request_id = ?id, error = %error, "envelope rejected");
        if let Some(channel) = &s.channel {
            let _ = channel.send(&error.to_envelope(id));
        }
    }

    async fn channel_lost(&self, session_id: &str, channel_id: u64, cause: CloseCause) {
        let loss = {
            let Some(cell) = self.get(session_id) else { return };
            let mut s = cell.lock();
            if !s.is_bound_to(channel_id) {
                ChannelLoss::Stale
            } else if cause == CloseCause::Normal {
                ChannelLoss::Explicit
            } else {
                match s.suspend() {
                    Ok(()) => ChannelLoss::Suspended,
                    Err(e) => {
                        warn!(session_id, error = %e, "cannot suspend session");
                        ChannelLoss::Stale
                    }
                }
            }
        };

        match loss {
            ChannelLoss::Stale => {}
            ChannelLoss::Explicit => {
                self.close(session_id, CloseReason::ClientClosed).await;
            }
            ChannelLoss::Suspended => {
                info!(session_id, ?cause, "control channel lost, awaiting reconnect");
                self.emit(SessionEvent::Disconnected {
                    session_id: session_id.to_string(),
                });
            }
        }
    }

    fn on_unresponsive(&self, signal: Unresponsive) {
        let Some(cell) = self.get(&signal.session_id) else { return };
        {
            let mut s = cell.lock();
            if !s.is_bound_to(signal.channel_id) || s.state != SessionState::Active {
                return;
            }
            if let Err(e) = s.suspend() {
                warn!(session_id = %signal.session_id, error = %e, "cannot suspend session");
                return;
            }
        }
        info!(session_id = %signal.session_id, "heartbeat lost, awaiting reconnect");
        self.emit(SessionEvent::Disconnected {
            session_id: signal.session_id,
        });
    }

    /// Send an envelope to the session's client, buffering it while the
    /// session is suspended.
    pub fn deliver(&self, session_id: &str, envelope: Envelope) -> GatewayResult<()> {
        self.require(session_id)?.lock().deliver(envelope)
    }

    /// Send a request to the client and wait for its reply. Resolves to
    /// exactly one of: the response, the client's error (as `Remote`),
    /// `RequestTimeout`, or `SessionTerminated`.
    pub async fn request(
        &self,
        session_id: &str,
        op: &str,
        args: Map<String, Value>,
    ) -> GatewayResult<Value> {
        let cell = self.require(session_id)?;
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut s = cell.lock();
            if !s.state.is_live() {
                return Err(GatewayError::SessionTerminated);
            }
            let request_id = s.pending.next_id();
            s.deliver(Envelope::request(request_id.clone(), op, args))?;
            s.pending.insert(request_id.clone(), op, tx);
            request_id
        };
        debug!(session_id, request_id = %request_id, op, "request sent to client");

        let mut rx = rx;
        match tokio::time::timeout(self.timeouts.request_timeout, &mut rx).await {
            Ok(result) => result.unwrap_or(Err(GatewayError::SessionTerminated)),
            Err(_) => {
                let cancelled = {
                    let mut s = cell.lock();
                    let cancelled = s.pending.cancel(&request_id);
                    if cancelled {
                        s.forget_request(&request_id);
                    }
                    cancelled
                };
                if cancelled {
                    warn!(session_id, request_id = %request_id, op, "request timed out");
                    Err(GatewayError::RequestTimeout)
                } else {
                    // Completed concurrently with the deadline.
                    rx.await.unwrap_or(Err(GatewayError::SessionTerminated))
                }
            }
        }
    }

    /// Resolve once `session_id` is `Active`.
    pub async fn wait_for_session(&self, session_id: &str, timeout: Duration) -> GatewayResult<()> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                if self.state(session_id) == Some(SessionState::Active) {
                    return Ok::<(), GatewayError>(());
                }
                match events.recv().await {
                    Ok(SessionEvent::Connected { session_id: id })
                    | Ok(SessionEvent::Reconnected { session_id: id })
                        if id == session_id =>
                    {
                        return Ok(())
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(GatewayError::SessionTerminated),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(GatewayError::RequestTimeout))
    }

    /// Borrow a tunnel for the session. A session holds at most one; asking
    /// for a different key returns the previous one to the pool first.
    pub async fn borrow_tunnel(&self, session_id: &str, key: TunnelKey) -> GatewayResult<TunnelHandle> {
        let cell = self.require(session_id)?;
        let previous = {
            let mut s = cell.lock();
            if !s.state.is_live() {
                return Err(GatewayError::SessionTerminated);
            }
            if let Some(handle) = s.tunnel.as_ref().filter(|h| *h.key() == key) {
                return Ok(handle.clone());
            }
            s.tunnel.take()
        };
        if let Some(old) = previous {
            self.pool.release(&old).await;
        }

        let handle = self.pool.acquire(key).await?;
        let (displaced, terminated) = {
            let mut s = cell.lock();
            if s.state.is_live() {
                (s.tunnel.replace(handle.clone()), false)
            } else {
                (None, true)
            }
        };
        if let Some(old) = displaced {
            self.pool.release(&old).await;
        }
        if terminated {
            self.pool.release(&handle).await;
            return Err(GatewayError::SessionTerminated);
        }
        Ok(handle)
    }

    /// Return the session's tunnel to the pool, if it holds one.
    pub async fn release_tunnel(&self, session_id: &str) -> bool {
        let handle = match self.get(session_id) {
            Some(cell) => cell.lock().tunnel.take(),
            None => None,
        };
        match handle {
            Some(handle) => {
                self.pool.release(&handle).await;
                true
            }
            None => false,
        }
    }

    /// Drain and close a session: pending requests fail with
    /// `SessionTerminated`, the tunnel goes back to the pool, the channel
    /// is closed. Returns `false` if it was already closing.
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        let Some(cell) = self.get(session_id) else { return false };
        let tunnel = {
            let mut s = cell.lock();
            if !s.state.is_live() {
                return false;
            }
            let target = if s.state == SessionState::Connecting {
                SessionState::Closed
            } else {
                SessionState::Draining
            };
            if let Err(e) = s.transition(target) {
                warn!(session_id, error = %e, "cannot close session");
                return false;
            }

            let unanswered = std::mem::take(&mut s.unanswered);
            if let Some(channel) = &s.channel {
                for request_id in unanswered {
                    let _ = channel.send(&GatewayError::SessionTerminated.to_envelope(Some(request_id)));
                }
                let mut data = Map::new();
                data.insert("reason".into(), Value::String(reason.to_string()));
                let _ = channel.send(&Envelope::event(CLOSED_EVENT, data));
            }
            s.detach_channel();
            s.worker_cancel.cancel();
            s.jobs = None;
            s.outbox.clear();
            let failed = s.pending.fail_all();
            if failed > 0 {
                debug!(session_id, failed, "pending requests terminated");
            }
            s.tunnel.take()
        };

        if let Some(handle) = tunnel {
            self.pool.release(&handle).await;
        }
        {
            let mut s = cell.lock();
            if s.state == SessionState::Draining {
                if let Err(e) = s.transition(SessionState::Closed) {
                    warn!(session_id, error = %e, "cannot finish closing session");
                }
            }
        }
        self.remove(session_id, &cell);
        info!(session_id, %reason, "session closed");
        self.emit(SessionEvent::Closed {
            session_id: session_id.to_string(),
            reason,
        });
        true
    }

    fn remove(&self, session_id: &str, cell: &Arc<Mutex<Session>>) {
        let mut sessions = self.sessions.write();
        if sessions.get(session_id).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            sessions.remove(session_id);
        }
    }

    fn spawn_close(&self, session_id: String, reason: CloseReason) {
        let manager = self.me.clone();
        tokio::spawn(async move {
            if let Some(manager) = manager.upgrade() {
                manager.close(&session_id, reason).await;
            }
        });
    }

    /// Expire overdue requests, idle sessions and lapsed reconnect graces.
    pub async fn sweep(&self) {
        let cells: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, cell)| (id.clone(), cell.clone()))
            .collect();

        let mut doomed = Vec::new();
        for (id, cell) in cells {
            let mut s = cell.lock();
            for (request_id, op) in s.pending.expire(self.timeouts.request_timeout) {
                s.forget_request(&request_id);
                warn!(session_id = %id, request_id = %request_id, op = %op, "pending request expired");
            }
            match s.state {
                SessionState::Connecting if s.created_at.elapsed() >= HANDSHAKE_TIMEOUT => {
                    doomed.push((id, CloseReason::HandshakeFailed));
                }
                SessionState::Suspended
                    if !s.resume_claimed && s.grace_expired(self.timeouts.reconnect_grace) =>
                {
                    doomed.push((id, CloseReason::GraceExpired));
                }
                SessionState::Active
                    if s.last_activity.elapsed() >= self.timeouts.session_idle_timeout =>
                {
                    doomed.push((id, CloseReason::IdleTimeout));
                }
                _ => {}
            }
        }

        for (id, reason) in doomed {
            self.close(&id, reason).await;
        }
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        info!(count = ids.len(), "closing all sessions");
        for id in ids {
            self.close(&id, CloseReason::Shutdown).await;
        }
    }

    /// Periodic sweep plus heartbeat signal handling.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.me.clone();
        let mut signals = self.signal_rx.lock().take();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep().await;
                    }
                    Some(signal) = next_signal(&mut signals) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.on_unresponsive(signal);
                    }
                }
            }
            debug!("session maintenance stopped");
        })
    }

    fn spawn_worker(&self, session_id: String) -> (mpsc::UnboundedSender<RequestJob>, CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestJob>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = self.me.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    () = token.cancelled() => break,
                };
                let Some(manager) = manager.upgrade() else { break };
                manager.run_job(&session_id, job).await;
            }
            debug!(session_id = %session_id, "request worker stopped");
        });
        (tx, cancel)
    }

    /// Run one inbound request and answer it with exactly one envelope.
    async fn run_job(&self, session_id: &str, job: RequestJob) {
        let RequestJob { id, request } = job;
        let result = tokio::time::timeout(
            self.timeouts.dispatch_deadline(),
            self.dispatcher.dispatch(self, session_id, &request),
        )
        .await
        .unwrap_or(Err(GatewayError::RequestTimeout));

        let succeeded = result.is_ok();
        let reply = match result {
            Ok(value) => Envelope::response(id.clone(), value),
            Err(e) => {
                warn!(session_id, request_id = %id, op = %request.op, error = %e, "request failed");
                e.to_envelope(Some(id.clone()))
            }
        };
        if let Err(e) = self.answer(session_id, &id, reply) {
            debug!(session_id, request_id = %id, error = %e, "reply not delivered");
        }

        if succeeded && request.op == OP_SESSION_CLOSE {
            self.close(session_id, CloseReason::Requested).await;
        }
    }

    /// Deliver the single reply to an inbound request, unless closing the
    /// session already answered it.
    fn answer(&self, session_id: &str, request_id: &str, reply: Envelope) -> GatewayResult<()> {
        let cell = self.require(session_id)?;
        let mut s = cell.lock();
        if !s.take_unanswered(request_id) {
            return Err(GatewayError::SessionTerminated);
        }
        s.deliver(reply)
    }
}

async fn next_signal(rx: &mut Option<mpsc::UnboundedReceiver<Unresponsive>>) -> Option<Unresponsive> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Generate a random session ID (hex-encoded 16 bytes).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
