// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::clock::{Clock, TimerKind};
use crate::config::PeerConfig;
use crate::connection::{BgpConnection, ConnectionDirection};
use crate::error::Error;
use crate::lock;
use crate::messages::{
    Asn, ErrorCode, Message, NotificationMessage, OpenErrorSubcode,
    OpenMessage, ParseErrorContext, UpdateMessage,
};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{debug, info, trace, warn, Logger};
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hold time proposed in our OPEN when the peer has no explicit
/// configuration.
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_secs(90);

/// Hold time used while waiting for the peer's OPEN. RFC 4271 §8.2.2 calls
/// for a large value here.
pub const OPEN_SENT_HOLD_TIME: Duration = Duration::from_secs(240);

/// Default interval between outbound connection attempts.
pub const DEFAULT_CONNECT_RETRY_TIME: Duration = Duration::from_secs(30);

/// Default time to wait for a passive connection to produce an OPEN before
/// sending ours.
pub const DEFAULT_OPEN_TIME: Duration = Duration::from_secs(15);

/// First idle hold (damping) interval. Doubles on each trip through idle
/// up to [`MAX_IDLE_HOLD_TIME`].
pub const INITIAL_IDLE_HOLD_TIME: Duration = Duration::from_millis(5_000);

/// Ceiling for the idle hold backoff.
pub const MAX_IDLE_HOLD_TIME: Duration = Duration::from_millis(100_000);

/// Jitter factor range applied to the connect retry and idle hold timers so
/// peers started together do not stay in lockstep.
pub const DEFAULT_TIMER_JITTER: (f64, f64) = (0.9, 1.0);

/// Default timer tick resolution.
pub const DEFAULT_TIMER_RESOLUTION: Duration = Duration::from_millis(100);

/// How often the event loop wakes to check for a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// The states a BGP peer state machine may be in at any given time. One
/// state machine covers the peer, not the connection: during a connection
/// collision it tracks both the outbound and inbound connection until
/// resolution picks one.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, JsonSchema,
)]
pub enum FsmState {
    /// Initial state. Refuse all inbound connections. No resources
    /// allocated to the peer.
    Idle,

    /// Waiting for an inbound connection, or for the connect retry timer
    /// to trigger an outbound attempt.
    Active,

    /// An outbound connection attempt is in flight.
    Connect,

    /// Our OPEN has been sent; waiting for the peer's OPEN.
    OpenSent,

    /// OPENs exchanged; waiting for the peer's KEEPALIVE.
    OpenConfirm,

    /// Steady state. Able to exchange update, notification and keepalive
    /// messages with the peer.
    Established,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Connect => "connect",
            Self::OpenSent => "open sent",
            Self::OpenConfirm => "open confirm",
            Self::Established => "established",
        }
    }
}

impl Display for FsmState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One transport connection to the peer, as tracked by the state machine.
/// The state machine owns the only strong references that outlive a single
/// event: one in its active/passive slot and (transiently) one inside each
/// queued event that refers to the session. Connection readers hold a weak
/// reference that they upgrade per message. A session leaves the state
/// machine only through the delete pseudo event, which is submitted at most
/// once and is dispatched after every event already queued against the
/// session has drained or been validated out.
pub struct Session<Cnx: BgpConnection> {
    pub conn: Cnx,

    direction: ConnectionDirection,

    /// Cleared when the state machine stops tracking the session. Readers
    /// stop posting events for dead sessions.
    alive: AtomicBool,

    /// Set once our OPEN has been written to this connection.
    open_sent: AtomicBool,

    /// Set when the delete pseudo event for this session is posted.
    delete_submitted: AtomicBool,

    /// The peer's OPEN as received on this connection, once seen.
    pub remote_open: Mutex<Option<OpenMessage>>,
}

impl<Cnx: BgpConnection> Session<Cnx> {
    pub fn outbound(conn: Cnx) -> Arc<Self> {
        Self::new(conn, ConnectionDirection::Outbound)
    }

    pub fn inbound(conn: Cnx) -> Arc<Self> {
        Self::new(conn, ConnectionDirection::Inbound)
    }

    fn new(conn: Cnx, direction: ConnectionDirection) -> Arc<Self> {
        Arc::new(Self {
            conn,
            direction,
            alive: AtomicBool::new(true),
            open_sent: AtomicBool::new(false),
            delete_submitted: AtomicBool::new(false),
            remote_open: Mutex::new(None),
        })
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn open_sent(&self) -> bool {
        self.open_sent.load(Ordering::Acquire)
    }

    fn set_open_sent(&self) {
        self.open_sent.store(true, Ordering::Release);
    }

    /// True once the peer's OPEN has been received on this connection.
    pub fn open_received(&self) -> bool {
        lock!(self.remote_open).is_some()
    }
}

impl<Cnx: BgpConnection> fmt::Debug for Session<Cnx> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.conn.peer())
            .field("direction", &self.direction)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Events originating from an administrative action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminEvent {
    /// Start the peering. Skips any idle hold damping in progress.
    Start,

    /// Stop the peering. The machine stays idle until the next start.
    Stop,

    /// Administratively disable (true) or re-enable (false) the peer.
    AdminDown(bool),
}

impl AdminEvent {
    fn title(&self) -> &'static str {
        match self {
            Self::Start => "admin start",
            Self::Stop => "admin stop",
            Self::AdminDown(true) => "admin down",
            Self::AdminDown(false) => "admin up",
        }
    }
}

/// Events reported by the transport layer.
pub enum TcpEvent<Cnx: BgpConnection> {
    /// An outbound connection attempt completed.
    Connected(Arc<Session<Cnx>>),

    /// An outbound connection attempt failed.
    ConnectFailed(Arc<Session<Cnx>>),

    /// The peer closed the connection, or it was lost.
    Closed(Arc<Session<Cnx>>),

    /// An inbound connection was accepted by the listener.
    PassiveOpen(Arc<Session<Cnx>>),

    /// Pseudo event: reclaim a session the state machine no longer tracks.
    /// Routing teardown through the queue guarantees that transport
    /// callbacks already posted against the session run (and are validated
    /// out) before the connection is closed.
    DeleteSession(Arc<Session<Cnx>>),
}

impl<Cnx: BgpConnection> TcpEvent<Cnx> {
    fn title(&self) -> &'static str {
        match self {
            Self::Connected(_) => "tcp connected",
            Self::ConnectFailed(_) => "tcp connect failed",
            Self::Closed(_) => "tcp closed",
            Self::PassiveOpen(_) => "tcp passive open",
            Self::DeleteSession(_) => "delete session",
        }
    }
}

/// Parsed messages (and parse failures) delivered by a connection reader.
pub enum MessageEvent<Cnx: BgpConnection> {
    Open(Arc<Session<Cnx>>, OpenMessage),
    KeepAlive(Arc<Session<Cnx>>),
    Update(Arc<Session<Cnx>>, UpdateMessage),
    Notification(Arc<Session<Cnx>>, NotificationMessage),
    HeaderError(Arc<Session<Cnx>>, ParseErrorContext),
    OpenError(Arc<Session<Cnx>>, ParseErrorContext),
    UpdateError(Arc<Session<Cnx>>, ParseErrorContext),
}

impl<Cnx: BgpConnection> MessageEvent<Cnx> {
    fn title(&self) -> &'static str {
        match self {
            Self::Open(..) => "bgp open",
            Self::KeepAlive(_) => "bgp keepalive",
            Self::Update(..) => "bgp update",
            Self::Notification(..) => "bgp notification",
            Self::HeaderError(..) => "bgp header error",
            Self::OpenError(..) => "bgp open error",
            Self::UpdateError(..) => "bgp update error",
        }
    }
}

/// A timer expiry, stamped with the generation the timer carried when it
/// fired. A cancel or restart that raced with the expiry bumps the
/// generation, and validation discards the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub kind: TimerKind,
    pub generation: u64,
}

impl TimerExpiry {
    fn title(&self) -> &'static str {
        match self.kind {
            TimerKind::ConnectRetry => "connect retry timer expires",
            TimerKind::Open => "open timer expires",
            TimerKind::Hold => "hold timer expires",
            TimerKind::IdleHold => "idle hold timer expires",
        }
    }
}

/// The events that drive the peer state machine, grouped by producer.
/// Administrative events come from the configuration plane, TCP events from
/// the transport, message events from the connection readers and timer
/// events from the clock thread. Producers only post; all handling happens
/// on the single consumer draining the peer's queue.
pub enum FsmEvent<Cnx: BgpConnection> {
    Admin(AdminEvent),
    Tcp(TcpEvent<Cnx>),
    Message(MessageEvent<Cnx>),
    Timer(TimerExpiry),
}

impl<Cnx: BgpConnection> FsmEvent<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Admin(e) => e.title(),
            Self::Tcp(e) => e.title(),
            Self::Message(e) => e.title(),
            Self::Timer(e) => e.title(),
        }
    }

    /// The session this event refers to, when it refers to one.
    fn session(&self) -> Option<&Arc<Session<Cnx>>> {
        match self {
            Self::Admin(_) | Self::Timer(_) => None,
            Self::Tcp(e) => match e {
                TcpEvent::Connected(s)
                | TcpEvent::ConnectFailed(s)
                | TcpEvent::Closed(s)
                | TcpEvent::PassiveOpen(s)
                | TcpEvent::DeleteSession(s) => Some(s),
            },
            Self::Message(e) => match e {
                MessageEvent::Open(s, _)
                | MessageEvent::KeepAlive(s)
                | MessageEvent::Update(s, _)
                | MessageEvent::Notification(s, _)
                | MessageEvent::HeaderError(s, _)
                | MessageEvent::OpenError(s, _)
                | MessageEvent::UpdateError(s, _) => Some(s),
            },
        }
    }
}

/// A predicate evaluated against the state machine immediately before an
/// event is dispatched. Events are posted from other threads, so by the
/// time one is dequeued the session or timer it refers to may already be
/// gone; a validator that returns false discards the event. Validators must
/// be cheap and side effect free. Running them at post time instead would
/// race: state can change between post and dispatch.
pub type EventValidator<Cnx> =
    Box<dyn Fn(&SessionRunner<Cnx>) -> bool + Send>;

/// An event paired with its optional validator, as carried on the queue.
pub struct EventContainer<Cnx: BgpConnection> {
    pub event: FsmEvent<Cnx>,
    pub validate: Option<EventValidator<Cnx>>,
}

impl<Cnx: BgpConnection> EventContainer<Cnx> {
    pub fn new(event: FsmEvent<Cnx>) -> Self {
        Self {
            event,
            validate: None,
        }
    }

    pub fn validated(
        event: FsmEvent<Cnx>,
        validate: EventValidator<Cnx>,
    ) -> Self {
        Self {
            event,
            validate: Some(validate),
        }
    }

    /// Wrap an event with the standard session validator: the referenced
    /// session must still be one the state machine tracks.
    pub fn tracked(
        event: FsmEvent<Cnx>,
        session: &Arc<Session<Cnx>>,
    ) -> Self {
        let s = Arc::clone(session);
        Self::validated(event, Box::new(move |r| r.tracks(&s)))
    }
}

/// Build the queue entry for a message received on `session`.
pub fn message_event<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    msg: Message,
) -> EventContainer<Cnx> {
    let event = match msg {
        Message::Open(m) => MessageEvent::Open(Arc::clone(session), m),
        Message::KeepAlive => MessageEvent::KeepAlive(Arc::clone(session)),
        Message::Update(m) => MessageEvent::Update(Arc::clone(session), m),
        Message::Notification(m) => {
            MessageEvent::Notification(Arc::clone(session), m)
        }
    };
    EventContainer::tracked(FsmEvent::Message(event), session)
}

/// Build the queue entry for a message that failed to parse on `session`.
pub fn parse_error_event<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    ctx: ParseErrorContext,
) -> EventContainer<Cnx> {
    let s = Arc::clone(session);
    let event = match ctx.error_code {
        ErrorCode::Open => MessageEvent::OpenError(s, ctx),
        ErrorCode::Update => MessageEvent::UpdateError(s, ctx),
        _ => MessageEvent::HeaderError(s, ctx),
    };
    EventContainer::tracked(FsmEvent::Message(event), session)
}

/// Per-session configuration. The hold time here is what we propose in our
/// OPEN; the value actually used is negotiated down to the minimum of both
/// sides' proposals. Hold and connect intervals are second-granularity
/// protocol quantities, the idle hold backoff is managed in milliseconds;
/// both are carried as `Duration` so the units cannot be crossed.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// ASN the peer must present in its OPEN. None accepts any.
    pub remote_asn: Option<u32>,

    /// Optional source address for outbound connections.
    pub bind_addr: Option<SocketAddr>,

    /// How long to wait between outbound connection attempts.
    pub connect_retry_time: Duration,

    /// How long a passive connection may wait for the peer's OPEN before we
    /// send ours.
    pub open_time: Duration,

    /// Hold time proposed in our OPEN.
    pub hold_time: Duration,

    /// Initial idle hold interval. Zero disables damping.
    pub idle_hold_time: Duration,

    /// Ceiling for the idle hold backoff.
    pub max_idle_hold_time: Duration,

    /// Jitter range for the connect retry timer.
    pub connect_retry_jitter: Option<(f64, f64)>,

    /// Jitter range for the idle hold timer.
    pub idle_hold_jitter: Option<(f64, f64)>,

    /// Timer tick resolution.
    pub resolution: Duration,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            remote_asn: None,
            bind_addr: None,
            connect_retry_time: DEFAULT_CONNECT_RETRY_TIME,
            open_time: DEFAULT_OPEN_TIME,
            hold_time: DEFAULT_HOLD_TIME,
            idle_hold_time: INITIAL_IDLE_HOLD_TIME,
            max_idle_hold_time: MAX_IDLE_HOLD_TIME,
            connect_retry_jitter: Some(DEFAULT_TIMER_JITTER),
            idle_hold_jitter: Some(DEFAULT_TIMER_JITTER),
            resolution: DEFAULT_TIMER_RESOLUTION,
        }
    }
}

impl SessionInfo {
    pub fn from_peer_config(peer_config: &PeerConfig) -> Self {
        Self {
            remote_asn: peer_config.remote_asn,
            bind_addr: None,
            connect_retry_time: Duration::from_secs(
                peer_config.connect_retry,
            ),
            open_time: Duration::from_secs(peer_config.open_time),
            hold_time: Duration::from_secs(peer_config.hold_time),
            idle_hold_time: Duration::from_millis(
                peer_config.idle_hold_time,
            ),
            max_idle_hold_time: MAX_IDLE_HOLD_TIME,
            connect_retry_jitter: Some(DEFAULT_TIMER_JITTER),
            idle_hold_jitter: Some(DEFAULT_TIMER_JITTER),
            resolution: Duration::from_millis(peer_config.resolution),
        }
    }
}

/// Information about a neighbor (peer).
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    pub name: String,
    pub host: SocketAddr,
}

/// A notification we sent or received, kept for observability.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotificationRecord {
    pub code: u8,
    pub subcode: u8,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl NotificationRecord {
    fn new(code: ErrorCode, subcode: u8, reason: &str) -> Self {
        Self {
            code: code as u8,
            subcode,
            reason: reason.to_string(),
            at: Utc::now(),
        }
    }
}

/// Counters for messages, transitions and queue hygiene. All monotonically
/// increasing over the life of the session runner.
#[derive(Default)]
pub struct SessionCounters {
    pub opens_sent: AtomicU64,
    pub opens_received: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub keepalives_received: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_received: AtomicU64,
    pub updates_received: AtomicU64,
    pub send_failures: AtomicU64,

    pub passive_connections_accepted: AtomicU64,
    pub passive_connections_declined: AtomicU64,
    pub tcp_connection_failures: AtomicU64,
    pub connection_retries: AtomicU64,

    pub transitions_to_idle: AtomicU64,
    pub transitions_to_active: AtomicU64,
    pub transitions_to_connect: AtomicU64,
    pub transitions_to_open_sent: AtomicU64,
    pub transitions_to_open_confirm: AtomicU64,
    pub transitions_to_established: AtomicU64,

    pub hold_timer_expirations: AtomicU64,
    pub idle_hold_timer_expirations: AtomicU64,

    /// Events discarded because their validator returned false.
    pub events_discarded: AtomicU64,

    /// Events that had no transition for the state they arrived in.
    pub stray_events: AtomicU64,

    pub sessions_deleted: AtomicU64,
}

/// Which connection survives a collision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// The connection we initiated is kept.
    KeepActive,

    /// The connection the peer initiated is kept.
    KeepPassive,
}

/// Decide which of two simultaneous connections survives.
///
/// RFC 4271 §6.8: the BGP identifiers are compared as four-octet unsigned
/// integers, and the connection initiated by the side with the numerically
/// higher identifier is kept. The loser is closed with a Cease
/// notification. Identifiers are required to be distinct; equality is a
/// configuration error handled before resolution is attempted.
pub fn collision_resolution(
    local_id: u32,
    remote_id: u32,
) -> CollisionOutcome {
    if local_id > remote_id {
        CollisionOutcome::KeepActive
    } else {
        CollisionOutcome::KeepPassive
    }
}

/// Compute the next idle hold interval after a trip through idle: double
/// the current value, but never below the configured initial interval nor
/// above the ceiling.
fn next_idle_hold_time(
    current: Duration,
    initial: Duration,
    max: Duration,
) -> Duration {
    (current * 2).max(initial).min(max)
}

/// The top level object driving one peer's state machine.
///
/// All mutation of peer state happens on a single logical worker: the
/// thread that calls [`SessionRunner::start`] and drains the event queue.
/// Everything else only posts events. Administrative commands are posted
/// from the configuration plane, connection lifecycle events from the
/// transport threads, parsed messages from the per-connection readers, and
/// timer expirations from the clock thread. Per-peer queues are
/// independent, so the runners for different peers progress in parallel.
///
/// The runner tracks up to two sessions at once: the outbound connection it
/// initiated (active) and an inbound connection from the peer (passive).
/// Both may be live while a connection collision is being resolved; exactly
/// one survives into the established state, and the other is closed with a
/// Cease notification. Sessions are never destroyed synchronously from a
/// transport callback. Instead the runner detaches the session from its
/// slot and posts a delete pseudo event; by the time that event is
/// dispatched, any event already queued against the session has either
/// drained or failed validation.
pub struct SessionRunner<Cnx: BgpConnection + 'static> {
    /// Event queue sender. Cloned out to every producer that needs to post
    /// events to this runner.
    pub event_tx: Sender<EventContainer<Cnx>>,

    /// Information about the neighbor this session peers with.
    pub neighbor: NeighborInfo,

    /// Counters for messages, transitions and queue hygiene.
    pub counters: Arc<SessionCounters>,

    /// The timer set for this peer.
    pub clock: Clock,

    /// Configuration for this session.
    pub session: Mutex<SessionInfo>,

    event_rx: Mutex<Option<Receiver<EventContainer<Cnx>>>>,

    state: Mutex<FsmState>,
    last_state: Mutex<FsmState>,
    last_state_change: Mutex<DateTime<Utc>>,
    last_event: Mutex<String>,

    active_session: Mutex<Option<Arc<Session<Cnx>>>>,
    passive_session: Mutex<Option<Arc<Session<Cnx>>>>,

    /// Hold time in effect: the configured proposal until an OPEN exchange
    /// negotiates it down.
    hold_time: Mutex<Duration>,

    /// Current idle hold backoff. Zeroed on a clean transition to
    /// established, doubled (up to the ceiling) on each drop to idle.
    idle_hold_time: Mutex<Duration>,

    /// Outbound connection attempts since the counter was last cleared.
    attempts: AtomicU64,

    asn: Asn,
    id: u32,

    admin_down: AtomicBool,
    started: AtomicBool,
    shutdown: AtomicBool,
    running: AtomicBool,

    last_notification_in: Mutex<Option<NotificationRecord>>,
    last_notification_out: Mutex<Option<NotificationRecord>>,

    /// Sink for route-bearing updates. Route processing happens above this
    /// crate.
    updates: Sender<UpdateMessage>,

    log: Logger,
}

impl<Cnx: BgpConnection + 'static> Drop for SessionRunner<Cnx> {
    fn drop(&mut self) {
        let peer_ip = self.neighbor.host.ip();
        let final_state = *lock!(self.state);
        debug!(
            self.log,
            "dropping session runner for peer {peer_ip} (final state: {final_state})"
        );
    }
}

impl<Cnx: BgpConnection + 'static> SessionRunner<Cnx> {
    /// Create a new session runner. Only constructs the object; call
    /// [`SessionRunner::start`] to run the peering state machine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionInfo,
        neighbor: NeighborInfo,
        asn: Asn,
        id: u32,
        event_rx: Receiver<EventContainer<Cnx>>,
        event_tx: Sender<EventContainer<Cnx>>,
        updates: Sender<UpdateMessage>,
        log: Logger,
    ) -> SessionRunner<Cnx> {
        let log = log.new(slog::o!(
            "unit" => "session_runner",
            "peer" => neighbor.host.to_string(),
        ));
        let clock = Clock::new(
            session.resolution,
            session.connect_retry_jitter,
            session.idle_hold_jitter,
            event_tx.clone(),
            log.clone(),
        );
        let initial_idle_hold = session.idle_hold_time;
        let initial_hold = session.hold_time;
        SessionRunner {
            event_tx,
            neighbor,
            counters: Arc::new(SessionCounters::default()),
            clock,
            session: Mutex::new(session),
            event_rx: Mutex::new(Some(event_rx)),
            state: Mutex::new(FsmState::Idle),
            last_state: Mutex::new(FsmState::Idle),
            last_state_change: Mutex::new(Utc::now()),
            last_event: Mutex::new(String::new()),
            active_session: Mutex::new(None),
            passive_session: Mutex::new(None),
            hold_time: Mutex::new(initial_hold),
            idle_hold_time: Mutex::new(initial_idle_hold),
            attempts: AtomicU64::new(0),
            asn,
            id,
            admin_down: AtomicBool::new(false),
            started: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_notification_in: Mutex::new(None),
            last_notification_out: Mutex::new(None),
            updates,
            log,
        }
    }

    /// Run the peer state machine. Blocks, draining the event queue one
    /// event at a time, until a shutdown is requested. Callers normally
    /// spawn a thread for this.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!(self.log, "starting peer state machine");

        let rx = match lock!(self.event_rx).take() {
            Some(rx) => rx,
            None => return,
        };

        // Enter idle: begins the damping interval, or moves straight out
        // of idle if damping is disabled.
        self.transition(FsmState::Idle, "initialize");

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.on_shutdown();
                return;
            }
            let ec = match rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(ec) => ec,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.on_shutdown();
                    return;
                }
            };
            self.step(ec);
        }
    }

    /// Request a shutdown. Irreversible. The event loop notices the flag,
    /// tears down any tracked sessions and returns; events posted after
    /// this point are silently discarded.
    pub fn shutdown(&self) {
        info!(self.log, "session runner received shutdown request");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn deleted(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Post an event to the queue driving this peer. Never blocks. Events
    /// posted after shutdown are dropped.
    pub fn send_event(&self, ec: EventContainer<Cnx>) -> Result<(), Error> {
        if self.deleted() {
            return Ok(());
        }
        self.event_tx
            .send(ec)
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Administratively start the peering.
    pub fn manual_start(&self) -> Result<(), Error> {
        self.send_event(EventContainer::new(FsmEvent::Admin(
            AdminEvent::Start,
        )))
    }

    /// Administratively stop the peering. The machine drops to idle and
    /// stays there until the next start.
    pub fn manual_stop(&self) -> Result<(), Error> {
        self.send_event(EventContainer::new(FsmEvent::Admin(
            AdminEvent::Stop,
        )))
    }

    /// Administratively disable or re-enable the peer.
    pub fn set_admin_state(&self, down: bool) -> Result<(), Error> {
        self.send_event(EventContainer::new(FsmEvent::Admin(
            AdminEvent::AdminDown(down),
        )))
    }

    /// Hand an accepted inbound connection to the state machine.
    pub fn passive_open(&self, conn: Cnx) -> Result<Arc<Session<Cnx>>, Error> {
        let session = Session::inbound(conn);
        self.send_event(EventContainer::new(FsmEvent::Tcp(
            TcpEvent::PassiveOpen(Arc::clone(&session)),
        )))?;
        Ok(session)
    }

    /// Validate and dispatch one event. This is the only place peer state
    /// is mutated.
    pub(crate) fn step(&self, ec: EventContainer<Cnx>) {
        if self.deleted() {
            return;
        }

        if let Some(validate) = &ec.validate {
            if !validate(self) {
                self.counters
                    .events_discarded
                    .fetch_add(1, Ordering::Relaxed);
                trace!(self.log, "discard stale {} event", ec.event.title());
                return;
            }
        }

        let title = ec.event.title();
        // The delete pseudo event is queue bookkeeping, not part of the
        // peer's observable history.
        if !matches!(ec.event, FsmEvent::Tcp(TcpEvent::DeleteSession(_))) {
            *lock!(self.last_event) = title.to_string();
        }

        let next = match ec.event {
            FsmEvent::Admin(event) => self.on_admin(event),
            FsmEvent::Tcp(TcpEvent::DeleteSession(s)) => {
                self.dispatch_delete(&s);
                None
            }
            event => {
                let state = self.state();
                match state {
                    FsmState::Idle => self.idle(event),
                    FsmState::Active => self.active(event),
                    FsmState::Connect => self.connect(event),
                    FsmState::OpenSent => self.open_sent(event),
                    FsmState::OpenConfirm => self.open_confirm(event),
                    FsmState::Established => self.established(event),
                }
            }
        };

        if let Some(next) = next {
            self.transition(next, title);
        }

        debug_assert!(
            self.check_invariants(),
            "fsm invariants violated after {title}"
        );
    }

    // Administrative events are handled uniformly across states.
    fn on_admin(&self, event: AdminEvent) -> Option<FsmState> {
        match event {
            AdminEvent::Start => {
                self.started.store(true, Ordering::Release);
                if self.admin_down() {
                    warn!(self.log, "start requested while admin down");
                    return None;
                }
                match self.state() {
                    FsmState::Idle => {
                        self.clock.timers.idle_hold.cancel();
                        Some(FsmState::Active)
                    }
                    s => {
                        debug!(self.log, "start requested in {s}, ignoring");
                        None
                    }
                }
            }
            AdminEvent::Stop => {
                self.started.store(false, Ordering::Release);
                self.attempts.store(0, Ordering::Relaxed);
                self.teardown_sessions();
                Some(FsmState::Idle)
            }
            AdminEvent::AdminDown(down) => {
                self.admin_down.store(down, Ordering::Release);
                if down {
                    self.teardown_sessions();
                    Some(FsmState::Idle)
                } else if self.state() == FsmState::Idle {
                    // Re-enter idle to begin the damping interval again.
                    Some(FsmState::Idle)
                } else {
                    None
                }
            }
        }
    }

    /// Initial state. Refuse all inbound connections. The idle hold timer
    /// paces how quickly we try again after a failure.
    fn idle(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::IdleHold,
                ..
            }) => {
                if self.admin_down() || !self.started() {
                    return None;
                }
                self.counters
                    .idle_hold_timer_expirations
                    .fetch_add(1, Ordering::Relaxed);
                Some(FsmState::Active)
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                // Silently refuse; a notification here can contribute to
                // connection death spirals when peers start out of sync.
                info!(
                    self.log,
                    "inbound connection not allowed in idle (peer: {})",
                    s.peer()
                );
                self.counters
                    .passive_connections_declined
                    .fetch_add(1, Ordering::Relaxed);
                self.delete_session(s);
                None
            }
            event => {
                // Anything else in idle is dropped without effect.
                self.counters.stray_events.fetch_add(1, Ordering::Relaxed);
                debug!(
                    self.log,
                    "stray fsm event {} in idle, discarding",
                    event.title()
                );
                None
            }
        }
    }

    /// Waiting for an inbound connection, or for the connect retry timer to
    /// trigger an outbound attempt.
    fn active(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::ConnectRetry,
                ..
            }) => {
                self.begin_connect();
                Some(FsmState::Connect)
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                if !self.bind_passive(&s) {
                    return None;
                }
                self.clock
                    .timers
                    .open
                    .start(lock!(self.session).open_time);
                if self.send_open(&s).is_err() {
                    return self.on_idle();
                }
                Some(FsmState::OpenSent)
            }
            FsmEvent::Tcp(TcpEvent::Closed(s)) => {
                self.detach_and_delete(&s);
                None
            }
            FsmEvent::Message(MessageEvent::Notification(s, m)) => {
                self.on_notification(&s, &m)
            }
            event => self.on_stray(&event, FsmState::Active),
        }
    }

    /// An outbound connection attempt is in flight. An inbound connection
    /// arriving now rides alongside it until collision resolution.
    fn connect(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Tcp(TcpEvent::Connected(s)) => {
                if self.start_reader(&s).is_err() {
                    self.detach_and_delete(&s);
                    return self.on_idle();
                }
                if self.send_open(&s).is_err() {
                    return self.on_idle();
                }
                Some(FsmState::OpenSent)
            }
            FsmEvent::Tcp(TcpEvent::ConnectFailed(s)) => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .tcp_connection_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.detach_and_delete(&s);
                // A live inbound connection beats going back to wait: send
                // our OPEN on it rather than discarding it.
                if let Some(p) = self.passive_session() {
                    if self.send_open(&p).is_err() {
                        return self.on_idle();
                    }
                    return Some(FsmState::OpenSent);
                }
                Some(FsmState::Active)
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                if self.bind_passive(&s) {
                    self.clock
                        .timers
                        .open
                        .start(lock!(self.session).open_time);
                }
                None
            }
            FsmEvent::Tcp(TcpEvent::Closed(s)) => {
                self.detach_and_delete(&s);
                None
            }
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::ConnectRetry,
                ..
            }) => {
                // The attempt took too long. Abandon it and start a fresh
                // cycle.
                self.counters
                    .connection_retries
                    .fetch_add(1, Ordering::Relaxed);
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.teardown_sessions();
                Some(FsmState::Active)
            }
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::Open,
                ..
            }) => {
                // The peer has not sent an OPEN on its inbound connection;
                // stop waiting and send ours.
                let passive = self.passive_session()?;
                if self.send_open(&passive).is_err() {
                    return self.on_idle();
                }
                Some(FsmState::OpenSent)
            }
            FsmEvent::Message(MessageEvent::Open(s, m)) => {
                // The peer's OPEN beat ours on the inbound connection.
                self.open_received(s, m)
            }
            FsmEvent::Message(MessageEvent::Notification(s, m)) => {
                self.on_notification(&s, &m)
            }
            FsmEvent::Message(MessageEvent::HeaderError(s, ctx))
            | FsmEvent::Message(MessageEvent::OpenError(s, ctx))
            | FsmEvent::Message(MessageEvent::UpdateError(s, ctx)) => self
                .on_idle_error(
                    Some(&s),
                    ctx.error_code,
                    ctx.error_subcode,
                    &ctx.detail,
                ),
            event => self.on_stray(&event, FsmState::Connect),
        }
    }

    /// Our OPEN is out; waiting for the peer's. Both sessions may be live
    /// here during a collision.
    fn open_sent(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Message(MessageEvent::Open(s, m)) => {
                self.open_received(s, m)
            }
            FsmEvent::Message(MessageEvent::Notification(s, m)) => {
                self.on_notification(&s, &m)
            }
            FsmEvent::Message(MessageEvent::HeaderError(s, ctx))
            | FsmEvent::Message(MessageEvent::OpenError(s, ctx))
            | FsmEvent::Message(MessageEvent::UpdateError(s, ctx)) => self
                .on_idle_error(
                    Some(&s),
                    ctx.error_code,
                    ctx.error_subcode,
                    &ctx.detail,
                ),
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::Hold,
                ..
            }) => self.on_hold_expired(),
            FsmEvent::Tcp(TcpEvent::Closed(s))
            | FsmEvent::Tcp(TcpEvent::ConnectFailed(s)) => {
                self.detach_and_delete(&s);
                if self.session_count() == 0 {
                    self.on_idle()
                } else {
                    // The other connection carries the session forward.
                    None
                }
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                // Collision: the peer connected while our OPEN is in
                // flight on the outbound connection.
                if self.bind_passive(&s) && self.send_open(&s).is_err() {
                    return self.on_idle();
                }
                None
            }
            FsmEvent::Tcp(TcpEvent::Connected(s)) => {
                // Our outbound attempt completed while an inbound
                // connection carries the handshake: a collision forms.
                if self.start_reader(&s).is_err() {
                    self.detach_and_delete(&s);
                    return None;
                }
                if self.send_open(&s).is_err() {
                    self.detach_and_delete(&s);
                }
                None
            }
            event => self.on_stray(&event, FsmState::OpenSent),
        }
    }

    /// OPENs exchanged on the surviving connection; waiting for the peer's
    /// KEEPALIVE.
    fn open_confirm(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Message(MessageEvent::KeepAlive(s)) => {
                self.counters
                    .keepalives_received
                    .fetch_add(1, Ordering::Relaxed);
                if !s.open_received() {
                    return self.on_idle_error(
                        Some(&s),
                        ErrorCode::Fsm,
                        0,
                        "keepalive before open",
                    );
                }
                // Promote to the steady state session; anything else still
                // tracked is closed out.
                self.assign_session(&s);
                self.attempts.store(0, Ordering::Relaxed);
                Some(FsmState::Established)
            }
            FsmEvent::Message(MessageEvent::Open(s, m)) => {
                self.open_received(s, m)
            }
            FsmEvent::Message(MessageEvent::Notification(s, m)) => {
                self.on_notification(&s, &m)
            }
            FsmEvent::Message(MessageEvent::HeaderError(s, ctx))
            | FsmEvent::Message(MessageEvent::OpenError(s, ctx))
            | FsmEvent::Message(MessageEvent::UpdateError(s, ctx)) => self
                .on_idle_error(
                    Some(&s),
                    ctx.error_code,
                    ctx.error_subcode,
                    &ctx.detail,
                ),
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::Hold,
                ..
            }) => self.on_hold_expired(),
            FsmEvent::Tcp(TcpEvent::Closed(s))
            | FsmEvent::Tcp(TcpEvent::ConnectFailed(s)) => {
                let confirmed = s.open_received();
                self.detach_and_delete(&s);
                if confirmed {
                    self.on_idle()
                } else {
                    None
                }
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                // Late collision; track the inbound connection until its
                // OPEN arrives and resolution picks a winner.
                if self.bind_passive(&s) && self.send_open(&s).is_err() {
                    return self.on_idle();
                }
                None
            }
            FsmEvent::Tcp(TcpEvent::Connected(s)) => {
                // Late collision on our own outbound attempt.
                if self.start_reader(&s).is_err() {
                    self.detach_and_delete(&s);
                    return None;
                }
                if self.send_open(&s).is_err() {
                    self.detach_and_delete(&s);
                }
                None
            }
            event => self.on_stray(&event, FsmState::OpenConfirm),
        }
    }

    /// Steady state.
    fn established(&self, event: FsmEvent<Cnx>) -> Option<FsmState> {
        match event {
            FsmEvent::Message(MessageEvent::KeepAlive(s)) => {
                self.counters
                    .keepalives_received
                    .fetch_add(1, Ordering::Relaxed);
                if !s.open_received() {
                    return self.on_idle_error(
                        Some(&s),
                        ErrorCode::Fsm,
                        0,
                        "keepalive before open",
                    );
                }
                self.restart_hold_timer();
                None
            }
            FsmEvent::Message(MessageEvent::Update(_, m)) => {
                self.counters
                    .updates_received
                    .fetch_add(1, Ordering::Relaxed);
                self.restart_hold_timer();
                if let Err(e) = self.updates.send(m) {
                    warn!(self.log, "update sink unavailable: {e}");
                }
                None
            }
            FsmEvent::Message(MessageEvent::Notification(s, m)) => {
                self.on_notification(&s, &m)
            }
            FsmEvent::Message(MessageEvent::Open(s, _)) => {
                if s.open_received() {
                    // A second OPEN on the established session is a
                    // protocol violation.
                    return self.on_idle_error(
                        Some(&s),
                        ErrorCode::Fsm,
                        0,
                        "duplicate open",
                    );
                }
                // Collision against an established session: the
                // established connection always wins.
                self.send_notification(
                    &s,
                    ErrorCode::Cease,
                    0,
                    "collision with established session",
                );
                self.detach_and_delete(&s);
                None
            }
            FsmEvent::Message(MessageEvent::HeaderError(s, ctx))
            | FsmEvent::Message(MessageEvent::OpenError(s, ctx))
            | FsmEvent::Message(MessageEvent::UpdateError(s, ctx)) => self
                .on_idle_error(
                    Some(&s),
                    ctx.error_code,
                    ctx.error_subcode,
                    &ctx.detail,
                ),
            FsmEvent::Timer(TimerExpiry {
                kind: TimerKind::Hold,
                ..
            }) => self.on_hold_expired(),
            FsmEvent::Tcp(TcpEvent::Closed(s))
            | FsmEvent::Tcp(TcpEvent::ConnectFailed(s)) => {
                let primary = s.open_received();
                self.detach_and_delete(&s);
                if primary {
                    self.on_idle()
                } else {
                    None
                }
            }
            FsmEvent::Tcp(TcpEvent::Connected(s)) => {
                // A leftover outbound attempt completed after the session
                // was already established; the established connection wins.
                self.send_notification(
                    &s,
                    ErrorCode::Cease,
                    0,
                    "collision with established session",
                );
                self.detach_and_delete(&s);
                None
            }
            FsmEvent::Tcp(TcpEvent::PassiveOpen(s)) => {
                self.counters
                    .passive_connections_declined
                    .fetch_add(1, Ordering::Relaxed);
                self.send_notification(
                    &s,
                    ErrorCode::Cease,
                    0,
                    "collision with established session",
                );
                self.delete_session(s);
                None
            }
            event => self.on_stray(&event, FsmState::Established),
        }
    }

    /// Process a received OPEN: validate it, negotiate the hold time, and
    /// resolve a collision when both connections are live. Shared between
    /// the connect, open sent and open confirm states.
    fn open_received(
        &self,
        s: Arc<Session<Cnx>>,
        m: OpenMessage,
    ) -> Option<FsmState> {
        self.counters.opens_received.fetch_add(1, Ordering::Relaxed);

        if s.open_received() {
            return self.on_idle_error(
                Some(&s),
                ErrorCode::Fsm,
                0,
                "duplicate open",
            );
        }

        // Identifiers must be non-zero and distinct. A peer presenting our
        // own identifier would make collision resolution impossible; treat
        // it as a configuration error.
        if m.id == 0 || m.id == self.id {
            return self.on_idle_error(
                Some(&s),
                ErrorCode::Open,
                OpenErrorSubcode::BadBgpIdentifier as u8,
                &format!("bad bgp identifier {}", m.id),
            );
        }

        let expected_asn = lock!(self.session).remote_asn;
        if let Some(expected) = expected_asn {
            let got = m.effective_asn();
            if got != expected {
                return self.on_idle_error(
                    Some(&s),
                    ErrorCode::Open,
                    OpenErrorSubcode::BadPeerAs as u8,
                    &format!("expected asn {expected} got {got}"),
                );
            }
        }

        // RFC 4271 §4.2: zero disables keepalives, anything else must be
        // at least three seconds.
        if m.hold_time > 0 && m.hold_time < 3 {
            return self.on_idle_error(
                Some(&s),
                ErrorCode::Open,
                OpenErrorSubcode::UnacceptableHoldTime as u8,
                &format!("unacceptable hold time {}", m.hold_time),
            );
        }

        let proposed = lock!(self.session).hold_time;
        let theirs = Duration::from_secs(u64::from(m.hold_time));
        let negotiated = proposed.min(theirs);
        *lock!(self.hold_time) = negotiated;

        let remote_id = m.id;
        *lock!(s.remote_open) = Some(m);

        // Connection collision. The peer's identifier is the same on both
        // connections, so one OPEN is enough to resolve it.
        if let Some(other) = self.other_session(&s) {
            let winner = match collision_resolution(self.id, remote_id) {
                CollisionOutcome::KeepActive => ConnectionDirection::Outbound,
                CollisionOutcome::KeepPassive => ConnectionDirection::Inbound,
            };
            info!(
                self.log,
                "connection collision: local id {} remote id {remote_id}, \
                 keeping {winner} connection",
                self.id
            );

            if s.direction() != winner {
                self.send_notification(
                    &s,
                    ErrorCode::Cease,
                    0,
                    "connection collision resolution",
                );
                self.detach_and_delete(&s);
                // Stay put until the winning connection sees its OPEN.
                return None;
            }
            self.send_notification(
                &other,
                ErrorCode::Cease,
                0,
                "connection collision resolution",
            );
            self.detach_and_delete(&other);
        }

        // If the peer's OPEN arrived before we sent ours on this
        // connection, send it now so both sides can confirm.
        if !s.open_sent() && self.send_open(&s).is_err() {
            return self.on_idle();
        }
        if self.send_keepalive(&s).is_err() {
            return self.on_idle();
        }
        Some(FsmState::OpenConfirm)
    }

    /// Initiate an outbound connection attempt. The new session occupies
    /// the active slot while the attempt is in flight.
    fn begin_connect(&self) {
        let (bind_addr, timeout) = {
            let session = lock!(self.session);
            // Bound the attempt well under the retry interval so a stuck
            // connect resolves before the next cycle begins.
            (session.bind_addr, session.connect_retry_time / 3)
        };
        let conn = Cnx::new(bind_addr, self.neighbor.host, self.log.clone());
        let session = Session::outbound(conn);
        *lock!(self.active_session) = Some(Arc::clone(&session));

        if let Err(e) =
            session.conn.connect(&session, self.event_tx.clone(), timeout)
        {
            warn!(self.log, "failed to initiate connection: {e}");
            // Deliver the failure through the queue so the retry path is
            // uniform with asynchronous connect failures.
            let ec = EventContainer::tracked(
                FsmEvent::Tcp(TcpEvent::ConnectFailed(Arc::clone(&session))),
                &session,
            );
            if let Err(e) = self.event_tx.send(ec) {
                warn!(self.log, "failed to post connect failure: {e}");
            }
        }
    }

    /// Bind an inbound connection into the passive slot and start its
    /// reader. Returns false (declining the connection) if the slot is
    /// taken or the reader cannot start.
    fn bind_passive(&self, s: &Arc<Session<Cnx>>) -> bool {
        {
            let mut slot = lock!(self.passive_session);
            if slot.is_some() {
                drop(slot);
                info!(
                    self.log,
                    "inbound connection from {} declined: passive slot taken",
                    s.peer()
                );
                self.counters
                    .passive_connections_declined
                    .fetch_add(1, Ordering::Relaxed);
                self.delete_session(Arc::clone(s));
                return false;
            }
            *slot = Some(Arc::clone(s));
        }
        if self.start_reader(s).is_err() {
            self.detach_and_delete(s);
            return false;
        }
        self.counters
            .passive_connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    fn start_reader(&self, s: &Arc<Session<Cnx>>) -> Result<(), Error> {
        s.conn
            .start_recv_loop(Arc::downgrade(s), self.event_tx.clone())
            .map_err(|e| {
                warn!(
                    self.log,
                    "failed to start reader for {}: {e}",
                    s.peer()
                );
                e
            })
    }

    // Session arbitration: the two slots below are the only place sessions
    // are tracked, and the delete pseudo event is the only way one is
    // released.

    /// True if the state machine still tracks `s` in either slot. This is
    /// the standard event validator.
    pub fn tracks(&self, s: &Arc<Session<Cnx>>) -> bool {
        let in_active = lock!(self.active_session)
            .as_ref()
            .map(|cur| Arc::ptr_eq(cur, s))
            .unwrap_or(false);
        if in_active {
            return true;
        }
        lock!(self.passive_session)
            .as_ref()
            .map(|cur| Arc::ptr_eq(cur, s))
            .unwrap_or(false)
    }

    fn tracked_sessions(&self) -> Vec<Arc<Session<Cnx>>> {
        let mut out = Vec::new();
        if let Some(s) = lock!(self.active_session).as_ref() {
            out.push(Arc::clone(s));
        }
        if let Some(s) = lock!(self.passive_session).as_ref() {
            out.push(Arc::clone(s));
        }
        out
    }

    fn session_count(&self) -> usize {
        self.tracked_sessions().len()
    }

    fn other_session(
        &self,
        s: &Arc<Session<Cnx>>,
    ) -> Option<Arc<Session<Cnx>>> {
        self.tracked_sessions()
            .into_iter()
            .find(|cur| !Arc::ptr_eq(cur, s))
    }

    /// Remove `s` from whichever slot holds it. Returns true if it was
    /// tracked.
    fn detach_session(&self, s: &Arc<Session<Cnx>>) -> bool {
        {
            let mut slot = lock!(self.active_session);
            if slot.as_ref().map(|cur| Arc::ptr_eq(cur, s)).unwrap_or(false)
            {
                slot.take();
                return true;
            }
        }
        let mut slot = lock!(self.passive_session);
        if slot.as_ref().map(|cur| Arc::ptr_eq(cur, s)).unwrap_or(false) {
            slot.take();
            return true;
        }
        false
    }

    fn detach_and_delete(&self, s: &Arc<Session<Cnx>>) {
        self.detach_session(s);
        self.delete_session(Arc::clone(s));
    }

    /// Submit a session for asynchronous deletion. The session must
    /// already be detached; once this is posted no further valid events can
    /// reference it. Submitting twice is a no-op.
    fn delete_session(&self, s: Arc<Session<Cnx>>) {
        s.mark_dead();
        if s.delete_submitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.counters.sessions_deleted.fetch_add(1, Ordering::Relaxed);
        let ec = EventContainer::new(FsmEvent::Tcp(TcpEvent::DeleteSession(
            Arc::clone(&s),
        )));
        if self.event_tx.send(ec).is_err() {
            // Queue is gone; reclaim inline.
            s.conn.close();
        }
    }

    /// Dispatch point for the delete pseudo event: close the transport and
    /// drop the final strong reference.
    fn dispatch_delete(&self, s: &Arc<Session<Cnx>>) {
        debug!(
            self.log,
            "deleting {} session for {}",
            s.direction(),
            s.peer()
        );
        s.conn.close();
    }

    /// Promote `winner` to the steady state session. Anything else still
    /// tracked is closed with a Cease notification and scheduled for
    /// deletion.
    fn assign_session(&self, winner: &Arc<Session<Cnx>>) {
        if let Some(other) = self.other_session(winner) {
            self.send_notification(
                &other,
                ErrorCode::Cease,
                0,
                "connection collision resolution",
            );
            self.detach_and_delete(&other);
        }
    }

    /// Detach and delete everything in both slots.
    fn teardown_sessions(&self) {
        let active = lock!(self.active_session).take();
        let passive = lock!(self.passive_session).take();
        for s in [active, passive].into_iter().flatten() {
            self.delete_session(s);
        }
    }

    // Uniform idle transitions.

    /// Standard drop to idle: tear down both sessions and grow the idle
    /// hold backoff. No notification is sent.
    fn on_idle(&self) -> Option<FsmState> {
        self.teardown_sessions();
        self.bump_idle_hold_time();
        Some(FsmState::Idle)
    }

    /// Drop to idle after sending a notification on the offending session.
    fn on_idle_error(
        &self,
        session: Option<&Arc<Session<Cnx>>>,
        code: ErrorCode,
        subcode: u8,
        reason: &str,
    ) -> Option<FsmState> {
        if let Some(s) = session {
            self.send_notification(s, code, subcode, reason);
        }
        self.on_idle()
    }

    /// The peer sent us a notification on `s`. Record it; nothing is sent
    /// back. If `s` carried the handshake (or was the last connection
    /// standing) the machine drops to idle; a notification on the losing
    /// half of a collision only takes that connection down.
    fn on_notification(
        &self,
        s: &Arc<Session<Cnx>>,
        m: &NotificationMessage,
    ) -> Option<FsmState> {
        self.counters
            .notifications_received
            .fetch_add(1, Ordering::Relaxed);
        warn!(self.log, "peer sent notification {m} on {}", s.direction());
        *lock!(self.last_notification_in) = Some(NotificationRecord::new(
            m.error_code,
            m.error_subcode,
            &m.reason(),
        ));
        if s.open_received() {
            return self.on_idle();
        }
        self.detach_and_delete(s);
        if self.session_count() == 0 {
            self.on_idle()
        } else {
            None
        }
    }

    fn on_hold_expired(&self) -> Option<FsmState> {
        self.counters
            .hold_timer_expirations
            .fetch_add(1, Ordering::Relaxed);
        for s in self.tracked_sessions() {
            self.send_notification(
                &s,
                ErrorCode::HoldTimerExpired,
                0,
                "hold timer expired",
            );
        }
        self.on_idle()
    }

    /// An event with no transition for the current state. In idle these
    /// are simply dropped; anywhere else they are a state machine error.
    fn on_stray(
        &self,
        event: &FsmEvent<Cnx>,
        state: FsmState,
    ) -> Option<FsmState> {
        self.counters.stray_events.fetch_add(1, Ordering::Relaxed);
        warn!(
            self.log,
            "unexpected fsm event {} in {state}",
            event.title()
        );
        let session = event.session().map(Arc::clone);
        self.on_idle_error(
            session.as_ref(),
            ErrorCode::Fsm,
            0,
            "unexpected event for state",
        )
    }

    fn bump_idle_hold_time(&self) {
        let (initial, max) = {
            let session = lock!(self.session);
            (session.idle_hold_time, session.max_idle_hold_time)
        };
        let mut current = lock!(self.idle_hold_time);
        *current = next_idle_hold_time(*current, initial, max);
    }

    // State entry.

    /// Commit a transition and run the new state's entry actions. Also used
    /// to re-enter the current state when its entry actions need to run
    /// again.
    fn transition(&self, next: FsmState, why: &str) {
        let previous = {
            let mut state = lock!(self.state);
            let previous = *state;
            if previous != next {
                *lock!(self.last_state) = previous;
                *state = next;
            }
            previous
        };
        if previous != next {
            *lock!(self.last_state_change) = Utc::now();
            info!(self.log, "fsm transition {previous} -> {next} on {why}");
            self.bump_transition_counter(next);
        }
        self.enter(next);
    }

    fn enter(&self, state: FsmState) {
        let timers = &self.clock.timers;
        match state {
            FsmState::Idle => {
                timers.connect.cancel();
                timers.open.cancel();
                timers.hold.cancel();
                self.reset_hold_time();
                let idle_hold = self.idle_hold_time();
                if self.started() && !self.admin_down() && !self.deleted() {
                    if idle_hold.is_zero() {
                        // Damping disabled; move straight out of idle.
                        timers.idle_hold.cancel();
                        self.transition(FsmState::Active, "idle hold disabled");
                        return;
                    }
                    timers.idle_hold.start(idle_hold);
                } else {
                    timers.idle_hold.cancel();
                }
            }
            FsmState::Active | FsmState::Connect => {
                timers.open.cancel();
                timers.hold.cancel();
                timers.idle_hold.cancel();
                timers
                    .connect
                    .start(lock!(self.session).connect_retry_time);
            }
            FsmState::OpenSent => {
                timers.connect.cancel();
                timers.open.cancel();
                timers.idle_hold.cancel();
                timers.hold.start(OPEN_SENT_HOLD_TIME);
            }
            FsmState::OpenConfirm => {
                timers.connect.cancel();
                timers.open.cancel();
                self.restart_hold_timer();
            }
            FsmState::Established => {
                timers.connect.cancel();
                timers.open.cancel();
                *lock!(self.idle_hold_time) = Duration::ZERO;
                self.restart_hold_timer();
            }
        }
    }

    fn bump_transition_counter(&self, state: FsmState) {
        let counter = match state {
            FsmState::Idle => &self.counters.transitions_to_idle,
            FsmState::Active => &self.counters.transitions_to_active,
            FsmState::Connect => &self.counters.transitions_to_connect,
            FsmState::OpenSent => &self.counters.transitions_to_open_sent,
            FsmState::OpenConfirm => {
                &self.counters.transitions_to_open_confirm
            }
            FsmState::Established => {
                &self.counters.transitions_to_established
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm the hold timer with the hold time currently in effect. A
    /// negotiated hold time of zero disables it.
    fn restart_hold_timer(&self) {
        let hold = self.hold_time();
        if hold.is_zero() {
            self.clock.timers.hold.cancel();
        } else {
            self.clock.timers.hold.start(hold);
        }
    }

    // Message transmission.

    fn send_open(&self, s: &Arc<Session<Cnx>>) -> Result<(), Error> {
        let hold = lock!(self.session).hold_time.as_secs().min(u64::from(
            u16::MAX,
        )) as u16;
        let m = match self.asn {
            Asn::TwoOctet(asn) => OpenMessage::new2(asn, hold, self.id),
            Asn::FourOctet(asn) => OpenMessage::new4(asn, hold, self.id),
        };
        if let Err(e) = s.conn.send(m.into()) {
            warn!(self.log, "failed to send open on {}: {e}", s.peer());
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        s.set_open_sent();
        self.counters.opens_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_keepalive(&self, s: &Arc<Session<Cnx>>) -> Result<(), Error> {
        if let Err(e) = s.conn.send(Message::KeepAlive) {
            warn!(self.log, "failed to send keepalive on {}: {e}", s.peer());
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a notification on `s` and record it as the last outbound
    /// notification. The record is kept even if the write fails; the
    /// session is going away either way and the record is what
    /// observability reports.
    fn send_notification(
        &self,
        s: &Arc<Session<Cnx>>,
        code: ErrorCode,
        subcode: u8,
        reason: &str,
    ) {
        info!(
            self.log,
            "sending notification {code:?}/{subcode} to {}: {reason}",
            s.peer()
        );
        *lock!(self.last_notification_out) =
            Some(NotificationRecord::new(code, subcode, reason));
        self.counters
            .notifications_sent
            .fetch_add(1, Ordering::Relaxed);

        let mut m = NotificationMessage::new(code, subcode);
        m.data = reason.as_bytes().to_vec();
        if let Err(e) = s.conn.send(m.into()) {
            warn!(
                self.log,
                "failed to send notification on {}: {e}",
                s.peer()
            );
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_shutdown(&self) {
        info!(self.log, "session runner shutdown start");
        self.clock.timers.cancel_all();
        let active = lock!(self.active_session).take();
        let passive = lock!(self.passive_session).take();
        for s in [active, passive].into_iter().flatten() {
            // The queue is no longer draining, so reclaim inline rather
            // than through the delete pseudo event.
            s.mark_dead();
            s.conn.close();
        }
        *lock!(self.state) = FsmState::Idle;
        self.running.store(false, Ordering::Release);
        info!(self.log, "session runner shutdown complete");
    }

    // Observability.

    pub fn state(&self) -> FsmState {
        *lock!(self.state)
    }

    pub fn last_state(&self) -> FsmState {
        *lock!(self.last_state)
    }

    pub fn last_event(&self) -> String {
        lock!(self.last_event).clone()
    }

    pub fn last_state_change_at(&self) -> DateTime<Utc> {
        *lock!(self.last_state_change)
    }

    /// The hold time in effect: configured until an OPEN exchange
    /// negotiates it.
    pub fn hold_time(&self) -> Duration {
        *lock!(self.hold_time)
    }

    /// Reset the hold time to the configured proposal, discarding any
    /// negotiated value. Runs on every drop to idle so the next OPEN
    /// exchange starts from configuration.
    pub fn reset_hold_time(&self) {
        *lock!(self.hold_time) = lock!(self.session).hold_time;
    }

    /// The current idle hold backoff. Zero immediately after a clean
    /// transition to established.
    pub fn idle_hold_time(&self) -> Duration {
        *lock!(self.idle_hold_time)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn active_session(&self) -> Option<Arc<Session<Cnx>>> {
        lock!(self.active_session).clone()
    }

    pub fn passive_session(&self) -> Option<Arc<Session<Cnx>>> {
        lock!(self.passive_session).clone()
    }

    pub fn last_notification_in(&self) -> Option<NotificationRecord> {
        lock!(self.last_notification_in).clone()
    }

    pub fn last_notification_out(&self) -> Option<NotificationRecord> {
        lock!(self.last_notification_out).clone()
    }

    /// Clear the last event and notification records.
    pub fn reset_last_info(&self) {
        lock!(self.last_event).clear();
        *lock!(self.last_notification_in) = None;
        *lock!(self.last_notification_out) = None;
    }

    pub fn admin_down(&self) -> bool {
        self.admin_down.load(Ordering::Acquire)
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Check the structural invariants that must hold after every step.
    pub fn check_invariants(&self) -> bool {
        let state = self.state();
        let timers = &self.clock.timers;

        let active = lock!(self.active_session).is_some();
        let passive = lock!(self.passive_session).is_some();

        // Established rides on exactly one connection; idle and active
        // track none.
        match state {
            FsmState::Established => {
                if !(active ^ passive) {
                    return false;
                }
            }
            FsmState::Idle | FsmState::Active => {
                if active || passive {
                    return false;
                }
            }
            _ => {}
        }

        // The hold timer runs exactly while an OPEN exchange is underway
        // or complete (unless negotiation disabled it).
        let hold_expected = match state {
            FsmState::OpenSent => true,
            FsmState::OpenConfirm | FsmState::Established => {
                !self.hold_time().is_zero()
            }
            _ => false,
        };
        if timers.hold.is_running() != hold_expected {
            return false;
        }

        // The connect retry timer only runs while we are trying to reach
        // the peer.
        if timers.connect.is_running()
            && !matches!(state, FsmState::Active | FsmState::Connect)
        {
            return false;
        }

        // The idle hold timer only runs while idle and not disabled.
        if timers.idle_hold.is_running()
            && (state != FsmState::Idle || self.admin_down())
        {
            return false;
        }

        true
    }
}
