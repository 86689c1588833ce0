// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End to end scenarios for the peer state machine, run over the simulated
//! channel network. One side is a real state machine; where the scenario
//! needs precise control over ordering, the test plays the remote peer by
//! hand on raw endpoints.

use crate::clock::TimerKind;
use crate::config::RouterConfig;
use crate::connection_channel::{
    channel, listen, BgpConnectionChannel, BgpListenerChannel, Endpoint,
};
use crate::connection::{BgpConnection, ConnectionDirection};
use crate::connection_tcp::{BgpConnectionTcp, BgpListenerTcp};
use crate::dispatcher::Dispatcher;
use crate::messages::{
    Asn, ErrorCode, Message, NotificationMessage, OpenMessage, Prefix,
    UpdateMessage,
};
use crate::session::{
    AdminEvent, EventContainer, FsmEvent, FsmState, NeighborInfo,
    SessionInfo, SessionRunner, TcpEvent, TimerExpiry,
};
use slog::Logger;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

type Runner = SessionRunner<BgpConnectionChannel>;

/// Poll an expression until it equals the expected value or a few seconds
/// pass, then assert.
macro_rules! wait_for_eq {
    ($lhs:expr, $rhs:expr) => {{
        let mut ok = false;
        for _ in 0..400 {
            if $lhs == $rhs {
                ok = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        if !ok {
            assert_eq!($lhs, $rhs);
        }
    }};
}

fn fast_config() -> SessionInfo {
    SessionInfo {
        connect_retry_time: Duration::from_millis(100),
        idle_hold_time: Duration::from_millis(100),
        // Long enough that the session cannot hold-expire mid-test; no
        // keepalives flow once the handshake completes.
        hold_time: Duration::from_secs(60),
        resolution: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Configuration for scenarios that drive every timer event by hand: the
/// clock thread ticks so slowly it never interferes.
fn manual_clock_config() -> SessionInfo {
    SessionInfo {
        resolution: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn spawn_runner<Cnx: BgpConnection>(
    log: &Logger,
    local: &str,
    peer: &str,
    id: u32,
    asn: u32,
    mut info: SessionInfo,
) -> (Arc<SessionRunner<Cnx>>, Receiver<UpdateMessage>) {
    let (event_tx, event_rx) = mpsc::channel();
    let (update_tx, update_rx) = mpsc::channel();
    info.bind_addr = Some(local.parse().unwrap());
    let router = RouterConfig {
        asn: Asn::FourOctet(asn),
        id,
    };
    let neighbor = NeighborInfo {
        name: format!("peer-{id}"),
        host: peer.parse().unwrap(),
    };
    let runner = Arc::new(SessionRunner::new(
        info,
        neighbor,
        router.asn,
        router.id,
        event_rx,
        event_tx,
        update_tx,
        log.clone(),
    ));
    let r = Arc::clone(&runner);
    spawn(move || r.start());
    (runner, update_rx)
}

fn post_timer(r: &Arc<Runner>, kind: TimerKind) {
    r.send_event(EventContainer::new(FsmEvent::Timer(TimerExpiry {
        kind,
        generation: 0,
    })))
    .unwrap();
}

fn recv_msg(ep: &Endpoint<Message>) -> Message {
    ep.rx
        .recv_timeout(Duration::from_secs(10))
        .expect("message from state machine")
}

/// Drive a runner from active into established over a hand-held passive
/// connection. Returns the test side endpoint.
fn establish_passive(
    log: &Logger,
    r: &Arc<Runner>,
    local: &str,
    peer: &str,
    peer_id: u32,
    peer_hold: u16,
) -> Endpoint<Message> {
    let (fsm_ep, test_ep) = channel();
    let conn = BgpConnectionChannel::with_conn(
        local.parse().unwrap(),
        peer.parse().unwrap(),
        fsm_ep,
        log.clone(),
    );
    r.passive_open(conn).unwrap();

    // Inbound connection in active: we send OPEN and move to open sent.
    match recv_msg(&test_ep) {
        Message::Open(_) => {}
        other => panic!("expected open, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenSent);

    test_ep
        .tx
        .send(Message::Open(OpenMessage::new4(65002, peer_hold, peer_id)))
        .unwrap();
    match recv_msg(&test_ep) {
        Message::KeepAlive => {}
        other => panic!("expected keepalive, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenConfirm);

    test_ep.tx.send(Message::KeepAlive).unwrap();
    wait_for_eq!(r.state(), FsmState::Established);
    test_ep
}

/// Two peers, each with a dispatcher and a full state machine, find each
/// other over the simulated network and establish. Whichever connection
/// wins the race (or the collision) carries the session.
#[test]
fn two_router_establishment() {
    let log = crate::log::init_logger();

    let r1_addr: SocketAddr = "1.0.0.1:179".parse().unwrap();
    let r2_addr: SocketAddr = "1.0.0.2:179".parse().unwrap();

    let (r1, _updates1) = spawn_runner(
        &log,
        "1.0.0.1:179",
        "1.0.0.2:179",
        1,
        4200000001,
        fast_config(),
    );
    let (r2, _updates2) = spawn_runner(
        &log,
        "1.0.0.2:179",
        "1.0.0.1:179",
        2,
        4200000002,
        fast_config(),
    );

    for (addr, runner, peer_ip) in
        [(r1_addr, &r1, r2_addr.ip()), (r2_addr, &r2, r1_addr.ip())]
    {
        let map = Arc::new(Mutex::new(
            [(peer_ip, runner.event_tx.clone())].into_iter().collect(),
        ));
        let dispatcher: Arc<Dispatcher<BgpConnectionChannel>> =
            Arc::new(Dispatcher::new(map, addr.to_string(), log.clone()));
        spawn(move || dispatcher.run::<BgpListenerChannel>());
    }

    wait_for_eq!(r1.state(), FsmState::Established);
    wait_for_eq!(r2.state(), FsmState::Established);

    // Clean establishment resets the damping backoff and leaves the
    // negotiated hold timer running.
    assert_eq!(r1.idle_hold_time(), Duration::ZERO);
    assert_eq!(r2.idle_hold_time(), Duration::ZERO);
    assert_eq!(r1.hold_time(), Duration::from_secs(60));
    assert!(r1.clock.timers.hold.is_running());
    assert!(r2.clock.timers.hold.is_running());

    // Taking the peer administratively down tears the session back to
    // idle and keeps it there.
    r1.set_admin_state(true).unwrap();
    wait_for_eq!(r1.state(), FsmState::Idle);
    assert!(!r1.clock.timers.idle_hold.is_running());

    r1.shutdown();
    r2.shutdown();
}

/// The same establishment flow over real sockets: loopback TCP transport,
/// wire-format framing and all.
#[test]
fn two_router_establishment_over_tcp() {
    let log = crate::log::init_logger();

    let r1_addr: SocketAddr = "127.0.0.1:23179".parse().unwrap();
    let r2_addr: SocketAddr = "127.0.0.1:23180".parse().unwrap();

    let (r1, _updates1): (Arc<SessionRunner<BgpConnectionTcp>>, _) =
        spawn_runner(
            &log,
            "127.0.0.1:23179",
            "127.0.0.1:23180",
            1,
            4200000001,
            fast_config(),
        );
    let (r2, _updates2): (Arc<SessionRunner<BgpConnectionTcp>>, _) =
        spawn_runner(
            &log,
            "127.0.0.1:23180",
            "127.0.0.1:23179",
            2,
            4200000002,
            fast_config(),
        );

    for (addr, runner, peer_ip) in
        [(r1_addr, &r1, r2_addr.ip()), (r2_addr, &r2, r1_addr.ip())]
    {
        let map = Arc::new(Mutex::new(
            [(peer_ip, runner.event_tx.clone())].into_iter().collect(),
        ));
        let dispatcher: Arc<Dispatcher<BgpConnectionTcp>> =
            Arc::new(Dispatcher::new(map, addr.to_string(), log.clone()));
        spawn(move || dispatcher.run::<BgpListenerTcp>());
    }

    wait_for_eq!(r1.state(), FsmState::Established);
    wait_for_eq!(r2.state(), FsmState::Established);
    assert_eq!(r1.idle_hold_time(), Duration::ZERO);
    assert_eq!(r2.idle_hold_time(), Duration::ZERO);

    r1.shutdown();
    r2.shutdown();
}

/// Simultaneous connections with the higher identifier on our side: the
/// connection we initiated survives and the inbound one is closed with
/// Cease.
#[test]
fn collision_local_wins() {
    let log = crate::log::init_logger();
    let (r, _updates) = spawn_runner(
        &log,
        "2.0.0.1:179",
        "2.0.0.2:179",
        10,
        65001,
        manual_clock_config(),
    );
    let listener = listen("2.0.0.2:179".parse().unwrap());

    r.manual_start().unwrap();
    wait_for_eq!(r.state(), FsmState::Active);

    // Trigger the outbound attempt and play the accepting side.
    post_timer(&r, TimerKind::ConnectRetry);
    let (_from, active_ep) =
        listener.accept(Duration::from_secs(10)).unwrap();
    match recv_msg(&active_ep) {
        Message::Open(m) => assert_eq!(m.id, 10),
        other => panic!("expected open, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenSent);

    // The peer dials in at the same time.
    let (fsm_ep, passive_ep) = channel();
    let conn = BgpConnectionChannel::with_conn(
        "2.0.0.1:179".parse().unwrap(),
        "2.0.0.2:179".parse().unwrap(),
        fsm_ep,
        log.clone(),
    );
    r.passive_open(conn).unwrap();
    match recv_msg(&passive_ep) {
        Message::Open(m) => assert_eq!(m.id, 10),
        other => panic!("expected open, got {other:?}"),
    }

    // The peer's OPEN on the inbound connection resolves the collision:
    // our identifier is higher, so the inbound connection loses.
    passive_ep
        .tx
        .send(Message::Open(OpenMessage::new4(65002, 90, 5)))
        .unwrap();
    match recv_msg(&passive_ep) {
        Message::Notification(NotificationMessage {
            error_code: ErrorCode::Cease,
            ..
        }) => {}
        other => panic!("expected cease, got {other:?}"),
    }
    wait_for_eq!(r.passive_session().is_none(), true);
    assert_eq!(r.state(), FsmState::OpenSent);

    // The surviving outbound connection completes the handshake.
    active_ep
        .tx
        .send(Message::Open(OpenMessage::new4(65002, 90, 5)))
        .unwrap();
    match recv_msg(&active_ep) {
        Message::KeepAlive => {}
        other => panic!("expected keepalive, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenConfirm);

    active_ep.tx.send(Message::KeepAlive).unwrap();
    wait_for_eq!(r.state(), FsmState::Established);

    let survivor = r.active_session().expect("outbound session survives");
    assert_eq!(survivor.direction(), ConnectionDirection::Outbound);
    assert_eq!(r.idle_hold_time(), Duration::ZERO);

    r.shutdown();
}

/// Simultaneous connections with the higher identifier on the peer's side:
/// our outbound connection is closed with Cease and the inbound one
/// carries the session.
#[test]
fn collision_peer_wins() {
    let log = crate::log::init_logger();
    let (r, _updates) = spawn_runner(
        &log,
        "2.0.1.1:179",
        "2.0.1.2:179",
        3,
        65001,
        manual_clock_config(),
    );
    let listener = listen("2.0.1.2:179".parse().unwrap());

    r.manual_start().unwrap();
    wait_for_eq!(r.state(), FsmState::Active);

    post_timer(&r, TimerKind::ConnectRetry);
    let (_from, active_ep) =
        listener.accept(Duration::from_secs(10)).unwrap();
    match recv_msg(&active_ep) {
        Message::Open(m) => assert_eq!(m.id, 3),
        other => panic!("expected open, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenSent);

    let (fsm_ep, passive_ep) = channel();
    let conn = BgpConnectionChannel::with_conn(
        "2.0.1.1:179".parse().unwrap(),
        "2.0.1.2:179".parse().unwrap(),
        fsm_ep,
        log.clone(),
    );
    r.passive_open(conn).unwrap();
    match recv_msg(&passive_ep) {
        Message::Open(_) => {}
        other => panic!("expected open, got {other:?}"),
    }

    // The peer's OPEN arrives on our outbound connection first. Their
    // identifier is higher, so our outbound connection loses.
    active_ep
        .tx
        .send(Message::Open(OpenMessage::new4(65002, 90, 7)))
        .unwrap();
    match recv_msg(&active_ep) {
        Message::Notification(NotificationMessage {
            error_code: ErrorCode::Cease,
            ..
        }) => {}
        other => panic!("expected cease, got {other:?}"),
    }
    wait_for_eq!(r.active_session().is_none(), true);
    assert_eq!(r.state(), FsmState::OpenSent);

    passive_ep
        .tx
        .send(Message::Open(OpenMessage::new4(65002, 90, 7)))
        .unwrap();
    match recv_msg(&passive_ep) {
        Message::KeepAlive => {}
        other => panic!("expected keepalive, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::OpenConfirm);

    passive_ep.tx.send(Message::KeepAlive).unwrap();
    wait_for_eq!(r.state(), FsmState::Established);

    let survivor = r.passive_session().expect("inbound session survives");
    assert_eq!(survivor.direction(), ConnectionDirection::Inbound);

    r.shutdown();
}

/// A silent peer trips the hold timer: a hold-timer-expired notification
/// goes out, the machine drops to idle and the damping backoff begins at
/// its initial value.
#[test]
fn hold_timer_expiry_in_established() {
    let log = crate::log::init_logger();
    let mut info = manual_clock_config();
    info.hold_time = Duration::from_secs(30);
    let (r, updates) = spawn_runner(
        &log,
        "2.0.2.1:179",
        "2.0.2.2:179",
        1,
        65001,
        info,
    );

    r.manual_start().unwrap();
    wait_for_eq!(r.state(), FsmState::Active);
    let test_ep =
        establish_passive(&log, &r, "2.0.2.1:179", "2.0.2.2:179", 2, 30);

    // Negotiated hold is min(ours, theirs) and the timer runs at exactly
    // that interval.
    assert_eq!(r.hold_time(), Duration::from_secs(30));
    assert!(r.clock.timers.hold.is_running());
    assert_eq!(
        r.clock.timers.hold.interval(),
        Duration::from_secs(30)
    );

    // An update refreshes the hold timer and is forwarded to the route
    // processing sink.
    test_ep
        .tx
        .send(Message::Update(UpdateMessage {
            withdrawn: vec![],
            path_attributes: vec![],
            nlri: vec![Prefix {
                length: 24,
                value: vec![10, 0, 0],
            }],
        }))
        .unwrap();
    let forwarded = updates
        .recv_timeout(Duration::from_secs(10))
        .expect("update forwarded upward");
    assert_eq!(forwarded.nlri.len(), 1);

    // Silence from the peer: the hold timer fires.
    post_timer(&r, TimerKind::Hold);
    match recv_msg(&test_ep) {
        Message::Notification(n) => {
            assert_eq!(n.error_code, ErrorCode::HoldTimerExpired);
            assert_eq!(n.error_subcode, 0);
        }
        other => panic!("expected notification, got {other:?}"),
    }
    wait_for_eq!(r.state(), FsmState::Idle);
    assert_eq!(r.idle_hold_time(), Duration::from_millis(5_000));
    assert_eq!(r.last_state(), FsmState::Established);
    assert_eq!(r.last_event(), "hold timer expires");

    let out = r.last_notification_out().expect("notification recorded");
    assert_eq!(out.code, ErrorCode::HoldTimerExpired as u8);
    assert_eq!(out.subcode, 0);

    r.shutdown();
}

/// A failed outbound attempt returns the machine to active with the
/// attempt counted and the retry timer rearmed at a jittered interval.
#[test]
fn connect_retry_on_failure() {
    let log = crate::log::init_logger();
    // No listener is bound at the peer address, so the attempt fails
    // immediately.
    let (r, _updates) = spawn_runner(
        &log,
        "2.0.3.1:179",
        "2.0.3.2:179",
        1,
        65001,
        manual_clock_config(),
    );

    r.manual_start().unwrap();
    wait_for_eq!(r.state(), FsmState::Active);

    post_timer(&r, TimerKind::ConnectRetry);
    wait_for_eq!(r.connect_attempts(), 1);
    wait_for_eq!(r.state(), FsmState::Active);

    assert!(r.clock.timers.connect.is_running());
    let interval = r.clock.timers.connect.interval();
    assert!(interval >= Duration::from_secs(27), "{interval:?}");
    assert!(interval <= Duration::from_secs(30), "{interval:?}");

    r.shutdown();
}

/// An event referencing a session the machine has already torn down is
/// rejected by its validator and leaves the machine untouched.
#[test]
fn stale_session_event_after_delete() {
    let log = crate::log::init_logger();
    let (r, _updates) = spawn_runner(
        &log,
        "2.0.4.1:179",
        "2.0.4.2:179",
        1,
        65001,
        manual_clock_config(),
    );

    r.manual_start().unwrap();
    wait_for_eq!(r.state(), FsmState::Active);

    let (fsm_ep, _test_ep) = channel();
    let conn = BgpConnectionChannel::with_conn(
        "2.0.4.1:179".parse().unwrap(),
        "2.0.4.2:179".parse().unwrap(),
        fsm_ep,
        log.clone(),
    );
    let session = r.passive_open(conn).unwrap();
    wait_for_eq!(r.state(), FsmState::OpenSent);

    // Stop tears the session down through the delete pseudo event.
    r.manual_stop().unwrap();
    wait_for_eq!(r.state(), FsmState::Idle);
    wait_for_eq!(session.is_alive(), false);

    // A close event for the torn down session is validated out.
    let discarded_before =
        r.counters.events_discarded.load(Ordering::Relaxed);
    r.send_event(EventContainer::tracked(
        FsmEvent::Tcp(TcpEvent::Closed(Arc::clone(&session))),
        &session,
    ))
    .unwrap();
    wait_for_eq!(
        r.counters.events_discarded.load(Ordering::Relaxed),
        discarded_before + 1
    );
    assert_eq!(r.state(), FsmState::Idle);

    r.shutdown();
}

/// After shutdown the queue is dead: posted events are silently dropped.
#[test]
fn events_after_shutdown_are_dropped() {
    let log = crate::log::init_logger();
    let (r, _updates): (Arc<Runner>, _) = spawn_runner(
        &log,
        "2.0.5.1:179",
        "2.0.5.2:179",
        1,
        65001,
        manual_clock_config(),
    );
    wait_for_eq!(r.state(), FsmState::Idle);

    r.shutdown();
    wait_for_eq!(r.deleted(), true);

    r.send_event(EventContainer::new(FsmEvent::Admin(AdminEvent::Start)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(r.state(), FsmState::Idle);
}
