// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::BgpConnection;
use crate::lock;
use crate::session::{EventContainer, EventValidator, FsmEvent, TimerExpiry};
use rand::Rng;
use slog::{trace, Logger};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

/// The four timers that drive a peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Paces outbound connection attempts.
    ConnectRetry,

    /// Bounds how long a passive connection may sit without an OPEN from
    /// the peer before we send ours.
    Open,

    /// How long a session may go without hearing from the peer before it
    /// is declared dead.
    Hold,

    /// How long a peer is damped in idle before the next start attempt.
    IdleHold,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRetry => "connect retry",
            Self::Open => "open",
            Self::Hold => "hold",
            Self::IdleHold => "idle hold",
        }
    }
}

pub struct ClockTimers {
    pub connect: Timer,
    pub open: Timer,
    pub hold: Timer,
    pub idle_hold: Timer,
}

impl ClockTimers {
    pub fn get(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::ConnectRetry => &self.connect,
            TimerKind::Open => &self.open,
            TimerKind::Hold => &self.hold,
            TimerKind::IdleHold => &self.idle_hold,
        }
    }

    /// Cancel every timer. Used on teardown.
    pub fn cancel_all(&self) {
        self.connect.cancel();
        self.open.cancel();
        self.hold.cancel();
        self.idle_hold.cancel();
    }
}

/// Drives the timer set for one peer. A background thread ticks each timer
/// at the configured resolution and converts expirations into queued state
/// machine events. Expirations never touch state machine internals
/// directly; the generation captured at fire time lets the consumer discard
/// an expiry that raced with a cancel or restart.
pub struct Clock {
    pub resolution: Duration,
    pub timers: Arc<ClockTimers>,
    pub join_handle: Arc<JoinHandle<()>>,

    shutdown: Arc<AtomicBool>,
}

impl Clock {
    pub fn new<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        connect_jitter: Option<(f64, f64)>,
        idle_hold_jitter: Option<(f64, f64)>,
        s: Sender<EventContainer<Cnx>>,
        log: Logger,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let timers = Arc::new(ClockTimers {
            connect: Timer::new("connect", connect_jitter),
            open: Timer::new("open", None),
            hold: Timer::new("hold", None),
            idle_hold: Timer::new("idle_hold", idle_hold_jitter),
        });
        let join_handle = Arc::new(Self::run(
            resolution,
            timers.clone(),
            s,
            shutdown.clone(),
            log,
        ));
        Self {
            resolution,
            timers,
            join_handle,
            shutdown,
        }
    }

    fn run<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        timers: Arc<ClockTimers>,
        s: Sender<EventContainer<Cnx>>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) -> JoinHandle<()> {
        spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            Self::step_all(resolution, &timers, &s, &log);
            sleep(resolution);
        })
    }

    fn step_all<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        timers: &Arc<ClockTimers>,
        s: &Sender<EventContainer<Cnx>>,
        log: &Logger,
    ) {
        for kind in [
            TimerKind::ConnectRetry,
            TimerKind::Open,
            TimerKind::Hold,
            TimerKind::IdleHold,
        ] {
            Self::step(resolution, timers, kind, s, log);
        }
    }

    fn step<Cnx: BgpConnection + 'static>(
        resolution: Duration,
        timers: &Arc<ClockTimers>,
        kind: TimerKind,
        s: &Sender<EventContainer<Cnx>>,
        log: &Logger,
    ) {
        let t = timers.get(kind);
        // Generation is sampled before the tick: if the consumer rearms the
        // timer between the sample and dispatch, validation rejects this
        // expiry rather than mistaking it for the new arming's.
        let generation = t.generation();
        if !t.tick(resolution) {
            return;
        }
        let tm = Arc::clone(timers);
        let validate: EventValidator<Cnx> =
            Box::new(move |_| tm.get(kind).generation() == generation);
        let ec = EventContainer::validated(
            FsmEvent::Timer(TimerExpiry { kind, generation }),
            validate,
        );
        if let Err(e) = s.send(ec) {
            // The state machine has shut down; nothing left to notify.
            trace!(log, "drop {} timer expiry: {e}", kind.as_str());
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerState {
    enabled: bool,
    interval: Duration,
    remaining: Duration,
}

/// A one-shot countdown timer. Start arms the timer for a duration, cancel
/// disarms it, and both advance the generation counter so an expiry event
/// already in flight no longer validates.
pub struct Timer {
    name: &'static str,

    /// When set, the duration passed to `start` is scaled by a random
    /// factor drawn from this range to keep peers from synchronizing.
    jitter: Option<(f64, f64)>,

    state: Mutex<TimerState>,
    generation: AtomicU64,
}

impl Timer {
    pub fn new(name: &'static str, jitter: Option<(f64, f64)>) -> Self {
        Self {
            name,
            jitter,
            state: Mutex::new(TimerState {
                enabled: false,
                interval: Duration::ZERO,
                remaining: Duration::ZERO,
            }),
            generation: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arm the timer for the given duration, applying jitter when
    /// configured. Restarting a running timer invalidates any expiry event
    /// the previous arming produced.
    pub fn start(&self, interval: Duration) {
        let interval = match self.jitter {
            Some((lo, hi)) => {
                interval.mul_f64(rand::thread_rng().gen_range(lo..=hi))
            }
            None => interval,
        };
        let mut state = lock!(self.state);
        state.enabled = true;
        state.interval = interval;
        state.remaining = interval;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Disarm the timer. Idempotent. An expiry event already posted will
    /// fail generation validation.
    pub fn cancel(&self) {
        lock!(self.state).enabled = false;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        lock!(self.state).enabled
    }

    /// The interval the timer was last armed with, after jitter.
    pub fn interval(&self) -> Duration {
        lock!(self.state).interval
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Advance the timer by one resolution step. Returns true exactly once
    /// per arming, at the tick the countdown reaches zero; the timer
    /// disarms itself at that point.
    fn tick(&self, resolution: Duration) -> bool {
        let mut state = lock!(self.state);
        if !state.enabled {
            return false;
        }
        state.remaining = state.remaining.saturating_sub(resolution);
        if state.remaining.is_zero() {
            state.enabled = false;
            return true;
        }
        false
    }
}
