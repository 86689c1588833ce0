// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// This file contains code for testing purposes only. Note that it's only
/// included in `lib.rs` with a `#[cfg(test)]` guard. The purpose of the
/// code in this file is to implement BgpListener and BgpConnection such
/// that the state machine in `session.rs` may be exercised rapidly over a
/// simulated network.
use crate::connection::{BgpConnection, BgpListener};
use crate::error::Error;
use crate::lock;
use crate::messages::Message;
use crate::session::{
    message_event, EventContainer, FsmEvent, Session, TcpEvent,
};
use slog::{debug, error, Logger};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, Weak};
use std::thread::spawn;
use std::time::Duration;

lazy_static! {
    static ref NET: Network = Network::new();
}

/// A simulated network that maps socket addresses to channels that can
/// deliver connections to listeners bound at those addresses.
pub struct Network {
    #[allow(clippy::type_complexity)]
    endpoints:
        Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint<Message>)>>>,
}

// NOTE: this is not designed to be a full fidelity TCP/IP drop in. It gives
// us enough functionality to pass messages between peers to test state
// machine transitions above connection tracking. That's all we're aiming
// for with this.
impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Bind to the specified address and return a listener.
    fn bind(&self, sa: SocketAddr) -> Listener {
        let (tx, rx) = std::sync::mpsc::channel();
        lock!(self.endpoints).insert(sa, tx);
        Listener { rx }
    }

    /// Deliver `ep` to the listener at the `to` address, along with our
    /// `from` address, so the two sides can exchange messages.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        ep: Endpoint<Message>,
    ) -> Result<(), Error> {
        match lock!(self.endpoints).get(&to) {
            None => Err(Error::ChannelConnect),
            Some(sender) => sender
                .send((from, ep))
                .map_err(|e| Error::ChannelSend(e.to_string())),
        }
    }
}

/// Bind a raw listener on the simulated network. Lets tests play the role
/// of the remote peer without running a full state machine.
pub fn listen(sa: SocketAddr) -> Listener {
    NET.bind(sa)
}

/// A listener on the simulated network.
pub struct Listener {
    rx: Receiver<(SocketAddr, Endpoint<Message>)>,
}

impl Listener {
    pub fn accept(
        &self,
        timeout: Duration,
    ) -> Result<(SocketAddr, Endpoint<Message>), Error> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }
}

/// A struct to implement BgpListener for the simulated network.
pub struct BgpListenerChannel {
    listener: Listener,
    addr: SocketAddr,
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error>
    where
        Self: Sized,
    {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = NET.bind(addr);
        Ok(Self { listener, addr })
    }

    fn accept(
        &self,
        log: Logger,
        timeout: Duration,
    ) -> Result<BgpConnectionChannel, Error> {
        let (peer, endpoint) = self.listener.accept(timeout)?;
        Ok(BgpConnectionChannel::with_conn(self.addr, peer, endpoint, log))
    }
}

/// A struct to implement BgpConnection for the simulated network.
pub struct BgpConnectionChannel {
    addr: SocketAddr,
    peer: SocketAddr,
    conn_tx: Arc<Mutex<Option<Sender<Message>>>>,
    conn_rx: Mutex<Option<Receiver<Message>>>,
    log: Logger,
}

impl BgpConnection for BgpConnectionChannel {
    fn new(addr: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self {
        Self {
            addr: addr
                .expect("source address required for channel-based connection"),
            peer,
            conn_tx: Arc::new(Mutex::new(None)),
            conn_rx: Mutex::new(None),
            log,
        }
    }

    fn connect(
        &self,
        session: &Arc<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
        _timeout: Duration,
    ) -> Result<(), Error> {
        debug!(self.log, "[{}] connecting", self.peer);
        let (local, remote) = channel();
        NET.connect(self.addr, self.peer, remote)?;
        lock!(self.conn_tx).replace(local.tx);
        *lock!(self.conn_rx) = Some(local.rx);
        event_tx
            .send(EventContainer::tracked(
                FsmEvent::Tcp(TcpEvent::Connected(Arc::clone(session))),
                session,
            ))
            .map_err(|e| {
                Error::InternalCommunication(format!(
                    "fsm-send: connected: {e}"
                ))
            })
    }

    fn start_recv_loop(
        &self,
        session: Weak<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
    ) -> Result<(), Error> {
        let rx = lock!(self.conn_rx).take().ok_or(Error::NotConnected)?;
        let peer = self.peer;
        let log = self.log.clone();
        spawn(move || loop {
            match rx.recv() {
                Ok(msg) => {
                    let s = match session.upgrade() {
                        Some(s) => s,
                        None => break,
                    };
                    if !s.is_alive() {
                        break;
                    }
                    debug!(log, "[{peer}] recv: {}", msg.title());
                    if event_tx.send(message_event(&s, msg)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if let Some(s) = session.upgrade() {
                        debug!(log, "[{peer}] recv loop closed: {e}");
                        let ec = EventContainer::tracked(
                            FsmEvent::Tcp(TcpEvent::Closed(Arc::clone(&s))),
                            &s,
                        );
                        if let Err(e) = event_tx.send(ec) {
                            error!(
                                log,
                                "[{peer}] failed to post close event: {e}"
                            );
                        }
                    }
                    break;
                }
            }
        });
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        match *lock!(self.conn_tx) {
            Some(ref ch) => {
                ch.send(msg).map_err(|e| Error::ChannelSend(e.to_string()))
            }
            None => Err(Error::NotConnected),
        }
    }

    fn close(&self) {
        // Dropping the sender is our half-close; the remote reader sees a
        // disconnect and posts a close event on its side.
        lock!(self.conn_tx).take();
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

impl BgpConnectionChannel {
    pub fn with_conn(
        addr: SocketAddr,
        peer: SocketAddr,
        conn: Endpoint<Message>,
        log: Logger,
    ) -> Self {
        Self {
            addr,
            peer,
            conn_tx: Arc::new(Mutex::new(Some(conn.tx))),
            conn_rx: Mutex::new(Some(conn.rx)),
            log,
        }
    }
}

// BIDI

use std::sync::mpsc::{self, Receiver, Sender};

/// A combined (duplex) mpsc sender/receiver.
pub struct Endpoint<T> {
    pub rx: Receiver<T>,
    pub tx: Sender<T>,
}

impl<T> Endpoint<T> {
    fn new(rx: Receiver<T>, tx: Sender<T>) -> Self {
        Self { rx, tx }
    }
}

/// Analagous to std::sync::mpsc::channel for bidirectional endpoints.
pub fn channel<T>() -> (Endpoint<T>, Endpoint<T>) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (Endpoint::new(rx_a, tx_a), Endpoint::new(rx_b, tx_b))
}
