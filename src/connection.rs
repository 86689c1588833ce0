// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::Message;
use crate::session::{EventContainer, Session};
use slog::Logger;
use std::fmt::{self, Display, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Which side initiated the underlying transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,

    /// The peer initiated the connection and we accepted it.
    Inbound,
}

impl Display for ConnectionDirection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

/// Listens for inbound connections from peers.
pub trait BgpListener<Cnx: BgpConnection> {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error>
    where
        Self: Sized;

    /// Accept one inbound connection, waiting at most `timeout`.
    fn accept(&self, log: Logger, timeout: Duration) -> Result<Cnx, Error>;
}

/// One message-passing connection to a peer. Implementations never call
/// into the state machine directly; anything that happens on a connection
/// is reported by posting an event to the queue handed in at connect or
/// receive-loop start time.
pub trait BgpConnection: Send + Sync + 'static {
    fn new(source: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self
    where
        Self: Sized;

    /// Begin an outbound connection attempt. Completion is reported by
    /// posting a connected or connect-failed event for `session`. An error
    /// return means the attempt could not be started at all; no event is
    /// posted in that case.
    fn connect(
        &self,
        session: &Arc<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
        timeout: Duration,
    ) -> Result<(), Error>
    where
        Self: Sized;

    /// Start the reader for this connection. Inbound traffic is parsed and
    /// posted as message events referencing `session`; parse failures and
    /// connection loss are posted the same way. The reader holds only a
    /// weak reference and exits once the session has been dropped.
    fn start_recv_loop(
        &self,
        session: Weak<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
    ) -> Result<(), Error>
    where
        Self: Sized;

    /// Send a message to the peer. This is a non-blocking write into the
    /// transport's buffer.
    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Close the connection. Idempotent. The reader observes the closure
    /// and exits.
    fn close(&self);

    fn peer(&self) -> SocketAddr;

    fn local(&self) -> Option<SocketAddr>;
}
