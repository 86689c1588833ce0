// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, BgpListener};
use crate::error::Error;
use crate::lock;
use crate::session::{EventContainer, FsmEvent, Session, TcpEvent};
use crate::to_canonical;
use slog::{debug, error, Logger};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Accepts inbound connections and fans them into the event queue of the
/// peer they belong to. Connections from unconfigured addresses are
/// refused. This is the only path by which a passive session reaches a
/// state machine.
pub struct Dispatcher<Cnx: BgpConnection> {
    pub addr_to_session:
        Arc<Mutex<BTreeMap<IpAddr, Sender<EventContainer<Cnx>>>>>,
    shutdown: AtomicBool,
    listen: String,
    log: Logger,
}

impl<Cnx: BgpConnection> Dispatcher<Cnx> {
    pub fn new(
        addr_to_session: Arc<
            Mutex<BTreeMap<IpAddr, Sender<EventContainer<Cnx>>>>,
        >,
        listen: String,
        log: Logger,
    ) -> Self {
        Self {
            addr_to_session,
            listen,
            log,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn run<Listener: BgpListener<Cnx>>(&self) -> Result<(), Error> {
        let listener = Listener::bind(&self.listen)?;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.shutdown.store(false, Ordering::Release);
                return Ok(());
            }
            let conn = match listener
                .accept(self.log.clone(), Duration::from_millis(100))
            {
                Ok(c) => c,
                Err(Error::Timeout) => continue,
                Err(e) => {
                    error!(self.log, "accept: {e}");
                    continue;
                }
            };
            let addr = to_canonical(conn.peer().ip());
            match lock!(self.addr_to_session).get(&addr) {
                Some(tx) => {
                    let session = Session::inbound(conn);
                    if let Err(e) = tx.send(EventContainer::new(
                        FsmEvent::Tcp(TcpEvent::PassiveOpen(session)),
                    )) {
                        error!(
                            self.log,
                            "failed to send passive open to session: {e}"
                        );
                    }
                }
                None => {
                    debug!(
                        self.log,
                        "connection from unknown peer {addr}, refusing"
                    );
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
