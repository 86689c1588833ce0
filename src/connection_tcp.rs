// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, BgpListener};
use crate::error::Error;
use crate::lock;
use crate::messages::{
    ErrorCode, Header, HeaderErrorSubcode, Message, MessageType,
    OpenErrorSubcode, ParseErrorContext, UpdateErrorSubcode, HEADER_LEN,
};
use crate::session::{
    message_event, parse_error_event, EventContainer, FsmEvent, Session,
    TcpEvent,
};
use crate::to_canonical;
use slog::{debug, warn, Logger};
use std::io::{ErrorKind, Read, Write};
use std::net::{
    Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
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
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, addr })
    }

    fn accept(
        &self,
        log: Logger,
        timeout: Duration,
    ) -> Result<BgpConnectionTcp, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((conn, mut peer)) => {
                    conn.set_nonblocking(false)?;
                    peer.set_ip(to_canonical(peer.ip()));
                    return Ok(BgpConnectionTcp::with_conn(
                        self.addr, peer, conn, log,
                    ));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

pub struct BgpConnectionTcp {
    source: Option<SocketAddr>,
    peer: SocketAddr,
    conn: Arc<Mutex<Option<TcpStream>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionTcp {
    fn new(source: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self {
        Self {
            source,
            peer,
            conn: Arc::new(Mutex::new(None)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect(
        &self,
        session: &Arc<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let peer = self.peer;
        let conn = Arc::clone(&self.conn);
        let session = Arc::clone(session);
        let log = self.log.clone();
        spawn(move || match TcpStream::connect_timeout(&peer, timeout) {
            Ok(new_conn) => {
                lock!(conn).replace(new_conn);
                let ec = EventContainer::tracked(
                    FsmEvent::Tcp(TcpEvent::Connected(Arc::clone(&session))),
                    &session,
                );
                if let Err(e) = event_tx.send(ec) {
                    warn!(log, "post connected event: {e}");
                }
            }
            Err(e) => {
                debug!(log, "connect to {peer} failed: {e}");
                let ec = EventContainer::tracked(
                    FsmEvent::Tcp(TcpEvent::ConnectFailed(Arc::clone(
                        &session,
                    ))),
                    &session,
                );
                if let Err(e) = event_tx.send(ec) {
                    warn!(log, "post connect failure event: {e}");
                }
            }
        });
        Ok(())
    }

    fn start_recv_loop(
        &self,
        session: Weak<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
    ) -> Result<(), Error> {
        let stream = match *lock!(self.conn) {
            Some(ref s) => s.try_clone()?,
            None => return Err(Error::NotConnected),
        };
        let peer = self.peer;
        let dropped = Arc::clone(&self.dropped);
        let log = self.log.clone();
        spawn(move || {
            Self::recv_loop(stream, peer, session, event_tx, dropped, log)
        });
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        let buf = msg.to_wire()?;
        let mut guard = lock!(self.conn);
        match *guard {
            Some(ref mut stream) => {
                stream.write_all(&buf)?;
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Release);
        if let Some(stream) = lock!(self.conn).take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(self.log, "shutdown {}: {e}", self.peer);
            }
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        self.source
    }
}

impl BgpConnectionTcp {
    fn with_conn(
        source: SocketAddr,
        peer: SocketAddr,
        conn: TcpStream,
        log: Logger,
    ) -> Self {
        Self {
            source: Some(source),
            peer,
            conn: Arc::new(Mutex::new(Some(conn))),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn recv_loop(
        mut stream: TcpStream,
        peer: SocketAddr,
        session: Weak<Session<Self>>,
        event_tx: Sender<EventContainer<Self>>,
        dropped: Arc<AtomicBool>,
        log: Logger,
    ) {
        loop {
            let mut header_buf = [0u8; HEADER_LEN as usize];
            if let Err(e) = stream.read_exact(&mut header_buf) {
                if !dropped.load(Ordering::Acquire) {
                    debug!(log, "[{peer}] connection lost: {e}");
                    Self::post_closed(&session, &event_tx, &log);
                }
                return;
            }

            let s = match session.upgrade() {
                Some(s) if s.is_alive() => s,
                _ => return,
            };

            let header = match Header::from_wire(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    let ctx = header_error(&e);
                    debug!(log, "[{peer}] header error: {e}");
                    let _ = event_tx.send(parse_error_event(&s, ctx));
                    return;
                }
            };

            let mut body = vec![0u8; usize::from(header.length - HEADER_LEN)];
            if let Err(e) = stream.read_exact(&mut body) {
                if !dropped.load(Ordering::Acquire) {
                    debug!(log, "[{peer}] connection lost: {e}");
                    Self::post_closed(&session, &event_tx, &log);
                }
                return;
            }

            match Message::from_wire(&header, &body) {
                Ok(msg) => {
                    debug!(log, "[{peer}] recv: {}", msg.title());
                    if event_tx.send(message_event(&s, msg)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let ctx = body_error(header.typ, &e);
                    debug!(log, "[{peer}] message error: {e}");
                    let _ = event_tx.send(parse_error_event(&s, ctx));
                    return;
                }
            }
        }
    }

    fn post_closed(
        session: &Weak<Session<Self>>,
        event_tx: &Sender<EventContainer<Self>>,
        log: &Logger,
    ) {
        if let Some(s) = session.upgrade() {
            let ec = EventContainer::tracked(
                FsmEvent::Tcp(TcpEvent::Closed(Arc::clone(&s))),
                &s,
            );
            if let Err(e) = event_tx.send(ec) {
                debug!(log, "post close event: {e}");
            }
        }
    }
}

fn header_error(e: &Error) -> ParseErrorContext {
    let subcode = match e {
        Error::NoMarker => HeaderErrorSubcode::ConnectionNotSynchronized,
        Error::InvalidMessageType(_) => HeaderErrorSubcode::BadMessageType,
        _ => HeaderErrorSubcode::BadMessageLength,
    };
    ParseErrorContext::new(ErrorCode::Header, subcode as u8, e.to_string())
}

fn body_error(typ: MessageType, e: &Error) -> ParseErrorContext {
    match typ {
        MessageType::Open => {
            let subcode = match e {
                Error::BadVersion => {
                    OpenErrorSubcode::UnsupportedVersionNumber as u8
                }
                Error::OptionalParameterCode(_) => {
                    OpenErrorSubcode::UnsupportedOptionalParameter as u8
                }
                _ => 0,
            };
            ParseErrorContext::new(ErrorCode::Open, subcode, e.to_string())
        }
        MessageType::Update => ParseErrorContext::new(
            ErrorCode::Update,
            UpdateErrorSubcode::MalformedAttributeList as u8,
            e.to_string(),
        ),
        _ => ParseErrorContext::new(
            ErrorCode::Header,
            HeaderErrorSubcode::BadMessageLength as u8,
            e.to_string(),
        ),
    }
}
