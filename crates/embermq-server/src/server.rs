//! The TCP front-end: a single-threaded mio poll loop.
//!
//! The loop owns the sockets and nothing else. Readable sockets feed
//! bytes into the packet decoder and decoded packets into the broker;
//! writable sockets drain the per-session write buffers; a periodic
//! timeout drives `Broker::tick`. All broker state lives on this
//! thread.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use embermq_core::error::{Error, ProtocolError};
use embermq_core::packet::{self, Connack, ConnackCode, Packet, Protocol};

use crate::broker::Broker;
use crate::session::{SessionId, SessionState};

const LISTENER: Token = Token(0);
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const INITIAL_READ_BUFFER: usize = 1024;

struct Connection {
    stream: TcpStream,
    sid: SessionId,
    read_buf: Vec<u8>,
    read_pos: usize,
    /// Flush remaining output, then close.
    closing: bool,
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    broker: Broker,
    connections: AHashMap<Token, Connection>,
}

impl Server {
    pub fn new(broker: Broker) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(broker.cfg.server.bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("listening on {}", broker.cfg.server.bind);
        Ok(Self {
            poll,
            listener,
            broker,
            connections: AHashMap::new(),
        })
    }

    /// Run the event loop. Never returns under normal operation.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_tick = Instant::now();

        loop {
            self.poll.poll(&mut events, Some(TICK_INTERVAL))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending()?,
                    token => {
                        if event.is_error() || event.is_read_closed() {
                            if let Some(conn) = self.connections.get_mut(&token) {
                                conn.closing = true;
                            }
                        }
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.broker.tick();
                last_tick = Instant::now();
            }

            self.flush_and_reap();
        }
    }

    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let sid = self.broker.create_session();
                    let token = Token(sid as usize);
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    debug!("accepted connection from {} as session {}", addr, sid);
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            sid,
                            read_buf: vec![0u8; INITIAL_READ_BUFFER],
                            read_pos: 0,
                            closing: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.closing {
            return;
        }

        // Drain the socket.
        loop {
            if conn.read_pos == conn.read_buf.len() {
                let new_len = conn.read_buf.len() * 2;
                conn.read_buf.resize(new_len, 0);
            }
            match conn.stream.read(&mut conn.read_buf[conn.read_pos..]) {
                Ok(0) => {
                    conn.closing = true;
                    break;
                }
                Ok(n) => conn.read_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error on session {}: {}", conn.sid, e);
                    conn.closing = true;
                    break;
                }
            }
        }

        // Decode and dispatch complete packets.
        let sid = conn.sid;
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.read_pos == 0 || conn.closing {
                break;
            }
            let version = self
                .broker
                .sessions
                .get(&sid)
                .filter(|s| s.state != SessionState::New)
                .map(|s| s.protocol);
            let max_packet_size = self.broker.cfg.limits.max_packet_size;

            match packet::decode_packet(&conn.read_buf[..conn.read_pos], version, max_packet_size)
            {
                Ok(Some((decoded, consumed))) => {
                    conn.read_buf.copy_within(consumed..conn.read_pos, 0);
                    conn.read_pos -= consumed;
                    if let Err(e) = self.broker.handle_packet(sid, decoded) {
                        self.refuse(token, sid, &e);
                        break;
                    }
                    let disconnected = self
                        .broker
                        .sessions
                        .get(&sid)
                        .map_or(true, |s| !s.connected);
                    if disconnected || self.broker.session_should_close(sid) {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            conn.closing = true;
                        }
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.refuse(token, sid, &e);
                    break;
                }
            }
        }
    }

    /// Queue the protocol-appropriate response for a fatal error and
    /// mark the connection for closure.
    fn refuse(&mut self, token: Token, sid: SessionId, err: &Error) {
        debug!("session {}: {}", sid, err);
        if let Error::Protocol(p) = err {
            let state_info = self
                .broker
                .sessions
                .get(&sid)
                .map(|s| (s.state, s.protocol));
            match state_info {
                Some((SessionState::New, _)) => {
                    // Pre-CONNACK failures answer in the 3.x shape; an
                    // unknown version byte gets the dedicated code.
                    if matches!(p, ProtocolError::UnsupportedProtocolVersion(_)) {
                        if let Some(session) = self.broker.sessions.get_mut(&sid) {
                            let _ = session.send_packet(&Packet::Connack(Connack {
                                session_present: false,
                                code: ConnackCode::UnacceptableProtocolVersion,
                                reason_code: None,
                                properties: None,
                            }));
                        }
                    }
                }
                Some((SessionState::Active, Protocol::V5)) => {
                    self.broker.send_disconnect_reason(sid, p.reason_code());
                }
                _ => {}
            }
        }
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.closing = true;
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let sid = conn.sid;
        if let Some(session) = self.broker.sessions.get_mut(&sid) {
            match session.out.flush_to(&mut conn.stream) {
                Ok(true) => {
                    // Buffer drained; backpressured publishes may resume.
                    if let Err(e) = self.broker.drain(sid) {
                        warn!("session {}: {}", sid, e);
                        conn.closing = true;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("write error on session {}: {}", sid, e);
                    conn.closing = true;
                }
            }
        }
    }

    /// Flush every session's output, then tear down connections that are
    /// done: closing with an empty buffer, or whose session ended.
    fn flush_and_reap(&mut self) {
        let mut dead: Vec<Token> = Vec::new();

        for (token, conn) in self.connections.iter_mut() {
            let sid = conn.sid;
            if let Some(session) = self.broker.sessions.get_mut(&sid) {
                match session.out.flush_to(&mut conn.stream) {
                    Ok(_) => {}
                    Err(e) => {
                        debug!("write error on session {}: {}", sid, e);
                        conn.closing = true;
                    }
                }
                if self.broker.session_should_close(sid) {
                    let drained = self
                        .broker
                        .sessions
                        .get(&sid)
                        .map(|s| s.out.is_empty())
                        .unwrap_or(true);
                    if drained {
                        conn.closing = true;
                    }
                }
            } else {
                conn.closing = true;
            }
            if conn.closing {
                dead.push(*token);
            }
        }

        for token in dead {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                self.broker.connection_closed(conn.sid);
            }
        }
    }
}
