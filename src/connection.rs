use crate::error::{Error, Result};
use crate::pool::Recycle;
use crate::response::HttpResponse;
use crate::stats::Statistics;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::Bytes;
use log::*;
use mio::event::Event;
use mio::net::{TcpSocket, TcpStream};
use mio::{Interest, Registry, Token};

const BUFFER_SIZE: usize = 4096;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ConnectionState {
    /// In the free pool.
    Idle,
    Connecting,
    Sending,
    Receiving,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseReason {
    Error,
    /// Peer hung up both directions.
    Hangup,
    /// Peer shut down its write side.
    Hangup2,
    ReadEnd,
    Pipeline,
    Unknown,
}

/// What the reactor should do with a connection after handling an event.
#[derive(Debug)]
pub enum Disposition {
    Open,
    Close(CloseReason),
    /// A socket error. Fatal to the run.
    Fail(io::Error),
}

/// The readiness flags of one event, in the order they are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub writable: bool,
    pub error: bool,
    pub readable: bool,
    pub hangup: Option<CloseReason>,
}

impl Readiness {
    pub fn from_event(event: &Event) -> Readiness {
        Readiness::from_flags(
            event.is_writable(),
            event.is_error(),
            event.is_readable(),
            event.is_read_closed(),
            event.is_write_closed(),
        )
    }

    /// Both directions closed is a full hangup; only the read side closed
    /// means the peer shut down its write side.
    pub fn from_flags(
        writable: bool,
        error: bool,
        readable: bool,
        read_closed: bool,
        write_closed: bool,
    ) -> Readiness {
        let hangup = match (read_closed, write_closed) {
            (true, true) => Some(CloseReason::Hangup),
            (true, false) => Some(CloseReason::Hangup2),
            (false, _) => None,
        };
        Self {
            writable,
            error,
            readable,
            hangup,
        }
    }
}

/// Per-connection record. One exists per unit of configured concurrency and
/// is reused for every connection made through its pool slot.
pub struct Connection {
    state: ConnectionState,
    stream: Option<TcpStream>,
    token: Token,
    request: Bytes,
    bytes_sent: usize,
    connected: bool,
    response: HttpResponse,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            stream: None,
            token: Token(0),
            request: Bytes::new(),
            bytes_sent: 0,
            connected: false,
            response: HttpResponse::new(),
        }
    }
}

impl Recycle for Connection {
    fn recycle(&mut self) {
        self.state = ConnectionState::Idle;
        self.stream = None;
        self.request = Bytes::new();
        self.bytes_sent = 0;
        self.connected = false;
        self.response.reset();
    }
}

fn not_connected() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "connection has no socket")
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Creates the socket and issues a non-blocking connect.
    ///
    /// Returns `Ok(false)` if the connect was refused outright; that only
    /// counts as a failed attempt. Failing to create, bind or register the
    /// socket is fatal.
    pub fn open(
        &mut self,
        token: Token,
        source: Option<SocketAddr>,
        target: SocketAddr,
        request: Bytes,
        registry: &Registry,
    ) -> Result<bool> {
        let socket = match target {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|err| Error::socket("socket", err))?;
        if let Some(source) = source {
            socket
                .bind(source)
                .map_err(|err| Error::socket("bind", err))?;
        }

        let mut stream = match socket.connect(target) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("connect(): {}: {}", target, err);
                return Ok(false);
            }
        };
        registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(|err| Error::socket("register", err))?;

        trace!("{:?}: connecting to {}", token, target);
        self.state = ConnectionState::Connecting;
        self.stream = Some(stream);
        self.token = token;
        self.request = request;
        self.bytes_sent = 0;
        self.connected = false;
        self.response.reset();
        Ok(true)
    }

    /// Deregisters and closes the socket.
    pub fn close(&mut self, registry: &Registry) -> io::Result<()> {
        self.state = ConnectionState::Idle;
        match self.stream.take() {
            Some(mut stream) => registry.deregister(&mut stream),
            None => Ok(()),
        }
    }

    /// Local and peer address, for logging.
    pub fn endpoints(&self) -> (String, String) {
        fn show(addr: io::Result<SocketAddr>) -> String {
            addr.map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string())
        }
        match &self.stream {
            Some(stream) => (show(stream.local_addr()), show(stream.peer_addr())),
            None => ("?".to_string(), "?".to_string()),
        }
    }

    /// The first writable event means the handshake finished; after that,
    /// writable means more of the request can be sent.
    pub fn on_writable(
        &mut self,
        registry: &Registry,
        shutdown: bool,
        stats: &mut Statistics,
    ) -> Disposition {
        if !self.connected {
            let stream = match self.stream.as_ref() {
                Some(stream) => stream,
                None => return Disposition::Fail(not_connected()),
            };
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(err)) | Err(err) => return Disposition::Fail(err),
            }
            if let Err(err) = stream.peer_addr() {
                if err.kind() == ErrorKind::NotConnected {
                    // spurious wakeup, handshake still in flight
                    return Disposition::Open;
                }
                return Disposition::Fail(err);
            }
            trace!("{:?}: connected", self.token);
            self.connected = true;
            self.state = ConnectionState::Sending;
            stats.con.succeeded.inc();
        }
        match self.state {
            ConnectionState::Sending => self.send(registry, shutdown, stats),
            _ => Disposition::Open,
        }
    }

    /// Error readiness: fetch the pending socket error.
    pub fn on_error(&mut self) -> Disposition {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Disposition::Fail(not_connected()),
        };
        match stream.take_error() {
            Ok(Some(err)) | Err(err) => Disposition::Fail(err),
            Ok(None) => Disposition::Fail(io::Error::new(
                ErrorKind::Other,
                "socket reported an error condition",
            )),
        }
    }

    /// Drains the socket, feeding each read to the response parser.
    ///
    /// `hangup` is the hangup flag carried by the same event, if any.
    pub fn on_readable(
        &mut self,
        hangup: Option<CloseReason>,
        registry: &Registry,
        shutdown: bool,
        stats: &mut Statistics,
    ) -> Disposition {
        let mut buf = [0; BUFFER_SIZE];
        loop {
            if self.state != ConnectionState::Receiving {
                return Disposition::Open;
            }
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Disposition::Fail(not_connected()),
            };
            let nread = match stream.read(&mut buf) {
                Ok(0) => return self.end_of_stream(hangup, stats),
                Ok(nread) => nread,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return match hangup {
                        Some(_) => Disposition::Close(CloseReason::Unknown),
                        None => Disposition::Open,
                    };
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Disposition::Fail(err),
            };
            stats.http.bytes_received.add(nread as u64);

            if self.response.is_done() {
                // a response already completed and nothing was asked for
                return Disposition::Close(CloseReason::Pipeline);
            }
            let progress = self.response.parse(&buf[..nread]);
            if progress.consumed < nread {
                debug!(
                    "{:?}: {} bytes past the end of the response",
                    self.token,
                    nread - progress.consumed
                );
                return Disposition::Close(CloseReason::Pipeline);
            }
            if !progress.complete {
                continue;
            }

            self.response_received(stats);
            if let Some(reason) = hangup {
                return Disposition::Close(reason);
            }
            if shutdown {
                // our write side is closed; wait for the peer to close
                continue;
            }
            if let Disposition::Fail(err) = self.recycle(registry, shutdown, stats) {
                return Disposition::Fail(err);
            }
        }
    }

    fn response_received(&mut self, stats: &mut Statistics) {
        trace!("{:?}: {}", self.token, self.response);
        stats.response(self.response.status(), self.response.is_error());
        stats.record_title(self.response.title());
    }

    fn end_of_stream(&mut self, hangup: Option<CloseReason>, stats: &mut Statistics) -> Disposition {
        if self.response.finish() {
            self.response_received(stats);
        }
        Disposition::Close(hangup.unwrap_or(CloseReason::ReadEnd))
    }

    /// Starts the next request on the same connection.
    fn recycle(&mut self, registry: &Registry, shutdown: bool, stats: &mut Statistics) -> Disposition {
        self.response.reset();
        self.bytes_sent = 0;
        self.state = ConnectionState::Sending;
        match self.send(registry, shutdown, stats) {
            Disposition::Open if self.state == ConnectionState::Sending => {
                let stream = match self.stream.as_mut() {
                    Some(stream) => stream,
                    None => return Disposition::Fail(not_connected()),
                };
                match registry.reregister(
                    stream,
                    self.token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    Ok(()) => Disposition::Open,
                    Err(err) => Disposition::Fail(err),
                }
            }
            other => other,
        }
    }

    /// Writes as much of the request as the socket takes. Once all of it is
    /// out, stops watching for writable and optionally half-closes.
    fn send(&mut self, registry: &Registry, shutdown: bool, stats: &mut Statistics) -> Disposition {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Disposition::Fail(not_connected()),
        };
        while self.bytes_sent < self.request.len() {
            match stream.write(&self.request[self.bytes_sent..]) {
                Ok(0) => return Disposition::Open,
                Ok(nwrite) => {
                    self.bytes_sent += nwrite;
                    stats.http.bytes_sent.add(nwrite as u64);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Disposition::Open,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Disposition::Fail(err),
            }
        }

        if let Err(err) = registry.reregister(stream, self.token, Interest::READABLE) {
            return Disposition::Fail(err);
        }
        if shutdown {
            if let Err(err) = stream.shutdown(Shutdown::Write) {
                debug!("{:?}: shutdown(): {}", self.token, err);
            }
        }
        stats.http.sent.inc();
        self.state = ConnectionState::Receiving;
        trace!("{:?}: request sent", self.token);
        Disposition::Open
    }
}
