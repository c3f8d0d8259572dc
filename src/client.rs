use crate::config::{Config, RandomSource};
use crate::connection::{CloseReason, Connection, Disposition, Readiness};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::stats::Statistics;

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::*;
use mio::{Events, Poll, Token};

/// New connections opened per tick at most, so startup ramps up instead of
/// stampeding.
const CONNECT_BATCH: usize = 10;
/// Upper bound on one readiness wait; keeps reporting on schedule.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Tick {
    Busy,
    /// No connection is active after the top-up phase.
    Idle,
}

/// The single-threaded reactor: owns the poller, the connection pool and the
/// statistics, and drives every connection from one thread.
pub struct Client<'a, R> {
    config: &'a Config,
    ev_loop: Poll,
    events: Events,
    ready: Vec<(Token, Readiness)>,
    connections: Pool<Connection>,
    stats: Statistics,
    rng: R,
}

impl<'a, R: RandomSource> Client<'a, R> {
    pub fn new(config: &'a Config, rng: R) -> Result<Client<'a, R>> {
        let ev_loop = Poll::new().map_err(|err| Error::socket("poll", err))?;
        let capacity = config.concurrency.max(1);
        Ok(Self {
            config,
            ev_loop,
            events: Events::with_capacity(capacity),
            ready: Vec::with_capacity(capacity),
            connections: Pool::new(config.concurrency, Connection::default),
            stats: Statistics::new(Instant::now()),
            rng,
        })
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Connections currently open.
    pub fn concurrency(&self) -> usize {
        self.connections.active_count()
    }

    fn create_connection(&mut self) -> Result<()> {
        let (source, target) = self.config.addresses.choose(&mut self.rng);
        let index = self.connections.acquire()?;
        self.stats.con.attempted.inc();

        let opened = match self.connections.get_mut(index) {
            Some(connection) => connection.open(
                Token(index),
                source,
                target,
                self.config.request.clone(),
                self.ev_loop.registry(),
            )?,
            None => false,
        };
        if !opened {
            self.stats.con.failed.inc();
            self.connections.release(index);
        }
        Ok(())
    }

    /// One pass of the loop: top up connections, wait for readiness, and
    /// handle every event that came back.
    pub fn tick(&mut self) -> Result<Tick> {
        let mut created = 0;
        while created < CONNECT_BATCH && self.connections.active_count() < self.config.concurrency
        {
            self.create_connection()?;
            created += 1;
        }
        if self.connections.active_count() == 0 {
            return Ok(Tick::Idle);
        }

        match self.ev_loop.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Tick::Busy),
            Err(err) => return Err(Error::socket("poll", err)),
        }

        self.ready.clear();
        self.ready.extend(
            self.events
                .iter()
                .map(|event| (event.token(), Readiness::from_event(event))),
        );
        for i in 0..self.ready.len() {
            let (token, readiness) = self.ready[i];
            self.dispatch(token, readiness)?;
        }
        Ok(Tick::Busy)
    }

    /// Handles one event's flags in order: writable, error, readable, hangup.
    /// A connection closed by an earlier flag is not looked at again.
    fn dispatch(&mut self, token: Token, readiness: Readiness) -> Result<()> {
        let index = token.0;
        let shutdown = self.config.shutdown;

        if readiness.writable {
            let disposition = match self.connections.get_mut(index) {
                Some(connection) => {
                    connection.on_writable(self.ev_loop.registry(), shutdown, &mut self.stats)
                }
                None => {
                    trace!("event for inactive {:?}", token);
                    return Ok(());
                }
            };
            if !self.settle(index, disposition)? {
                return Ok(());
            }
        }

        if readiness.error {
            let disposition = match self.connections.get_mut(index) {
                Some(connection) => connection.on_error(),
                None => return Ok(()),
            };
            if !self.settle(index, disposition)? {
                return Ok(());
            }
        }

        if readiness.readable {
            let disposition = match self.connections.get_mut(index) {
                Some(connection) => connection.on_readable(
                    readiness.hangup,
                    self.ev_loop.registry(),
                    shutdown,
                    &mut self.stats,
                ),
                None => return Ok(()),
            };
            if !self.settle(index, disposition)? {
                return Ok(());
            }
        }

        if let Some(reason) = readiness.hangup {
            if self.connections.get(index).is_some() {
                self.close(index, reason)?;
            }
        }
        Ok(())
    }

    /// Applies a handler's verdict. Returns whether the connection is still
    /// open.
    fn settle(&mut self, index: usize, disposition: Disposition) -> Result<bool> {
        match disposition {
            Disposition::Open => Ok(true),
            Disposition::Close(reason) => {
                self.close(index, reason)?;
                Ok(false)
            }
            Disposition::Fail(source) => {
                let (local, peer) = self
                    .connections
                    .get(index)
                    .map(Connection::endpoints)
                    .unwrap_or_default();
                self.close(index, CloseReason::Error)?;
                Err(Error::Connection {
                    local,
                    peer,
                    source,
                })
            }
        }
    }

    fn close(&mut self, index: usize, reason: CloseReason) -> Result<()> {
        if let Some(connection) = self.connections.get_mut(index) {
            trace!(
                "{:?} closing while {:?}: {:?}",
                Token(index),
                connection.state(),
                reason
            );
            connection
                .close(self.ev_loop.registry())
                .map_err(|err| Error::socket("deregister", err))?;
        }
        let con = &mut self.stats.con;
        match reason {
            CloseReason::Error => con.error.inc(),
            CloseReason::Hangup => con.hangup.inc(),
            CloseReason::Hangup2 => con.hangup2.inc(),
            CloseReason::ReadEnd => con.read_end.inc(),
            CloseReason::Pipeline => con.pipeline.inc(),
            CloseReason::Unknown => con.unknown.inc(),
        }
        self.connections.release(index);
        Ok(())
    }

    fn finished(&self, started: Instant) -> bool {
        if let Some(count) = self.config.request_count {
            if self.stats.http.received.total >= count {
                return true;
            }
        }
        if let Some(duration) = self.config.duration {
            if started.elapsed() >= duration {
                return true;
            }
        }
        false
    }

    /// Ticks until the configured limit is hit, `stop` is raised, or no
    /// connection can be kept open. `report` is called once per second with
    /// fresh rates and the current concurrency.
    pub fn run<F>(&mut self, stop: &AtomicBool, mut report: F) -> Result<()>
    where
        F: FnMut(&Statistics, usize),
    {
        let started = Instant::now();
        let mut next_report = started + REPORT_INTERVAL;

        while !self.finished(started) {
            if stop.load(Ordering::Relaxed) {
                info!("interrupted");
                break;
            }
            if self.tick()? == Tick::Idle {
                warn!("no connections could be kept open");
                break;
            }
            let now = Instant::now();
            if now >= next_report {
                self.stats.calculate_rates(now);
                report(&self.stats, self.concurrency());
                next_report = now + REPORT_INTERVAL;
            }
        }

        self.stats.calculate_rates(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressPool;
    use crate::request::RequestTemplate;

    use std::io::{self, Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Reads one request head; false once the client has gone away.
    fn read_request(stream: &mut TcpStream) -> io::Result<bool> {
        let mut head = Vec::new();
        let mut buf = [0; 512];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Ok(false);
            }
            head.extend_from_slice(&buf[..n]);
        }
        Ok(true)
    }

    /// Accepts connections forever, answering each request with `reply`.
    /// With `close_after` the connection is dropped after one reply.
    fn serve(reply: &'static [u8], close_after: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => continue,
                };
                thread::spawn(move || {
                    while let Ok(true) = read_request(&mut stream) {
                        if stream.write_all(reply).is_err() || close_after {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn config(target: SocketAddr, concurrency: usize, count: Option<u64>) -> Config {
        Config {
            concurrency,
            request_count: count,
            duration: Some(Duration::from_secs(10)),
            server_name: "localhost".to_string(),
            server_port: target.port(),
            addresses: AddressPool::new(vec![target], vec![]).unwrap(),
            request: RequestTemplate::new("localhost", "/").freeze(),
            shutdown: false,
        }
    }

    #[test]
    fn keep_alive_requests_reach_the_count() {
        let target = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello", false);
        let config = config(target, 4, Some(200));
        let mut client = Client::new(&config, StdRng::seed_from_u64(1)).unwrap();
        let stop = AtomicBool::new(false);

        client.run(&stop, |_, _| {}).unwrap();

        let stats = client.stats();
        assert!(stats.http.received.total >= 200);
        assert_eq!(stats.http.n2xx.total, stats.http.received.total);
        assert!(stats.http.sent.total >= stats.http.received.total);
        assert_eq!(stats.con.attempted.total, 4);
        assert_eq!(stats.con.succeeded.total, 4);
        assert_eq!(stats.con.error.total, 0);
        assert_eq!(client.concurrency(), 4);
    }

    #[test]
    fn connections_closed_by_the_server_are_replaced() {
        let target = serve(b"HTTP/1.0 200 OK\r\nServer: test\r\n\r\n<title>t</title>", true);
        let config = config(target, 2, Some(20));
        let mut client = Client::new(&config, StdRng::seed_from_u64(2)).unwrap();
        let stop = AtomicBool::new(false);

        client.run(&stop, |_, _| {}).unwrap();

        let stats = client.stats();
        let con = &stats.con;
        assert!(stats.http.received.total >= 20);
        assert!(con.attempted.total > 2);
        assert!(con.read_end.total + con.hangup.total + con.hangup2.total >= 18);
        assert_eq!(con.error.total, 0);
        assert_eq!(stats.title.as_deref(), Some("t"));
    }

    #[test]
    fn pipelined_bytes_close_the_connection() {
        let target = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb",
            false,
        );
        let mut config = config(target, 1, None);
        config.duration = Some(Duration::from_millis(300));
        let mut client = Client::new(&config, StdRng::seed_from_u64(3)).unwrap();
        let stop = AtomicBool::new(false);

        client.run(&stop, |_, _| {}).unwrap();

        let con = &client.stats().con;
        assert!(con.pipeline.total >= 1);
        assert_eq!(con.error.total, 0);
    }

    #[test]
    fn stop_flag_ends_the_run() {
        let target = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", false);
        let config = config(target, 1, None);
        let mut client = Client::new(&config, StdRng::seed_from_u64(4)).unwrap();
        let stop = AtomicBool::new(true);

        client.run(&stop, |_, _| {}).unwrap();
        assert_eq!(client.stats().con.attempted.total, 0);
    }

    #[test]
    fn refused_connections_end_the_run() {
        let target = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = config(target, 3, None);
        let mut client = Client::new(&config, StdRng::seed_from_u64(5)).unwrap();
        let stop = AtomicBool::new(false);

        match client.run(&stop, |_, _| {}) {
            Ok(()) => assert_eq!(client.stats().con.failed.total, 3),
            Err(Error::Connection { .. }) => assert_eq!(client.stats().con.error.total, 1),
            Err(other) => panic!("unexpected {}", other),
        }
        assert_eq!(client.stats().http.received.total, 0);
    }

    /// A client with one connection to a listener that never accepts.
    fn connecting_client(config: &Config) -> Client<'_, StdRng> {
        let mut client = Client::new(config, StdRng::seed_from_u64(7)).unwrap();
        client.create_connection().unwrap();
        assert_eq!(client.concurrency(), 1);
        client
    }

    fn listening_config() -> (TcpListener, Config) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config(listener.local_addr().unwrap(), 1, None);
        (listener, config)
    }

    #[test]
    fn error_flag_wins_over_later_flags() {
        let (_listener, config) = listening_config();
        let mut client = connecting_client(&config);
        let everything = Readiness {
            writable: true,
            error: true,
            readable: true,
            hangup: Some(CloseReason::Hangup),
        };

        match client.dispatch(Token(0), everything) {
            Err(Error::Connection { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        let con = &client.stats().con;
        assert_eq!(con.error.total, 1);
        assert_eq!(con.hangup.total, 0);
        assert_eq!(con.hangup2.total, 0);
        assert_eq!(con.unknown.total, 0);
        assert_eq!(client.concurrency(), 0);

        // the slot is free now, so a late event for it changes nothing
        client.dispatch(Token(0), everything).unwrap();
        assert_eq!(client.stats().con.error.total, 1);
        assert_eq!(client.concurrency(), 0);
    }

    #[test]
    fn half_close_while_connecting_closes_once() {
        let (_listener, config) = listening_config();
        let mut client = connecting_client(&config);
        let half_closed = Readiness {
            readable: true,
            hangup: Some(CloseReason::Hangup2),
            ..Readiness::default()
        };

        client.dispatch(Token(0), half_closed).unwrap();
        let con = &client.stats().con;
        assert_eq!(con.hangup2.total, 1);
        assert_eq!(con.hangup.total + con.unknown.total + con.read_end.total, 0);
        assert_eq!(con.error.total, 0);
        assert_eq!(client.stats().http.received.total, 0);
        assert_eq!(client.concurrency(), 0);

        client.dispatch(Token(0), half_closed).unwrap();
        assert_eq!(client.stats().con.hangup2.total, 1);
    }

    #[test]
    fn full_hangup_is_counted_apart_from_half_close() {
        let (_listener, config) = listening_config();
        let mut client = connecting_client(&config);
        let hung_up = Readiness {
            hangup: Some(CloseReason::Hangup),
            ..Readiness::default()
        };

        client.dispatch(Token(0), hung_up).unwrap();
        assert_eq!(client.stats().con.hangup.total, 1);
        assert_eq!(client.stats().con.hangup2.total, 0);
    }

    #[test]
    fn events_for_unknown_tokens_are_ignored() {
        let (_listener, config) = listening_config();
        let mut client = connecting_client(&config);
        let everything = Readiness {
            writable: true,
            error: true,
            readable: true,
            hangup: Some(CloseReason::Hangup),
        };

        client.dispatch(Token(5), everything).unwrap();
        assert_eq!(client.concurrency(), 1);
        assert_eq!(client.stats().con.error.total, 0);
    }

    #[test]
    fn top_up_is_batched() {
        let target = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", false);
        let config = config(target, 25, None);
        let mut client = Client::new(&config, StdRng::seed_from_u64(6)).unwrap();

        assert_eq!(client.tick().unwrap(), Tick::Busy);
        assert_eq!(client.stats().con.attempted.total, 10);
        client.tick().unwrap();
        client.tick().unwrap();
        client.tick().unwrap();
        assert_eq!(client.stats().con.attempted.total, 25);
        assert_eq!(client.concurrency(), 25);
    }
}
