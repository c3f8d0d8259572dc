use crate::config::AddressPool;
use crate::error::{Error, Result};

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::*;
use mio::net::TcpSocket;
use mio::{Events, Interest, Poll, Token};

const PROBE: Token = Token(0);

fn source_name(source: Option<SocketAddr>) -> String {
    match source {
        Some(source) => source.ip().to_string(),
        None => "default".to_string(),
    }
}

/// Connects once to every (source, target) pair the run can use, failing on
/// the first pair that cannot connect within `timeout`.
pub fn check(addresses: &AddressPool, timeout: Duration) -> Result<()> {
    for (source, target) in addresses.pairs() {
        match probe(source, target, timeout) {
            Ok(()) => info!("{} -> {}: connect(): success", source_name(source), target),
            Err(reason) => {
                return Err(Error::Pretest {
                    source_addr: source_name(source),
                    target,
                    reason,
                })
            }
        }
    }
    Ok(())
}

fn probe(source: Option<SocketAddr>, target: SocketAddr, timeout: Duration) -> std::result::Result<(), String> {
    let fail = |op: &str, err: std::io::Error| format!("{}(): {}", op, err);

    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| fail("socket", err))?;
    if let Some(source) = source {
        socket.bind(source).map_err(|err| fail("bind", err))?;
    }
    let mut stream = socket.connect(target).map_err(|err| err.to_string())?;

    let mut poll = Poll::new().map_err(|err| fail("poll", err))?;
    poll.registry()
        .register(&mut stream, PROBE, Interest::WRITABLE)
        .map_err(|err| fail("register", err))?;

    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err("connection timed out".to_string());
        }
        match poll.poll(&mut events, Some(deadline - now)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(fail("poll", err)),
        }
        if events.is_empty() {
            continue;
        }

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => return Err(err.to_string()),
        }
        match stream.peer_addr() {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => continue,
            Err(err) => return Err(err.to_string()),
        }
    }
}
