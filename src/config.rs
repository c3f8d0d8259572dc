use crate::error::{Error, Result};

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use log::*;
use rand::Rng;

/// Uniform integers in `[0, n)`, used to pick endpoints.
pub trait RandomSource {
    fn uniform(&mut self, n: usize) -> usize;
}

impl<R: Rng> RandomSource for R {
    fn uniform(&mut self, n: usize) -> usize {
        self.gen_range(0, n)
    }
}

/// Everything the engine needs, fixed for the length of the run.
#[derive(Debug, Clone)]
pub struct Config {
    pub concurrency: usize,
    /// Stop after this many responses.
    pub request_count: Option<u64>,
    /// Stop after this much wall-clock time.
    pub duration: Option<Duration>,
    pub server_name: String,
    pub server_port: u16,
    pub addresses: AddressPool,
    pub request: Bytes,
    /// Half-close the write side once a request is sent.
    pub shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Splits `http://host[:port][/path]`.
pub fn parse_url(url: &str) -> Result<Url> {
    const SCHEME: &str = "http://";
    let bad = || Error::Config(format!("bad URL: {}", url));

    match url.get(..SCHEME.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => {}
        _ => return Err(bad()),
    }
    let rest = url[SCHEME.len()..].trim_start_matches(|c: char| c == '/' || c == '\\');
    if !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '[') {
        return Err(bad());
    }

    let (authority, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, "/"),
    };

    let (host, port) = if authority.starts_with('[') {
        let close = authority.find(']').ok_or_else(bad)?;
        let port = match &authority[close + 1..] {
            "" => None,
            tail if tail.starts_with(':') => Some(&tail[1..]),
            _ => return Err(bad()),
        };
        (&authority[1..close], port)
    } else {
        match authority.rfind(':') {
            Some(colon) => (&authority[..colon], Some(&authority[colon + 1..])),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| bad())?,
        None => 80,
    };
    if host.is_empty() || port == 0 {
        return Err(bad());
    }

    Ok(Url {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Resolves a comma-separated list of hosts or addresses.
pub fn resolve_list(list: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let bare = entry.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            addrs.push(SocketAddr::new(ip, port));
            continue;
        }
        let resolved = (entry, port)
            .to_socket_addrs()
            .map_err(|source| Error::Resolve {
                host: entry.to_string(),
                source,
            })?;
        let before = addrs.len();
        addrs.extend(resolved);
        debug!("{} resolved to {} address(es)", entry, addrs.len() - before);
    }
    Ok(addrs)
}

/// Target and source addresses, validated so that every draw succeeds.
#[derive(Debug, Clone)]
pub struct AddressPool {
    targets: Vec<SocketAddr>,
    sources: Vec<SocketAddr>,
    /// Targets with at least one source of the same family.
    usable: Vec<usize>,
    v4_sources: Vec<usize>,
    v6_sources: Vec<usize>,
}

impl AddressPool {
    pub fn new(targets: Vec<SocketAddr>, sources: Vec<SocketAddr>) -> Result<AddressPool> {
        if targets.is_empty() {
            return Err(Error::Config("no target addresses".to_string()));
        }
        let family = |want_v4: bool| -> Vec<usize> {
            sources
                .iter()
                .enumerate()
                .filter(|(_, addr)| addr.is_ipv4() == want_v4)
                .map(|(index, _)| index)
                .collect()
        };
        let v4_sources = family(true);
        let v6_sources = family(false);

        let usable: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, target)| {
                sources.is_empty()
                    || (target.is_ipv4() && !v4_sources.is_empty())
                    || (target.is_ipv6() && !v6_sources.is_empty())
            })
            .map(|(index, _)| index)
            .collect();
        if usable.is_empty() {
            return Err(Error::NoCompatibleSource);
        }
        if usable.len() < targets.len() {
            warn!(
                "{} target(s) have no source address of the same family and will not be used",
                targets.len() - usable.len()
            );
        }

        Ok(Self {
            targets,
            sources,
            usable,
            v4_sources,
            v6_sources,
        })
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    pub fn sources(&self) -> &[SocketAddr] {
        &self.sources
    }

    /// Every (source, target) combination sharing an address family, or
    /// each target alone when no sources are configured.
    pub fn pairs(&self) -> Vec<(Option<SocketAddr>, SocketAddr)> {
        if self.sources.is_empty() {
            return self.targets.iter().map(|&t| (None, t)).collect();
        }
        let mut pairs = Vec::new();
        for &source in &self.sources {
            for &target in &self.targets {
                if source.is_ipv4() == target.is_ipv4() {
                    pairs.push((Some(source), target));
                }
            }
        }
        pairs
    }

    /// Picks a random target and, if sources are configured, a random source
    /// of the same family.
    pub fn choose<R: RandomSource + ?Sized>(&self, rng: &mut R) -> (Option<SocketAddr>, SocketAddr) {
        let target = self.targets[self.usable[rng.uniform(self.usable.len())]];
        if self.sources.is_empty() {
            return (None, target);
        }
        let family = if target.is_ipv4() {
            &self.v4_sources
        } else {
            &self.v6_sources
        };
        let source = self.sources[family[rng.uniform(family.len())]];
        (Some(source), target)
    }
}
