use crate::config::Config;
use crate::stats::{Counter, Statistics};

use std::io::{self, Write};

use log::*;

const ALT_SCREEN: &str = "\x1b[?1049h\x1b[H";
const NORM_SCREEN: &str = "\x1b[?1049l";
const HIDE_CURSOR: &str = "\x1b[?25l";
const SHOW_CURSOR: &str = "\x1b[?25h";
const TOP_LEFT: &str = "\x1b[1;1H";
/// Clear to end of line.
const CEOL: &str = "\x1b[K";

/// Full-screen progress display on stderr. The terminal is put back the way
/// it was when this is dropped.
pub struct Screen {
    out: io::Stderr,
}

impl Screen {
    pub fn new() -> io::Result<Screen> {
        let out = io::stderr();
        {
            let mut handle = out.lock();
            write!(handle, "{}{}", ALT_SCREEN, HIDE_CURSOR)?;
            handle.flush()?;
        }
        Ok(Self { out })
    }

    pub fn render(&self, config: &Config, stats: &Statistics, concurrency: usize) {
        let mut buf = Vec::with_capacity(1024);
        if let Err(err) = draw(&mut buf, config, stats, concurrency) {
            debug!("display: {}", err);
            return;
        }
        let mut handle = self.out.lock();
        if let Err(err) = handle.write_all(&buf).and_then(|_| handle.flush()) {
            debug!("display: {}", err);
        }
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let mut handle = self.out.lock();
        let restored =
            write!(handle, "{}{}", NORM_SCREEN, SHOW_CURSOR).and_then(|_| handle.flush());
        if let Err(err) = restored {
            debug!("restoring terminal: {}", err);
        }
    }
}

fn row<W: Write>(out: &mut W, name: &str, counter: &Counter) -> io::Result<()> {
    write!(
        out,
        "{:>10}: {:>10}   {:>6}/sec{}\n",
        name, counter.total, counter.rate as u64, CEOL
    )
}

/// Writes one frame, starting from the top-left corner.
pub fn draw<W: Write>(
    out: &mut W,
    config: &Config,
    stats: &Statistics,
    concurrency: usize,
) -> io::Result<()> {
    write!(out, "{}", TOP_LEFT)?;
    write!(
        out,
        "[ swarm v{} ]{}\n",
        env!("CARGO_PKG_VERSION"),
        CEOL
    )?;
    write!(
        out,
        "website: {}:{}{}\n",
        config.server_name, config.server_port, CEOL
    )?;
    write!(out, "IP:")?;
    for target in config.addresses.targets() {
        write!(out, " {}", target.ip())?;
    }
    write!(out, "{}\n", CEOL)?;
    let sources = config.addresses.sources();
    if !sources.is_empty() {
        write!(out, "source:")?;
        for source in sources {
            write!(out, " {}", source.ip())?;
        }
        write!(out, "{}\n", CEOL)?;
    }
    write!(out, "{}\n", CEOL)?;
    write!(out, "concurrency: {:>10}{}\n{}\n", concurrency, CEOL, CEOL)?;

    let con = &stats.con;
    row(out, "connect", &con.attempted)?;
    row(out, "success", &con.succeeded)?;
    row(out, "fail", &con.failed)?;
    row(out, "error", &con.error)?;
    row(out, "closed", &con.read_end)?;
    row(out, "hangup", &con.hangup)?;
    row(out, "hangup2", &con.hangup2)?;
    row(out, "pipeline", &con.pipeline)?;
    row(out, "unknown", &con.unknown)?;
    write!(out, "{}\n", CEOL)?;

    let http = &stats.http;
    row(out, "sent", &http.sent)?;
    row(out, "recv", &http.received)?;
    row(out, "1xx", &http.n1xx)?;
    row(out, "2xx", &http.n2xx)?;
    row(out, "3xx", &http.n3xx)?;
    row(out, "4xx", &http.n4xx)?;
    row(out, "5xx", &http.n5xx)?;
    row(out, "malformed", &http.parse_error)?;
    if let Some(title) = &stats.title {
        write!(out, "{}\n{:>10}: {}{}\n", CEOL, "title", title, CEOL)?;
    }
    write!(out, "{}\n", CEOL)
}

/// One log line per reporting tick, for `--plain`.
pub fn summary_line(stats: &Statistics, concurrency: usize) -> String {
    format!(
        "concurrency: {} connect: {} ({}/sec) sent: {} ({}/sec) recv: {} ({}/sec) error: {}",
        concurrency,
        stats.con.attempted.total,
        stats.con.attempted.rate as u64,
        stats.http.sent.total,
        stats.http.sent.rate as u64,
        stats.http.received.total,
        stats.http.received.rate as u64,
        stats.con.error.total,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressPool;
    use crate::request::RequestTemplate;

    use std::time::{Duration, Instant};

    fn config() -> Config {
        with_sources(vec![])
    }

    fn with_sources(sources: Vec<std::net::SocketAddr>) -> Config {
        Config {
            concurrency: 8,
            request_count: None,
            duration: None,
            server_name: "example.com".to_string(),
            server_port: 8080,
            addresses: AddressPool::new(
                vec!["10.0.0.1:8080".parse().unwrap(), "10.0.0.2:8080".parse().unwrap()],
                sources,
            )
            .unwrap(),
            request: RequestTemplate::new("example.com", "/").freeze(),
            shutdown: false,
        }
    }

    #[test]
    fn frame_layout() {
        let start = Instant::now();
        let mut stats = Statistics::new(start);
        stats.con.attempted.add(1234);
        stats.calculate_rates(start + Duration::from_secs(1));
        stats.title = Some("Example".to_string());

        let mut buf = Vec::new();
        draw(&mut buf, &config(), &stats, 7).unwrap();
        let frame = String::from_utf8(buf).unwrap();

        assert!(frame.starts_with(TOP_LEFT));
        assert!(frame.contains("website: example.com:8080\x1b[K\n"));
        assert!(frame.contains("IP: 10.0.0.1 10.0.0.2\x1b[K"));
        assert!(frame.contains("concurrency:          7\x1b[K"));
        assert!(frame.contains("   connect:       1234      123/sec\x1b[K\n"));
        assert!(frame.contains("     title: Example\x1b[K"));
        assert!(frame.lines().all(|line| line.ends_with(CEOL)));
        assert!(!frame.contains("source:"));
    }

    #[test]
    fn every_status_class_and_source_is_shown() {
        let mut stats = Statistics::new(Instant::now());
        stats.response(101, false);
        stats.response(302, false);
        stats.response(302, false);
        stats.response(0, true);
        let config = with_sources(vec!["192.168.1.7:0".parse().unwrap()]);

        let mut buf = Vec::new();
        draw(&mut buf, &config, &stats, 1).unwrap();
        let frame = String::from_utf8(buf).unwrap();

        assert!(frame.contains("source: 192.168.1.7\x1b[K\n"));
        assert!(frame.contains("       1xx:          1"));
        assert!(frame.contains("       3xx:          2"));
        assert!(frame.contains(" malformed:          1"));
        assert!(frame.contains("      recv:          4"));
        let classes: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.trim_start().get(..4))
            .filter(|name| name.ends_with("xx:"))
            .collect();
        assert_eq!(classes, vec!["1xx:", "2xx:", "3xx:", "4xx:", "5xx:"]);
    }

    #[test]
    fn plain_summary() {
        let mut stats = Statistics::new(Instant::now());
        stats.http.sent.add(3);
        stats.http.received.add(2);
        let line = summary_line(&stats, 4);
        assert!(line.starts_with("concurrency: 4 "));
        assert!(line.contains("sent: 3 (0/sec)"));
        assert!(line.contains("recv: 2 (0/sec)"));
    }
}
