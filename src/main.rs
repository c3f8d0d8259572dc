mod client;
mod config;
mod connection;
mod error;
mod matcher;
mod pool;
mod pretest;
mod request;
mod response;
mod stats;
mod tui;

use client::Client;
use config::{AddressPool, Config};
use error::{Error, Result};
use request::RequestTemplate;
use stats::Statistics;

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use env_logger;
use humantime;
use log::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "swarm")]
struct Opt {
    /// Target URL, http://host[:port][/path]
    #[structopt(name = "URL")]
    url: String,

    /// Number of connections kept open
    #[structopt(short = "c", long = "concurrency", default_value = "10")]
    concurrency: usize,

    /// Stop after this many responses
    #[structopt(short = "n", long = "count")]
    count: Option<u64>,

    /// Stop after this long
    #[structopt(short = "d", long = "duration", parse(try_from_str = humantime::parse_duration))]
    duration: Option<Duration>,

    /// Target addresses, comma separated, instead of resolving the URL host
    #[structopt(long = "targetip")]
    target_ip: Option<String>,

    /// Source addresses to bind, comma separated
    #[structopt(long = "sourceip")]
    source_ip: Option<String>,

    /// Half-close the connection after each request is sent
    #[structopt(long = "shutdown")]
    shutdown: bool,

    /// Request method
    #[structopt(short = "X", long = "method")]
    method: Option<String>,

    /// Request version, e.g. HTTP/1.0
    #[structopt(long = "http-version")]
    http_version: Option<String>,

    /// Extra header, "Name: value"
    #[structopt(short = "H", long = "header", number_of_values = 1)]
    headers: Vec<String>,

    /// Seed for address selection
    #[structopt(long = "seed")]
    seed: Option<u64>,

    /// Skip the connection test before the run
    #[structopt(long = "no-pretest")]
    no_pretest: bool,

    /// Time allowed for each test connection
    #[structopt(long = "pretest-timeout", default_value = "5s", parse(try_from_str = humantime::parse_duration))]
    pretest_timeout: Duration,

    /// Log a line per second instead of drawing the full-screen display
    #[structopt(long = "plain")]
    plain: bool,
}

fn build_config(opt: &Opt) -> Result<Config> {
    if opt.concurrency == 0 {
        return Err(Error::Config("concurrency must be at least 1".to_string()));
    }
    let url = config::parse_url(&opt.url)?;

    let targets = match &opt.target_ip {
        Some(list) => config::resolve_list(list, url.port)?,
        None => config::resolve_list(&url.host, url.port)?,
    };
    let sources = match &opt.source_ip {
        Some(list) => config::resolve_list(list, 0)?,
        None => Vec::new(),
    };
    let addresses = AddressPool::new(targets, sources)?;

    let host = if url.port == 80 {
        url.host.clone()
    } else if url.host.contains(':') {
        format!("[{}]:{}", url.host, url.port)
    } else {
        format!("{}:{}", url.host, url.port)
    };
    let mut template = RequestTemplate::new(&host, &url.path);
    if let Some(method) = &opt.method {
        template.edit("method", method);
    }
    if let Some(version) = &opt.http_version {
        template.edit("version", version);
    }
    for header in &opt.headers {
        if template.edit_header_line(header).is_none() {
            return Err(Error::Config(format!("bad header: {}", header)));
        }
    }

    Ok(Config {
        concurrency: opt.concurrency,
        request_count: opt.count,
        duration: opt.duration,
        server_name: url.host,
        server_port: url.port,
        addresses,
        request: template.freeze(),
        shutdown: opt.shutdown,
    })
}

/// Scales a byte count to the largest binary unit that keeps it at or above
/// one, stopping at gigabytes.
fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:>6.2}{}", value, UNITS[unit])
}

fn print_results(opt: &Opt, config: &Config, duration: Duration, stats: &Statistics) {
    // whole milliseconds are plenty for the report
    let duration = Duration::from_millis(duration.as_millis() as u64);
    let secs = duration.as_secs_f64().max(1e-3);
    let con = &stats.con;
    let http = &stats.http;

    println!(
        "Running {} test @ {}",
        humantime::format_duration(duration),
        opt.url
    );
    println!("  {} connections", config.concurrency);
    if let Some(title) = &stats.title {
        println!("  Title: {}", title);
    }
    println!();
    println!(
        "  Connections: {} attempted, {} succeeded, {} failed, {} errors",
        con.attempted.total, con.succeeded.total, con.failed.total, con.error.total
    );
    println!(
        "  Closed by: {} read end, {} hangup, {} hangup2, {} pipeline, {} unknown",
        con.read_end.total,
        con.hangup.total,
        con.hangup2.total,
        con.pipeline.total,
        con.unknown.total
    );
    println!(
        "  {} requests in {}, {} read",
        http.received.total,
        humantime::format_duration(duration),
        format_bytes(http.bytes_received.total as f64)
    );
    let non_2xx = http.n1xx.total + http.n3xx.total + http.n4xx.total + http.n5xx.total;
    if non_2xx > 0 {
        println!("  Non-2xx responses: {}", non_2xx);
    }
    if http.parse_error.total > 0 {
        println!("  Malformed responses: {}", http.parse_error.total);
    }
    println!("Requests/sec:{:>10.2}", http.received.total as f64 / secs);
    println!(
        "Transfer/sec:    {}",
        format_bytes(http.bytes_received.total as f64 / secs)
    );
}

fn run(opt: &Opt) -> Result<()> {
    let config = build_config(opt)?;

    if !opt.no_pretest {
        pretest::check(&config.addresses, opt.pretest_timeout)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .map_err(|err| Error::Config(format!("signal handler: {}", err)))?;
    }

    let rng = match opt.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut client = Client::new(&config, rng)?;

    let result = if opt.plain {
        client.run(&stop, |stats, concurrency| {
            info!("{}", tui::summary_line(stats, concurrency))
        })
    } else {
        let screen = tui::Screen::new()?;
        client.run(&stop, |stats, concurrency| {
            screen.render(&config, stats, concurrency)
        })
    };
    result?;

    let stats = client.stats();
    print_results(opt, &config, stats.elapsed(Instant::now()), stats);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    if let Err(err) = run(&opt) {
        error!("{}", err);
        if let Some(hint) = err.hint() {
            error!("FATAL: {}", hint);
        }
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(args: &[&str]) -> Opt {
        let mut argv = vec!["swarm"];
        argv.extend_from_slice(args);
        Opt::from_iter(argv)
    }

    #[test]
    fn config_from_options() {
        let opt = opt(&[
            "-c",
            "50",
            "-n",
            "1000",
            "--targetip",
            "10.0.0.1,10.0.0.2",
            "-X",
            "HEAD",
            "-H",
            "Connection: close",
            "http://example.com:8080/index.html",
        ]);
        let config = build_config(&opt).unwrap();
        assert_eq!(config.concurrency, 50);
        assert_eq!(config.request_count, Some(1000));
        assert_eq!(config.server_name, "example.com");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.addresses.targets().len(), 2);
        assert!(config.addresses.sources().is_empty());

        let request = std::str::from_utf8(&config.request).unwrap();
        assert!(request.starts_with("HEAD /index.html HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:8080\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn durations_use_humantime() {
        let opt = opt(&["-d", "1m 30s", "--targetip", "127.0.0.1", "http://localhost/"]);
        assert_eq!(opt.duration, Some(Duration::from_secs(90)));
        assert_eq!(opt.pretest_timeout, Duration::from_secs(5));
        let config = build_config(&opt).unwrap();
        let request = std::str::from_utf8(&config.request).unwrap();
        assert!(request.contains("Host: localhost\r\n"));
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(build_config(&opt(&["-c", "0", "--targetip", "127.0.0.1", "http://a/"])).is_err());
        assert!(build_config(&opt(&["--targetip", "127.0.0.1", "-H", "bad", "http://a/"])).is_err());
        match build_config(&opt(&[
            "--targetip",
            "10.0.0.1",
            "--sourceip",
            "::1",
            "http://a/",
        ])) {
            Err(Error::NoCompatibleSource) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(512.0), "512.00B");
        assert_eq!(format_bytes(2048.0), "  2.00KB");
        assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0), "  3.00MB");
        assert_eq!(format_bytes(1023.0), "1023.00B");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0), "5120.00GB");
    }
}
