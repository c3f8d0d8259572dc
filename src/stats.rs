use std::time::{Duration, Instant};

/// Weight of the newest sample in the smoothed rate.
const RATE_SMOOTHING: f64 = 0.1;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Counter {
    pub total: u64,
    last: u64,
    /// Smoothed events per second.
    pub rate: f64,
}

impl Counter {
    pub fn inc(&mut self) {
        self.total += 1;
    }

    pub fn add(&mut self, delta: u64) {
        self.total += delta;
    }

    fn update_rate(&mut self, elapsed: Duration) {
        let diff = self.total - self.last;
        let sample = diff as f64 / elapsed.as_secs_f64();
        self.rate = self.rate * (1.0 - RATE_SMOOTHING) + sample * RATE_SMOOTHING;
        self.last = self.total;
    }
}

/// Connection-level counters.
#[derive(Clone, Debug, Default)]
pub struct ConnectionCounters {
    pub attempted: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub error: Counter,
    pub read_end: Counter,
    pub hangup: Counter,
    pub hangup2: Counter,
    pub pipeline: Counter,
    pub unknown: Counter,
}

/// Request/response counters.
#[derive(Clone, Debug, Default)]
pub struct HttpCounters {
    pub sent: Counter,
    pub received: Counter,
    pub parse_error: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub n1xx: Counter,
    pub n2xx: Counter,
    pub n3xx: Counter,
    pub n4xx: Counter,
    pub n5xx: Counter,
}

/// Totals and smoothed rates for a run.
///
/// Counters are bumped as events happen; rates are only recomputed by
/// `calculate_rates`, once per reporting tick.
#[derive(Clone, Debug)]
pub struct Statistics {
    pub con: ConnectionCounters,
    pub http: HttpCounters,
    /// First HTML title seen in any response.
    pub title: Option<String>,
    started: Instant,
    last_time: Instant,
}

impl Statistics {
    pub fn new(now: Instant) -> Statistics {
        Self {
            con: ConnectionCounters::default(),
            http: HttpCounters::default(),
            title: None,
            started: now,
            last_time: now,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Records a completed response by status class.
    pub fn response(&mut self, status: u16, is_error: bool) {
        self.http.received.inc();
        if is_error {
            self.http.parse_error.inc();
            return;
        }
        match status / 100 {
            1 => self.http.n1xx.inc(),
            2 => self.http.n2xx.inc(),
            3 => self.http.n3xx.inc(),
            4 => self.http.n4xx.inc(),
            5 => self.http.n5xx.inc(),
            _ => {}
        }
    }

    pub fn record_title(&mut self, title: &[u8]) {
        if self.title.is_none() && !title.is_empty() {
            self.title = Some(String::from_utf8_lossy(title).trim().to_string());
        }
    }

    fn counters_mut(&mut self) -> [&mut Counter; 19] {
        let con = &mut self.con;
        let http = &mut self.http;
        [
            &mut con.attempted,
            &mut con.succeeded,
            &mut con.failed,
            &mut con.error,
            &mut con.read_end,
            &mut con.hangup,
            &mut con.hangup2,
            &mut con.pipeline,
            &mut con.unknown,
            &mut http.sent,
            &mut http.received,
            &mut http.parse_error,
            &mut http.bytes_sent,
            &mut http.bytes_received,
            &mut http.n1xx,
            &mut http.n2xx,
            &mut http.n3xx,
            &mut http.n4xx,
            &mut http.n5xx,
        ]
    }

    /// Folds the counts since the previous call into each smoothed rate.
    /// A call with no time elapsed since the previous one is ignored.
    pub fn calculate_rates(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_time);
        if elapsed == Duration::from_secs(0) {
            return;
        }
        self.last_time = now;
        for counter in self.counters_mut().iter_mut() {
            counter.update_rate(elapsed);
        }
    }
}
