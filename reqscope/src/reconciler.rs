//! # Timing Reconciliation
//!
//! Maps an application-reported [`TimingRecord`] onto the capture clock and
//! turns it into a [`Request`].
//!
//! ## Clock Anchoring
//!
//! The application reports wall-clock milliseconds; the capture layer stamps
//! everything with capture-clock ticks. The two are tied together once per run
//! using a moment both sides observed: the end of a DNS lookup.
//!
//! ```text
//! anchor = (startTime + timing.dnsEnd) - elapsed_ms(run_start → captured dns end)
//! end    = run_start + (endTime - anchor) * ticks_per_ms
//! ```
//!
//! Until an anchor exists, a record's end is pinned to the moment it is
//! processed.
//!
//! ## Phase Timestamps
//!
//! `timing.*` offsets are relative to the request's own start (the
//! *baseline*). `sendStart` moves the start itself; DNS, connect and SSL are
//! only filled in the first time a connection id is seen, and an SSL phase
//! truncates the connect phase so the two are sequential.
//!
//! ## Sanity Filter
//!
//! Some application builds report wildly wrong times. Every populated
//! timestamp must lie strictly inside `(run_start - slop, now + slop)` or the
//! whole request is dropped.

use std::collections::HashSet;

use log::{debug, info};

use crate::collaborators::{DnsTracker, RunState};
use crate::domain::{ConnectionId, Tick};
use crate::request::{DataChunk, Initiator, ReportedDetails, Request, RequestTimings};
use crate::timing_record::TimingRecord;

/// Offset translating application-clock milliseconds to the capture clock.
///
/// Holds the application-clock time (ms) that corresponds to the run start.
/// Owned by the session and reset with it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockAnchor {
    browser_start_ms: Option<f64>,
}

impl ClockAnchor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.browser_start_ms.is_some()
    }

    /// Application-clock milliseconds at the run start, once established
    #[must_use]
    pub fn browser_start_ms(&self) -> Option<f64> {
        self.browser_start_ms
    }

    /// Set the anchor if it is not set yet. Returns true if this call set it.
    pub fn establish(&mut self, browser_start_ms: f64) -> bool {
        if self.browser_start_ms.is_some() {
            return false;
        }
        self.browser_start_ms = Some(browser_start_ms);
        true
    }
}

/// Why a synthesized request was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A timestamp fell outside the sanity window
    OutOfBounds { field: &'static str, tick: Tick },
    /// The computed end precedes the computed start
    EndBeforeStart { start: Tick, end: Tick },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::OutOfBounds { field, tick } => write!(f, "{field} {tick} outside sanity window"),
            Rejection::EndBeforeStart { start, end } => write!(f, "end {end} before start {start}"),
        }
    }
}

/// Open interval of acceptable capture-clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanityWindow {
    pub earliest: Tick,
    pub latest: Tick,
}

impl SanityWindow {
    #[must_use]
    pub fn new(run_start: Tick, now: Tick, slop_ticks: i64) -> Self {
        Self {
            earliest: Tick(run_start.0.saturating_sub(slop_ticks)),
            latest: Tick(now.0.saturating_add(slop_ticks)),
        }
    }

    /// Strictly inside the window; both bounds are excluded
    #[must_use]
    pub fn admits(&self, tick: Tick) -> bool {
        self.earliest < tick && tick < self.latest
    }

    /// Check every populated timestamp
    ///
    /// # Errors
    /// Returns the first timestamp outside the window
    pub fn check(&self, timings: &RequestTimings) -> Result<(), Rejection> {
        match timings.populated().find(|(_, tick)| !self.admits(*tick)) {
            Some((field, tick)) => Err(Rejection::OutOfBounds { field, tick }),
            None => Ok(()),
        }
    }
}

/// Converts timing records into requests on the capture clock.
///
/// Borrowed collaborators only; the mutable per-run state (anchor, seen
/// connections) is passed in by the caller, which holds the registry lock.
pub struct Reconciler<'a> {
    run: &'a dyn RunState,
    dns: &'a dyn DnsTracker,
    slop_ms: i64,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(run: &'a dyn RunState, dns: &'a dyn DnsTracker, slop_ms: i64) -> Self {
        Self { run, dns, slop_ms }
    }

    /// Width of the sanity margin in ticks
    #[must_use]
    pub fn slop_ticks(&self) -> i64 {
        self.run.ticks_per_ms().saturating_mul(self.slop_ms)
    }

    /// Build a request from `record`.
    ///
    /// Returns `Ok(None)` when the record lacks a URL, an initiator, or a
    /// positive start and end time.
    /// Side effects on `anchor` and `connections` happen even if the request
    /// is later rejected.
    ///
    /// # Errors
    /// Returns a [`Rejection`] if the synthesized request fails the sanity
    /// filter
    pub fn reconcile(
        &self,
        record: &TimingRecord,
        anchor: &mut ClockAnchor,
        connections: &mut HashSet<ConnectionId>,
        now: Tick,
    ) -> Result<Option<Request>, Rejection> {
        let start_ms = record.effective_start_ms();
        let end_ms = record.end_time_ms;
        if !(record.has_initiator() && end_ms > 0.0 && start_ms > 0.0) {
            return Ok(None);
        }

        let url = record.url.clone().unwrap_or_default();
        if !anchor.is_established() {
            if let Some(dns_end) = record.timing.dns_end.filter(|&offset| offset != -1) {
                self.try_anchor(anchor, &url, start_ms, dns_end);
            }
        }

        let connection = ConnectionId(record.connection_id);
        let already_connected = connection.is_known() && !connections.insert(connection);

        let mut request = Request::reported(connection, reported_details(record, &url));
        request.is_ssl = url.starts_with("https:");
        request.timings = self.timeline(record, anchor, start_ms, now, already_connected);
        attach_headers(&mut request, record);

        if let (Some(start), Some(end)) = (request.timings.start, request.timings.end) {
            if end < start {
                return Err(Rejection::EndBeforeStart { start, end });
            }
        }
        SanityWindow::new(self.run.start(), now, self.slop_ticks()).check(&request.timings)?;
        Ok(Some(request))
    }

    fn try_anchor(&self, anchor: &mut ClockAnchor, url: &str, start_ms: f64, dns_end_offset: i64) {
        let Some(host) = host_of(url) else {
            debug!("Cannot anchor clocks: no host in {url:?}");
            return;
        };
        let Some(lookup) = self.dns.find(&host) else {
            debug!("Cannot anchor clocks: no DNS lookup recorded for {host}");
            return;
        };
        #[allow(clippy::cast_precision_loss)]
        let dns_end_clock_ms = start_ms + dns_end_offset as f64;
        let browser_start_ms = dns_end_clock_ms - self.run.elapsed_ms(lookup.end);
        if anchor.establish(browser_start_ms) {
            info!("Clock anchor established from {host} DNS end {}: {browser_start_ms:.3}ms", lookup.end);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn timeline(
        &self,
        record: &TimingRecord,
        anchor: &ClockAnchor,
        start_ms: f64,
        now: Tick,
        already_connected: bool,
    ) -> RequestTimings {
        let ticks_per_ms = self.run.ticks_per_ms();
        let end_ms = record.end_time_ms;
        let phase = &record.timing;
        let mut timings = RequestTimings::default();

        let end = match anchor.browser_start_ms() {
            Some(browser_start) => self.run.start().offset_ms(end_ms - browser_start, ticks_per_ms),
            None => now,
        };
        let start = end.offset_ms(-(end_ms - start_ms), ticks_per_ms);
        timings.end = Some(end);
        timings.start = Some(start);
        if record.first_byte_ms > 0.0 {
            timings.first_byte = Some(end.offset_ms(-(end_ms - record.first_byte_ms), ticks_per_ms));
        }

        let baseline = start;
        let at = |offset: i64| baseline.offset_ms(offset as f64, ticks_per_ms);

        let send_start = phase.send_start.unwrap_or(-1);
        if send_start >= 0 {
            timings.start = Some(at(send_start));
        }
        if let Some(headers_end) = phase.receive_headers_end {
            if headers_end != -1 && headers_end >= send_start {
                timings.first_byte = Some(at(headers_end));
            }
        }

        if !already_connected {
            if let (Some(dns_start), Some(dns_end)) = (phase.dns_start, phase.dns_end) {
                if dns_start > -1 && dns_end > -1 {
                    timings.dns_start = Some(at(dns_start));
                    timings.dns_end = Some(at(dns_end));
                }
            }
            if let (Some(connect_start), Some(mut connect_end)) = (phase.connect_start, phase.connect_end) {
                if connect_start > -1 && connect_end > -1 {
                    if let (Some(ssl_start), Some(ssl_end)) = (phase.ssl_start, phase.ssl_end) {
                        if ssl_start > -1 && ssl_end > -1 {
                            connect_end = ssl_start;
                            timings.ssl_start = Some(at(ssl_start));
                            timings.ssl_end = Some(at(ssl_end));
                        }
                    }
                    timings.connect_start = Some(at(connect_start));
                    timings.connect_end = Some(at(connect_end));
                }
            }
        }
        timings
    }
}

fn reported_details(record: &TimingRecord, url: &str) -> ReportedDetails {
    ReportedDetails {
        url: url.to_owned(),
        browser: record.browser.clone(),
        status: record.status,
        error_code: record.error_code,
        bytes_in: record.bytes_in,
        initiator: Initiator {
            url: record.initiator_url.clone().unwrap_or_default(),
            line: record.initiator_line.clone().unwrap_or_default(),
            column: record.initiator_column.clone().unwrap_or_default(),
        },
    }
}

/// Header blobs become the request's captured data, closed by a blank line
fn attach_headers(request: &mut Request, record: &TimingRecord) {
    let start = request.timings.start.unwrap_or_default();
    if !record.request_headers.is_empty() {
        let blob = format!("{}\r\n", record.request_headers);
        request.request_data.push(DataChunk::new(start, blob.into_bytes()));
    }
    if !record.response_headers.is_empty() {
        let tick = request.timings.first_byte.or(request.timings.end).unwrap_or(start);
        let blob = format!("{}\r\n", record.response_headers);
        request.response_data.push(DataChunk::new(tick, blob.into_bytes()));
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{DnsLookup, DnsTable, TestRun};
    use crate::timing_record;

    /// 1 tick = 1µs, run starts at tick 1_000_000_000, processing at +60s
    fn run() -> TestRun {
        let run = TestRun::manual(Tick(1_000_000_000), 1_000);
        run.set_now(Tick(1_060_000_000));
        run
    }

    fn reconcile(run: &TestRun, dns: &DnsTable, text: &str) -> (Result<Option<Request>, Rejection>, ClockAnchor) {
        let mut anchor = ClockAnchor::new();
        let mut connections = HashSet::new();
        let reconciler = Reconciler::new(run, dns, 10_000);
        let record = timing_record::parse(text);
        let result = reconciler.reconcile(&record, &mut anchor, &mut connections, run.now());
        (result, anchor)
    }

    #[test]
    fn test_window_bounds_are_exclusive() {
        let window = SanityWindow::new(Tick(100), Tick(200), 10);
        assert!(!window.admits(Tick(90)));
        assert!(window.admits(Tick(91)));
        assert!(window.admits(Tick(209)));
        assert!(!window.admits(Tick(210)));
    }

    #[test]
    fn test_window_check_names_offending_field() {
        let window = SanityWindow::new(Tick(100), Tick(200), 10);
        let timings = RequestTimings {
            start: Some(Tick(120)),
            end: Some(Tick(150)),
            dns_start: Some(Tick(5)),
            ..Default::default()
        };
        assert_eq!(
            window.check(&timings),
            Err(Rejection::OutOfBounds { field: "dns_start", tick: Tick(5) })
        );
    }

    #[test]
    fn test_anchor_is_set_once() {
        let mut anchor = ClockAnchor::new();
        assert!(anchor.establish(5.0));
        assert!(!anchor.establish(9.0));
        assert_eq!(anchor.browser_start_ms(), Some(5.0));
    }

    #[test]
    fn test_incomplete_record_is_skipped() {
        let (result, _) = reconcile(&run(), &DnsTable::new(), "url=http://a/\ninitiatorUrl=http://a/app.js\nendTime=1.5");
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_record_without_initiator_is_skipped() {
        let dns = DnsTable::new();
        let (result, anchor) = reconcile(&run(), &dns, "url=http://a/\nstartTime=1.000\nendTime=1.500");
        assert_eq!(result, Ok(None));
        assert!(!anchor.is_established());
        let (result, _) = reconcile(&run(), &dns, "initiatorUrl=http://a/app.js\nstartTime=1.000\nendTime=1.500");
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_huge_offset_is_out_of_bounds() {
        let (result, _) = reconcile(
            &run(),
            &DnsTable::new(),
            "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\ntiming.dnsStart=0\ntiming.dnsEnd=1e18",
        );
        assert!(matches!(result, Err(Rejection::OutOfBounds { field: "dns_end", .. })));
    }

    #[test]
    fn test_unanchored_end_is_now() {
        let run = run();
        let (result, anchor) =
            reconcile(&run, &DnsTable::new(), "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1.000\nendTime=1.500");
        let request = result.unwrap().unwrap();
        assert!(!anchor.is_established());
        assert_eq!(request.timings.end, Some(run.now()));
        assert_eq!(request.timings.start, Some(Tick(run.now().0 - 500_000)));
        assert!(!request.is_ssl);
    }

    #[test]
    fn test_anchor_from_dns_lookup() {
        let run = run();
        let dns = DnsTable::new();
        // Captured DNS end 2s into the run
        dns.record("example.com", DnsLookup { addresses: Vec::new(), start: Tick(1_001_000_000), end: Tick(1_002_000_000) });
        let (result, anchor) = reconcile(
            &run,
            &dns,
            "url=https://example.com/\ninitiatorUrl=http://a/app.js\nstartTime=100.000\nendTime=100.500\ntiming.dnsEnd=20",
        );
        // (100000 + 20) - 2000
        assert_eq!(anchor.browser_start_ms(), Some(98_020.0));
        let request = result.unwrap().unwrap();
        // end = run_start + (100500 - 98020)ms
        assert_eq!(request.timings.end, Some(Tick(1_000_000_000 + 2_480_000)));
        assert_eq!(request.timings.start, Some(Tick(1_000_000_000 + 1_980_000)));
        assert!(request.is_ssl);
    }

    #[test]
    fn test_phase_timestamps_from_baseline() {
        let run = run();
        let (result, _) = reconcile(
            &run,
            &DnsTable::new(),
            "url=https://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\nconnectionId=3\n\
             timing.dnsStart=0\ntiming.dnsEnd=10\n\
             timing.connectStart=10\ntiming.connectEnd=80\n\
             timing.sslStart=30\ntiming.sslEnd=80\n\
             timing.sendStart=81\ntiming.receiveHeadersEnd=400",
        );
        let t = result.unwrap().unwrap().timings;
        let baseline = run.now().0 - 1_000_000;
        assert_eq!(t.start, Some(Tick(baseline + 81_000)));
        assert_eq!(t.first_byte, Some(Tick(baseline + 400_000)));
        assert_eq!(t.dns_start, Some(Tick(baseline)));
        assert_eq!(t.dns_end, Some(Tick(baseline + 10_000)));
        assert_eq!(t.connect_start, Some(Tick(baseline + 10_000)));
        // connect truncated at SSL start
        assert_eq!(t.connect_end, Some(Tick(baseline + 30_000)));
        assert_eq!(t.ssl_start, Some(Tick(baseline + 30_000)));
        assert_eq!(t.ssl_end, Some(Tick(baseline + 80_000)));
    }

    #[test]
    fn test_negative_offsets_mean_absent() {
        let (result, _) = reconcile(
            &run(),
            &DnsTable::new(),
            "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\ntiming.dnsStart=-1\ntiming.dnsEnd=-1\n\
             timing.sendStart=-1\ntiming.receiveHeadersEnd=-1",
        );
        let t = result.unwrap().unwrap().timings;
        assert_eq!(t.dns_start, None);
        assert_eq!(t.first_byte, None);
    }

    #[test]
    fn test_first_byte_from_record() {
        let run = run();
        let (result, _) =
            reconcile(&run, &DnsTable::new(), "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\nfirstByteTime=1.25");
        let t = result.unwrap().unwrap().timings;
        assert_eq!(t.first_byte, Some(Tick(run.now().0 - 750_000)));
    }

    #[test]
    fn test_reused_connection_skips_connection_phases() {
        let run = run();
        let dns = DnsTable::new();
        let reconciler = Reconciler::new(&run, &dns, 10_000);
        let mut anchor = ClockAnchor::new();
        let mut connections = HashSet::new();
        let text = "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\nconnectionId=9\n\
                    timing.connectStart=0\ntiming.connectEnd=5";
        let record = timing_record::parse(text);

        let first = reconciler.reconcile(&record, &mut anchor, &mut connections, run.now()).unwrap().unwrap();
        let second = reconciler.reconcile(&record, &mut anchor, &mut connections, run.now()).unwrap().unwrap();
        assert!(first.timings.connect_start.is_some());
        assert!(second.timings.connect_start.is_none());
    }

    #[test]
    fn test_unknown_connection_is_never_reused() {
        let run = run();
        let dns = DnsTable::new();
        let reconciler = Reconciler::new(&run, &dns, 10_000);
        let mut anchor = ClockAnchor::new();
        let mut connections = HashSet::new();
        let record = timing_record::parse("url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\ntiming.connectStart=0\ntiming.connectEnd=5");
        for _ in 0..2 {
            let request = reconciler.reconcile(&record, &mut anchor, &mut connections, run.now()).unwrap().unwrap();
            assert!(request.timings.connect_end.is_some());
        }
        assert!(connections.is_empty());
    }

    #[test]
    fn test_send_start_past_end_is_rejected() {
        let (result, _) =
            reconcile(&run(), &DnsTable::new(), "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=1.1\ntiming.sendStart=500");
        assert!(matches!(result, Err(Rejection::EndBeforeStart { .. })));
    }

    #[test]
    fn test_headers_attached_with_blank_line() {
        let (result, _) = reconcile(
            &run(),
            &DnsTable::new(),
            "url=http://a/\ninitiatorUrl=http://a/app.js\nstartTime=1\nendTime=2\n[Request Headers]\nGET / HTTP/1.1\n[Response Headers]\nHTTP/1.1 200 OK",
        );
        let request = result.unwrap().unwrap();
        assert_eq!(request.request_data.to_vec(), b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.response_data.to_vec(), b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://Example.com:8443/a?b").as_deref(), Some("example.com"));
        assert_eq!(host_of("not a url"), None);
    }
}
