//! # Capture Log Replay
//!
//! Drives a [`Requests`] session from a recorded capture log, one JSON
//! [`CaptureEvent`] per line. A manual [`TestRun`] clock is moved to each
//! event's tick before the event is delivered, so `now()` during replay is
//! exactly what it was during capture.
//!
//! ```text
//! {"event":"dns_lookup","host":"example.com","start_tick":1000,"end_tick":4000}
//! {"event":"connect","socket":7,"start_tick":4100,"end_tick":9000}
//! {"event":"data_out","socket":7,"tick":9100,"payload":"GET / HTTP/1.1\r\n\r\n"}
//! {"event":"data_in","socket":7,"tick":30000,"payload":"HTTP/1.1 200 OK\r\n\r\n"}
//! {"event":"closed","socket":7,"tick":31000}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use reqscope_common::CaptureEvent;

use crate::collaborators::{ConnectTiming, DnsLookup, DnsTable, SocketTable, TestRun};
use crate::config::ReqscopeConfig;
use crate::domain::{ReplayError, SocketId, Tick};
use crate::orchestrator::{Reconciled, Requests};
use crate::request::DataChunk;

/// Capture clock of a replayed log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayClock {
    pub ticks_per_ms: i64,
    /// Run start tick; defaults to the first event's tick
    pub run_start: Option<i64>,
}

impl Default for ReplayClock {
    fn default() -> Self {
        Self { ticks_per_ms: 1_000, run_start: None }
    }
}

/// Counters collected while replaying
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub reports_accepted: usize,
    pub reports_rejected: usize,
    pub reports_skipped: usize,
    pub resets: usize,
}

/// A session plus the reference collaborators feeding it
pub struct Replay {
    run: Arc<TestRun>,
    dns: Arc<DnsTable>,
    sockets: Arc<SocketTable>,
    session: Requests,
    summary: ReplaySummary,
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay").field("summary", &self.summary).finish_non_exhaustive()
    }
}

impl Replay {
    /// Build an active session whose clock starts at `run_start`
    ///
    /// # Errors
    /// Returns an error if `ticks_per_ms` is not positive
    pub fn new(config: ReqscopeConfig, run_start: Tick, ticks_per_ms: i64) -> Result<Self, ReplayError> {
        if ticks_per_ms <= 0 {
            return Err(ReplayError::InvalidFrequency(ticks_per_ms));
        }
        let run = Arc::new(TestRun::manual(run_start, ticks_per_ms));
        run.set_active(true);
        let dns = Arc::new(DnsTable::new());
        let sockets = Arc::new(SocketTable::new());
        let session = Requests::new(config, run.clone(), dns.clone(), sockets.clone());
        Ok(Self { run, dns, sockets, session, summary: ReplaySummary::default() })
    }

    /// Deliver one event
    pub fn apply(&mut self, event: &CaptureEvent) {
        self.summary.events += 1;
        self.run.set_now(Tick(event.tick()));
        match event {
            CaptureEvent::DnsLookup { host, addresses, start_tick, end_tick } => {
                let addresses = parse_addresses(host, addresses);
                self.dns.record(host, DnsLookup { addresses, start: Tick(*start_tick), end: Tick(*end_tick) });
            }
            CaptureEvent::Connect { socket, start_tick, end_tick } => {
                self.sockets.record_connect(
                    SocketId(*socket),
                    ConnectTiming { start: Tick(*start_tick), end: Tick(*end_tick) },
                );
            }
            CaptureEvent::DataOut { socket, tick, payload } => {
                let mut chunk = DataChunk::copy_from_slice(Tick(*tick), payload.as_bytes());
                self.session.on_modify_data_out(SocketId(*socket), &mut chunk);
                self.session.on_data_out(SocketId(*socket), chunk);
            }
            CaptureEvent::DataIn { socket, tick, payload } => {
                let chunk = DataChunk::copy_from_slice(Tick(*tick), payload.as_bytes());
                self.session.on_data_in(SocketId(*socket), chunk);
            }
            CaptureEvent::Closed { socket, .. } => self.session.on_socket_closed(SocketId(*socket)),
            CaptureEvent::BrowserRequest { record, .. } => match self.session.on_browser_reported_request(record) {
                Reconciled::Accepted(_) => self.summary.reports_accepted += 1,
                Reconciled::Rejected(_) => self.summary.reports_rejected += 1,
                Reconciled::Skipped | Reconciled::Inactive => self.summary.reports_skipped += 1,
            },
            CaptureEvent::Reset { .. } => {
                self.summary.resets += 1;
                self.session.reset();
            }
        }
    }

    #[must_use]
    pub fn session(&self) -> &Requests {
        &self.session
    }

    #[must_use]
    pub fn summary(&self) -> ReplaySummary {
        self.summary
    }
}

fn parse_addresses(host: &str, addresses: &[String]) -> Vec<IpAddr> {
    addresses
        .iter()
        .filter_map(|address| match address.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Ignoring unparsable address {address:?} for {host}");
                None
            }
        })
        .collect()
}

/// Parse a JSON-lines capture log. Blank lines and `#` comments are skipped.
///
/// # Errors
/// Returns the first malformed line with its (1-based) line number, or an
/// I/O error
pub fn read_events(reader: impl BufRead) -> Result<Vec<CaptureEvent>, ReplayError> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed)
            .map_err(|source| ReplayError::MalformedEvent { line: index + 1, source })?;
        events.push(event);
    }
    Ok(events)
}

/// Replay `events` through a fresh session
///
/// # Errors
/// Returns an error if the clock settings are invalid
pub fn replay_events(events: &[CaptureEvent], config: ReqscopeConfig, clock: ReplayClock) -> Result<Replay, ReplayError> {
    let run_start = clock.run_start.or_else(|| events.first().map(CaptureEvent::tick)).unwrap_or(0);
    let mut replay = Replay::new(config, Tick(run_start), clock.ticks_per_ms)?;
    for event in events {
        replay.apply(event);
    }
    debug!("Replayed {} events: {:?}", events.len(), replay.summary());
    Ok(replay)
}

/// Read and replay a capture log file
///
/// # Errors
/// Returns an error if the file cannot be read, contains a malformed event,
/// or the clock settings are invalid
pub fn replay_file(path: &Path, config: ReqscopeConfig, clock: ReplayClock) -> Result<Replay> {
    let file = File::open(path).with_context(|| format!("Failed to open capture log {}", path.display()))?;
    let events = read_events(BufReader::new(file))
        .with_context(|| format!("Failed to read capture log {}", path.display()))?;
    let replay = replay_events(&events, config, clock)?;
    Ok(replay)
}
