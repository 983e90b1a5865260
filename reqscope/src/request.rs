//! Logical request model.
//!
//! A [`Request`] is one HTTP or SPDY exchange. Requests come from two places:
//! the wire (created when the sniffer recognises a request preamble on a
//! socket) and the instrumented application's own timing reports (synthesized
//! by the reconciler). Both end up in the same ordered collection and share
//! one capture-clock timeline.

use bytes::Bytes;
use std::fmt;

use crate::collaborators::ConnectTiming;
use crate::config::{HeaderAction, HeaderRule};
use crate::domain::{ConnectionId, Protocol, RequestId, SocketId, Tick};

// =============================================================================
// CAPTURED DATA
// =============================================================================

/// Bytes observed on a socket at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    tick: Tick,
    data: Bytes,
}

impl DataChunk {
    pub fn new(tick: Tick, data: impl Into<Bytes>) -> Self {
        Self { tick, data: data.into() }
    }

    /// Copy `data` into a new chunk
    #[must_use]
    pub fn copy_from_slice(tick: Tick, data: &[u8]) -> Self {
        Self { tick, data: Bytes::copy_from_slice(data) }
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Swap in rewritten bytes (outbound modification)
    pub fn replace(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }

    /// Keep at most `max` bytes
    pub fn truncate(&mut self, max: usize) {
        self.data.truncate(max);
    }
}

/// Ordered chunks for one direction of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteStream {
    chunks: Vec<DataChunk>,
    size: usize,
}

impl ByteStream {
    pub fn push(&mut self, chunk: DataChunk) {
        self.size += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total bytes across all chunks
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn chunks(&self) -> &[DataChunk] {
        &self.chunks
    }

    /// All chunks concatenated
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.data());
        }
        out
    }
}

// =============================================================================
// TIMINGS
// =============================================================================

/// Phase boundaries of a request on the capture clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTimings {
    pub start: Option<Tick>,
    pub end: Option<Tick>,
    pub first_byte: Option<Tick>,
    pub dns_start: Option<Tick>,
    pub dns_end: Option<Tick>,
    pub connect_start: Option<Tick>,
    pub connect_end: Option<Tick>,
    pub ssl_start: Option<Tick>,
    pub ssl_end: Option<Tick>,
}

impl RequestTimings {
    /// Every populated timestamp with its name
    pub fn populated(&self) -> impl Iterator<Item = (&'static str, Tick)> {
        [
            ("start", self.start),
            ("end", self.end),
            ("first_byte", self.first_byte),
            ("dns_start", self.dns_start),
            ("dns_end", self.dns_end),
            ("connect_start", self.connect_start),
            ("connect_end", self.connect_end),
            ("ssl_start", self.ssl_start),
            ("ssl_end", self.ssl_end),
        ]
        .into_iter()
        .filter_map(|(name, tick)| tick.map(|tick| (name, tick)))
    }

    pub fn dns_ms(&self, ticks_per_ms: i64) -> Option<f64> {
        span_ms(self.dns_start, self.dns_end, ticks_per_ms)
    }

    pub fn connect_ms(&self, ticks_per_ms: i64) -> Option<f64> {
        span_ms(self.connect_start, self.connect_end, ticks_per_ms)
    }

    pub fn ssl_ms(&self, ticks_per_ms: i64) -> Option<f64> {
        span_ms(self.ssl_start, self.ssl_end, ticks_per_ms)
    }

    /// Start to first response byte
    pub fn ttfb_ms(&self, ticks_per_ms: i64) -> Option<f64> {
        span_ms(self.start, self.first_byte, ticks_per_ms)
    }

    pub fn total_ms(&self, ticks_per_ms: i64) -> Option<f64> {
        span_ms(self.start, self.end, ticks_per_ms)
    }
}

fn span_ms(from: Option<Tick>, to: Option<Tick>, ticks_per_ms: i64) -> Option<f64> {
    Some(to?.ms_since(from?, ticks_per_ms))
}

// =============================================================================
// REQUEST
// =============================================================================

/// Script-level origin of an application-reported request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Initiator {
    pub url: String,
    /// Line and column are kept exactly as reported
    pub line: String,
    pub column: String,
}

/// Side-channel record tying a URL to the script that requested it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserRequestData {
    pub url: String,
    pub initiator: Initiator,
}

/// Where a request was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// Captured from socket traffic
    Wire(SocketId),
    /// Synthesized from the application's timing report
    Browser(ConnectionId),
}

impl RequestSource {
    /// Numeric connection key (socket id or application connection id)
    #[must_use]
    pub fn connection_key(self) -> u64 {
        match self {
            RequestSource::Wire(socket) => socket.0,
            RequestSource::Browser(connection) => connection.0,
        }
    }
}

/// Values the application reported alongside its timings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportedDetails {
    pub url: String,
    pub browser: Option<String>,
    pub status: i64,
    pub error_code: i64,
    pub bytes_in: i64,
    pub initiator: Initiator,
}

/// One logical HTTP/SPDY exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: RequestId,
    pub source: RequestSource,
    pub is_spdy: bool,
    pub is_ssl: bool,
    pub timings: RequestTimings,
    /// Present only for application-reported requests
    pub reported: Option<ReportedDetails>,
    pub request_data: ByteStream,
    pub response_data: ByteStream,
    pub closed: bool,
    /// First outbound chunk already went through header injection
    header_rules_applied: bool,
}

/// Placeholder until the registry appends the request
const UNASSIGNED: RequestId = RequestId(usize::MAX);

impl Request {
    /// Request observed on a socket
    #[must_use]
    pub fn captured(socket: SocketId, protocol: Protocol) -> Self {
        Self::new(RequestSource::Wire(socket), protocol == Protocol::Spdy)
    }

    /// Request reported by the instrumented application
    #[must_use]
    pub fn reported(connection: ConnectionId, details: ReportedDetails) -> Self {
        let mut request = Self::new(RequestSource::Browser(connection), false);
        request.reported = Some(details);
        request
    }

    fn new(source: RequestSource, is_spdy: bool) -> Self {
        Self {
            id: UNASSIGNED,
            source,
            is_spdy,
            is_ssl: false,
            timings: RequestTimings::default(),
            reported: None,
            request_data: ByteStream::default(),
            response_data: ByteStream::default(),
            closed: false,
            header_rules_applied: false,
        }
    }

    /// Position in the run's ordered collection
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: RequestId) {
        self.id = id;
    }

    #[must_use]
    pub fn is_from_browser(&self) -> bool {
        matches!(self.source, RequestSource::Browser(_))
    }

    /// Returns true once any response bytes were captured
    #[must_use]
    pub fn has_response(&self) -> bool {
        !self.response_data.is_empty()
    }

    /// Fill in the connect phase reported by the capture layer
    pub fn set_connect_timing(&mut self, timing: ConnectTiming) {
        self.timings.connect_start = Some(timing.start);
        self.timings.connect_end = Some(timing.end);
    }

    /// Record bytes sent by the application
    pub fn data_out(&mut self, chunk: DataChunk) {
        self.timings.start.get_or_insert(chunk.tick());
        self.request_data.push(chunk);
    }

    /// Record bytes received by the application
    pub fn data_in(&mut self, chunk: DataChunk) {
        let tick = self.not_before_start(chunk.tick());
        self.timings.first_byte.get_or_insert(tick);
        self.timings.end = Some(tick);
        self.response_data.push(chunk);
    }

    /// The socket carrying this request was closed
    pub fn socket_closed(&mut self, tick: Tick) {
        self.closed = true;
        if self.timings.end.is_none() && self.timings.start.is_some() {
            self.timings.end = Some(self.not_before_start(tick));
        }
    }

    /// Apply header injection rules to outbound data before it is sent.
    ///
    /// Only the first outbound HTTP chunk is considered, and only if it holds
    /// the complete header block. Returns true if `chunk` was rewritten.
    pub fn modify_data_out(&mut self, chunk: &mut DataChunk, rules: &[HeaderRule]) -> bool {
        if self.is_spdy || self.header_rules_applied || !self.request_data.is_empty() {
            return false;
        }
        self.header_rules_applied = true;
        match inject_headers(chunk.data(), rules) {
            Some(rewritten) => {
                chunk.replace(rewritten);
                true
            }
            None => false,
        }
    }

    fn not_before_start(&self, tick: Tick) -> Tick {
        self.timings.start.map_or(tick, |start| tick.max(start))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_spdy { "SPDY" } else { "HTTP" };
        match &self.source {
            RequestSource::Wire(socket) => write!(f, "{} {kind} on {socket}", self.id)?,
            RequestSource::Browser(connection) => {
                let url = self.reported.as_ref().map_or("", |details| details.url.as_str());
                write!(f, "{} {kind} {url} ({connection}, reported)", self.id)?;
            }
        }
        if self.is_ssl {
            write!(f, " [ssl]")?;
        }
        Ok(())
    }
}

// =============================================================================
// HEADER INJECTION
// =============================================================================

const HEADER_BLOCK_END: &[u8] = b"\r\n\r\n";

/// Rewrite the header block at the start of `data`.
///
/// Returns `None` when the header block is incomplete or no rule applies.
fn inject_headers(data: &[u8], rules: &[HeaderRule]) -> Option<Vec<u8>> {
    if rules.is_empty() {
        return None;
    }
    let block_end = data.windows(HEADER_BLOCK_END.len()).position(|w| w == HEADER_BLOCK_END)?;
    let body = &data[block_end + HEADER_BLOCK_END.len()..];

    let mut lines = data[..block_end].split(|&b| b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));
    let request_line = lines.next()?;
    let mut headers: Vec<Vec<u8>> = lines.map(<[u8]>::to_vec).collect();

    let host = headers.iter().find_map(|line| {
        let (name, value) = split_header(line)?;
        name.eq_ignore_ascii_case(b"host").then(|| String::from_utf8_lossy(value).into_owned())
    });

    let mut changed = false;
    for rule in rules.iter().filter(|rule| rule.applies_to(host.as_deref())) {
        if rule.action == HeaderAction::Set {
            headers.retain(|line| {
                split_header(line).map_or(true, |(name, _)| !name.eq_ignore_ascii_case(rule.name.as_bytes()))
            });
        }
        headers.push(format!("{}: {}", rule.name, rule.value).into_bytes());
        changed = true;
    }
    if !changed {
        return None;
    }

    let mut out = Vec::with_capacity(data.len() + 64);
    out.extend_from_slice(request_line);
    for header in &headers {
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(header);
    }
    out.extend_from_slice(HEADER_BLOCK_END);
    out.extend_from_slice(body);
    Some(out)
}

/// Split `Name: value` into trimmed name and value
fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some((line[..colon].trim_ascii(), line[colon + 1..].trim_ascii()))
}
