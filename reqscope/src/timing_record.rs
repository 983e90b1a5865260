//! Parser for the application's self-reported timing records.
//!
//! A record is line-oriented text:
//!
//! ```text
//! browser=chrome
//! url=https://example.com/
//! initiatorUrl=https://example.com/app.js
//! startTime=12.500
//! endTime=12.750
//! timing.sendStart=3.2
//! [Request Headers]
//! GET / HTTP/1.1
//! Host: example.com
//! [Response Headers]
//! HTTP/1.1 200 OK
//! ```
//!
//! Keys are matched case-insensitively. Once the first `[...]` section header
//! is seen, no further `key=value` lines are interpreted; the two header
//! sections accumulate their lines CRLF-terminated and any other section is
//! skipped. Parsing never fails: unknown keys, malformed lines and unparsable
//! numbers are ignored (numbers read as 0).

use crate::request::{BrowserRequestData, Initiator};

/// Offsets of the connection phases, in whole milliseconds relative to the
/// request time. `None` means the key was not reported; the application may
/// also report `-1` for phases that did not happen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOffsets {
    pub dns_start: Option<i64>,
    pub dns_end: Option<i64>,
    pub connect_start: Option<i64>,
    pub connect_end: Option<i64>,
    pub ssl_start: Option<i64>,
    pub ssl_end: Option<i64>,
    pub send_start: Option<i64>,
    pub send_end: Option<i64>,
    pub receive_headers_end: Option<i64>,
}

/// Typed form of one timing record. Times are application-clock milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingRecord {
    pub browser: Option<String>,
    pub url: Option<String>,
    pub error_code: i64,
    pub start_time_ms: f64,
    pub end_time_ms: f64,
    pub first_byte_ms: f64,
    /// Present only if the record carried `requestTime`
    pub request_time_ms: Option<f64>,
    pub bytes_in: i64,
    pub initiator_url: Option<String>,
    pub initiator_line: Option<String>,
    pub initiator_column: Option<String>,
    pub status: i64,
    pub connection_id: u64,
    pub timing: PhaseOffsets,
    /// `[Request Headers]` lines, each CRLF-terminated
    pub request_headers: String,
    /// `[Response Headers]` lines, each CRLF-terminated
    pub response_headers: String,
}

impl TimingRecord {
    /// Start time the reconciler should trust: `requestTime` when reported
    /// (and non-zero), otherwise `startTime`
    #[must_use]
    pub fn effective_start_ms(&self) -> f64 {
        match self.request_time_ms {
            Some(request_time) if request_time != 0.0 => request_time,
            _ => self.start_time_ms,
        }
    }

    /// Returns true if the record has both a URL and an initiator URL
    #[must_use]
    pub fn has_initiator(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.is_empty())
            && self.initiator_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Initiator side-channel entry, when [`has_initiator`](Self::has_initiator)
    #[must_use]
    pub fn browser_request_data(&self) -> Option<BrowserRequestData> {
        if !self.has_initiator() {
            return None;
        }
        Some(BrowserRequestData {
            url: self.url.clone().unwrap_or_default(),
            initiator: Initiator {
                url: self.initiator_url.clone().unwrap_or_default(),
                line: self.initiator_line.clone().unwrap_or_default(),
                column: self.initiator_column.clone().unwrap_or_default(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Values,
    RequestHeaders,
    ResponseHeaders,
    Ignored,
}

const REQUEST_HEADERS_SECTION: &str = "[Request Headers]";
const RESPONSE_HEADERS_SECTION: &str = "[Response Headers]";

/// Parse a timing record
#[must_use]
pub fn parse(text: &str) -> TimingRecord {
    let mut record = TimingRecord::default();
    let mut section = Section::Values;

    for line in text.split('\n').map(str::trim).filter(|line| !line.is_empty()) {
        if line.starts_with('[') {
            section = match line {
                REQUEST_HEADERS_SECTION => Section::RequestHeaders,
                RESPONSE_HEADERS_SECTION => Section::ResponseHeaders,
                _ => Section::Ignored,
            };
            continue;
        }
        match section {
            Section::Values => {
                if let Some((key, value)) = split_key_value(line) {
                    apply_value(&mut record, key, value);
                }
            }
            Section::RequestHeaders => push_header_line(&mut record.request_headers, line),
            Section::ResponseHeaders => push_header_line(&mut record.response_headers, line),
            Section::Ignored => {}
        }
    }
    record
}

fn push_header_line(blob: &mut String, line: &str) {
    blob.push_str(line);
    blob.push_str("\r\n");
}

/// `key=value` with a non-empty key before the first `=`; both sides trimmed
/// and non-empty
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let separator = line.find('=')?;
    if separator == 0 {
        return None;
    }
    let key = line[..separator].trim();
    let value = line[separator + 1..].trim();
    (!key.is_empty() && !value.is_empty()).then_some((key, value))
}

fn apply_value(record: &mut TimingRecord, key: &str, value: &str) {
    let key = key.to_ascii_lowercase();
    let timing = &mut record.timing;
    match key.as_str() {
        "browser" => record.browser = Some(value.to_owned()),
        "url" => record.url = Some(value.to_owned()),
        "errorcode" => record.error_code = parse_int(value),
        "starttime" => record.start_time_ms = seconds_to_ms(value),
        "firstbytetime" => record.first_byte_ms = seconds_to_ms(value),
        "endtime" => record.end_time_ms = seconds_to_ms(value),
        "requesttime" | "timing.requesttime" => record.request_time_ms = Some(seconds_to_ms(value)),
        "bytesin" => record.bytes_in = parse_int(value),
        "initiatorurl" | "initiator" => record.initiator_url = Some(value.to_owned()),
        "initiatorlinenumber" => record.initiator_line = Some(value.to_owned()),
        "initiatorcolumnnumber" => record.initiator_column = Some(value.to_owned()),
        "status" => record.status = parse_int(value),
        "connectionid" => record.connection_id = u64::try_from(parse_int(value)).unwrap_or(0),
        "timing.dnsstart" => timing.dns_start = Some(round_ms(value)),
        "timing.dnsend" => timing.dns_end = Some(round_ms(value)),
        "timing.connectstart" => timing.connect_start = Some(round_ms(value)),
        "timing.connectend" => timing.connect_end = Some(round_ms(value)),
        "timing.sslstart" => timing.ssl_start = Some(round_ms(value)),
        "timing.sslend" => timing.ssl_end = Some(round_ms(value)),
        "timing.sendstart" => timing.send_start = Some(round_ms(value)),
        "timing.sendend" => timing.send_end = Some(round_ms(value)),
        "timing.receiveheadersend" => timing.receive_headers_end = Some(round_ms(value)),
        _ => {}
    }
}

// =============================================================================
// NUMBERS
// =============================================================================

fn seconds_to_ms(value: &str) -> f64 {
    parse_float(value) * 1000.0
}

#[allow(clippy::cast_possible_truncation)]
fn round_ms(value: &str) -> i64 {
    parse_float(value).round() as i64
}

/// Parse the longest leading decimal number (`-12.5e3ms` reads as -12500);
/// 0 if there is none
fn parse_float(value: &str) -> f64 {
    let bytes = value.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
    }
    if end == digits_start || &value[digits_start..end] == "." {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    value[..end].parse().unwrap_or(0.0)
}

/// Parse the leading integer; 0 if there is none
fn parse_int(value: &str) -> i64 {
    let bytes = value.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    value[..end].parse().unwrap_or(0)
}
