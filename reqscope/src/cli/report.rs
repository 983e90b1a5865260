// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use std::fmt::Write;

use crate::domain::Tick;
use crate::replay::ReplaySummary;
use crate::request::{Request, RequestSource};

/// One line per request: id, source, offsets and phase durations in ms
#[must_use]
pub fn request_table(requests: &[Request], run_start: Tick, ticks_per_ms: i64) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:<10} {:<5} {:>10} {:>9} {:>9} {:>9} {:>9} {:>9}  URL",
        "ID", "SOURCE", "PROTO", "START", "DNS", "CONNECT", "SSL", "TTFB", "TOTAL"
    );
    for request in requests {
        let t = &request.timings;
        let source = match request.source {
            RequestSource::Wire(socket) => format!("sock {}", socket.0),
            RequestSource::Browser(connection) => format!("conn {}", connection.0),
        };
        let proto = match (request.is_spdy, request.is_ssl) {
            (true, _) => "spdy",
            (false, true) => "https",
            (false, false) => "http",
        };
        let start = t.start.map(|start| start.ms_since(run_start, ticks_per_ms));
        let url = request.reported.as_ref().map_or("-", |details| details.url.as_str());
        let _ = writeln!(
            out,
            "{:<6} {:<10} {:<5} {:>10} {:>9} {:>9} {:>9} {:>9} {:>9}  {url}",
            request.id().0,
            source,
            proto,
            ms(start),
            ms(t.dns_ms(ticks_per_ms)),
            ms(t.connect_ms(ticks_per_ms)),
            ms(t.ssl_ms(ticks_per_ms)),
            ms(t.ttfb_ms(ticks_per_ms)),
            ms(t.total_ms(ticks_per_ms)),
        );
    }
    out
}

#[must_use]
pub fn summary_line(summary: &ReplaySummary, requests: usize) -> String {
    format!(
        "{} events, {requests} requests; reports: {} accepted, {} rejected, {} skipped; {} resets",
        summary.events, summary.reports_accepted, summary.reports_rejected, summary.reports_skipped, summary.resets
    )
}

fn ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}
