use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use crate::domain::{ExportError, Tick};
use crate::request::{Request, RequestSource};

/// Trace process for requests captured on the wire
const WIRE_PID: u32 = 1;
/// Trace process for requests reported by the application
const BROWSER_PID: u32 = 2;

/// Chrome Trace Event format
/// Format: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChromeTraceEvent {
    /// Phase name (dns, connect, ssl, ttfb, download, request)
    name: String,
    cat: String,
    /// "X" = complete, "M" = metadata
    ph: String,
    /// Microseconds since the run start
    ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: u32,
    /// Socket id or application connection id
    tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

/// Renders requests as a timeline, one track per connection
pub struct RequestTraceExporter {
    events: Vec<ChromeTraceEvent>,
    run_start: Tick,
    ticks_per_ms: i64,
    /// (pid, tid) -> track name
    tracks: BTreeMap<(u32, u64), String>,
}

impl RequestTraceExporter {
    #[must_use]
    pub fn new(run_start: Tick, ticks_per_ms: i64) -> Self {
        Self { events: Vec::new(), run_start, ticks_per_ms, tracks: BTreeMap::new() }
    }

    /// Add one complete event per populated phase of `request`
    pub fn add_request(&mut self, request: &Request) {
        let (pid, track) = match request.source {
            RequestSource::Wire(socket) => (WIRE_PID, format!("socket {}", socket.0)),
            RequestSource::Browser(connection) => (BROWSER_PID, format!("connection {}", connection.0)),
        };
        let tid = request.source.connection_key();
        self.tracks.entry((pid, tid)).or_insert(track);

        let t = &request.timings;
        let mut phases = vec![
            ("dns", t.dns_start, t.dns_end),
            ("connect", t.connect_start, t.connect_end),
            ("ssl", t.ssl_start, t.ssl_end),
        ];
        match t.first_byte {
            Some(_) => {
                phases.push(("ttfb", t.start, t.first_byte));
                phases.push(("download", t.first_byte, t.end));
            }
            None => phases.push(("request", t.start, t.end)),
        }

        let args = request_args(request);
        for (name, from, to) in phases {
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            self.events.push(ChromeTraceEvent {
                name: name.to_string(),
                cat: "request".to_string(),
                ph: "X".to_string(),
                ts: self.micros(from),
                dur: Some(to.ms_since(from, self.ticks_per_ms) * 1000.0),
                pid,
                tid,
                args: Some(args.clone()),
            });
        }
    }

    pub fn add_requests<'a>(&mut self, requests: impl IntoIterator<Item = &'a Request>) {
        for request in requests {
            self.add_request(request);
        }
    }

    /// Write the trace to any writer (file, stdout, buffer)
    ///
    /// # Errors
    /// Returns an error if serialization or the underlying write fails
    pub fn export<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        let mut all_events = self.events.clone();

        for (pid, name) in [(WIRE_PID, "captured"), (BROWSER_PID, "reported")] {
            if self.tracks.keys().any(|(track_pid, _)| *track_pid == pid) {
                all_events.push(metadata("process_name", pid, 0, name));
            }
        }
        for ((pid, tid), name) in &self.tracks {
            all_events.push(metadata("thread_name", *pid, *tid, name));
        }

        let trace = ChromeTrace { trace_events: all_events, display_time_unit: "ms".to_string() };
        serde_json::to_writer_pretty(writer, &trace)?;
        Ok(())
    }

    /// Number of phase events collected
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    fn micros(&self, tick: Tick) -> f64 {
        tick.ms_since(self.run_start, self.ticks_per_ms) * 1000.0
    }
}

fn request_args(request: &Request) -> HashMap<String, JsonValue> {
    let mut args = HashMap::new();
    args.insert("request".to_string(), serde_json::json!(request.id().0));
    args.insert("spdy".to_string(), serde_json::json!(request.is_spdy));
    args.insert("ssl".to_string(), serde_json::json!(request.is_ssl));
    if let Some(details) = &request.reported {
        args.insert("url".to_string(), serde_json::json!(details.url));
        args.insert("status".to_string(), serde_json::json!(details.status));
    }
    args
}

fn metadata(kind: &str, pid: u32, tid: u64, name: &str) -> ChromeTraceEvent {
    let mut args = HashMap::new();
    args.insert("name".to_string(), serde_json::json!(name));
    ChromeTraceEvent {
        name: kind.to_string(),
        cat: String::new(),
        ph: "M".to_string(),
        ts: 0.0,
        dur: None,
        pid,
        tid,
        args: Some(args),
    }
}
