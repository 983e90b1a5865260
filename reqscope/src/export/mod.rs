//! Trace export
//!
//! Writes the request timeline in Chrome Trace Event Format for viewing in
//! `chrome://tracing` or Perfetto.

pub mod chrome_trace;

pub use chrome_trace::RequestTraceExporter;
