//! # Shared Data Structures (capture agent ↔ correlation core)
//!
//! Defines the event vocabulary a capture agent emits and the correlation core
//! consumes. The same types describe a recorded capture log, one event per
//! line, which is what the `reqscope` binary replays.
//!
//! Ticks are raw capture-clock values. The core knows the clock frequency
//! (ticks per millisecond) from the run state; nothing here interprets them.
//!
//! ## Key Types
//!
//! - [`CaptureEvent`] - One observation from the capture layer
//! - [`Payload`] - Bytes carried by a data event
//!
//! Serde support is behind the `serde` feature so agents that only need the
//! plain types do not pull it in.

// ============================================================================
// Payload
// ============================================================================

/// Bytes carried by a `data_out` / `data_in` event.
///
/// Logs written by hand are far easier to read with text payloads, so the
/// serialized form accepts either a JSON string or an array of byte values.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Payload {
    /// UTF-8 payload (HTTP preambles, headers)
    Text(String),
    /// Arbitrary binary payload (SPDY frames, TLS records)
    Bytes(Vec<u8>),
}

impl Payload {
    /// Raw bytes of this payload
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the payload carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

// ============================================================================
// Capture Events
// ============================================================================

/// One observation delivered by the capture layer.
///
/// **Serialized form**: internally tagged by `event`, variant names in
/// `snake_case`, e.g. `{"event":"closed","socket":7,"tick":1200}`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "event", rename_all = "snake_case"))]
pub enum CaptureEvent {
    /// A hostname lookup finished.
    ///
    /// Emitted by: the DNS tracker hook once the resolver returns.
    DnsLookup {
        /// Hostname as the application asked for it
        host: String,
        /// Resolved addresses in textual form
        #[cfg_attr(feature = "serde", serde(default))]
        addresses: Vec<String>,
        /// Tick at which the lookup started
        start_tick: i64,
        /// Tick at which the lookup completed
        end_tick: i64,
    },

    /// A socket finished connecting.
    Connect {
        socket: u64,
        start_tick: i64,
        end_tick: i64,
    },

    /// Bytes written by the application to a socket
    DataOut { socket: u64, tick: i64, payload: Payload },

    /// Bytes read by the application from a socket
    DataIn { socket: u64, tick: i64, payload: Payload },

    /// The application closed a socket
    Closed { socket: u64, tick: i64 },

    /// A self-reported timing record from the instrumented application.
    ///
    /// `record` is the multi-line `key=value` text exactly as reported.
    BrowserRequest { tick: i64, record: String },

    /// The test run was reset (e.g. between first and repeat view)
    Reset { tick: i64 },
}

impl CaptureEvent {
    /// Capture-clock tick at which the event was observed.
    ///
    /// Span events (DNS lookups, connects) are observed when they complete.
    #[must_use]
    pub fn tick(&self) -> i64 {
        match self {
            CaptureEvent::DnsLookup { end_tick, .. } | CaptureEvent::Connect { end_tick, .. } => {
                *end_tick
            }
            CaptureEvent::DataOut { tick, .. }
            | CaptureEvent::DataIn { tick, .. }
            | CaptureEvent::Closed { tick, .. }
            | CaptureEvent::BrowserRequest { tick, .. }
            | CaptureEvent::Reset { tick } => *tick,
        }
    }

    /// Socket the event belongs to, if it is socket-scoped
    #[must_use]
    pub fn socket(&self) -> Option<u64> {
        match self {
            CaptureEvent::Connect { socket, .. }
            | CaptureEvent::DataOut { socket, .. }
            | CaptureEvent::DataIn { socket, .. }
            | CaptureEvent::Closed { socket, .. } => Some(*socket),
            CaptureEvent::DnsLookup { .. }
            | CaptureEvent::BrowserRequest { .. }
            | CaptureEvent::Reset { .. } => None,
        }
    }
}
