//! Protocol sniffing for outbound socket data.
//!
//! Decides whether the first bytes written to a socket look like the start of
//! a request the core should track. Only the preamble is inspected: this is
//! method detection, not HTTP parsing.
//!
//! # Classification Strategy
//!
//! 1. **SPDY control frame** - at least 8 bytes starting with `0x80 0x02`
//! 2. **HTTP method token** - a known method followed by a single space,
//!    matched byte for byte (case-sensitive)
//!
//! Everything else is [`Classification::None`] (TLS records, WebSocket frames,
//! arbitrary protocols) and is left alone by the core.

/// Result of sniffing a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Classification {
    /// Not the start of a request we track
    #[default]
    None,
    /// HTTP/1.x request line
    Http,
    /// SPDY control frame
    Spdy,
}

impl Classification {
    /// Returns true if the buffer starts a new request
    #[must_use]
    pub fn is_request(self) -> bool {
        !matches!(self, Classification::None)
    }
}

// =============================================================================
// CLASSIFICATION TABLES
// =============================================================================

/// Request-line prefixes, method plus the separating space
const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"OPTIONS ",
    b"DELETE ",
    b"TRACE ",
    b"CONNECT ",
    b"PATCH ",
];

/// First two bytes of a SPDY/2 control frame (control bit + version 2)
const SPDY_CONTROL_MARKER: [u8; 2] = [0x80, 0x02];

/// Smallest buffer that can hold a SPDY control frame header
const SPDY_MIN_FRAME_LEN: usize = 8;

// =============================================================================
// CLASSIFIERS
// =============================================================================

/// Classify a buffer as the start of an HTTP request, a SPDY control frame, or
/// neither.
///
/// Pure and deterministic; safe to call without holding any lock.
///
/// # Examples
///
/// ```
/// use reqscope::sniffer::{classify, Classification};
///
/// assert_eq!(classify(b"GET /x HTTP/1.1\r\n"), Classification::Http);
/// assert_eq!(classify(&[0x80, 0x02, 0x00, 0x01, 0, 0, 0, 0]), Classification::Spdy);
/// assert_eq!(classify(b"get /x HTTP/1.1\r\n"), Classification::None);
/// ```
#[must_use]
pub fn classify(buf: &[u8]) -> Classification {
    if is_spdy_request(buf) {
        Classification::Spdy
    } else if is_http_request(buf) {
        Classification::Http
    } else {
        Classification::None
    }
}

/// Returns true if `buf` begins with a known HTTP method token
#[must_use]
pub fn is_http_request(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| buf.starts_with(method))
}

/// Returns true if `buf` is long enough for a control frame and carries the
/// SPDY control marker
#[must_use]
pub fn is_spdy_request(buf: &[u8]) -> bool {
    buf.len() >= SPDY_MIN_FRAME_LEN && buf.starts_with(&SPDY_CONTROL_MARKER)
}
