//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the two identifier spaces (sockets seen on the
//! wire vs connection ids reported by the application) and the two time bases
//! (capture-clock ticks vs application milliseconds) from being mixed up.

use std::fmt;

/// Transport-layer socket identifier assigned by the capture layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Connection identifier assigned by the instrumented application.
///
/// Zero means the application did not report one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Returns true if the application reported a real connection id
    #[must_use]
    pub fn is_known(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Stable handle of a request in the run's ordered collection.
///
/// Ids are dense indices assigned in creation order; they stay valid until
/// the run is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub usize);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Point on the capture clock, in raw ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(pub i64);

impl Tick {
    /// Shift this tick by a (possibly fractional, possibly negative) number of
    /// milliseconds. The tick delta is truncated toward zero and the result
    /// saturates at the ends of the tick range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn offset_ms(self, ms: f64, ticks_per_ms: i64) -> Tick {
        Tick(self.0.saturating_add((ms * ticks_per_ms as f64) as i64))
    }

    /// Milliseconds from `earlier` to `self`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ms_since(self, earlier: Tick, ticks_per_ms: i64) -> f64 {
        if ticks_per_ms == 0 {
            return 0.0;
        }
        self.0.saturating_sub(earlier.0) as f64 / ticks_per_ms as f64
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Protocol family of a logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain-text HTTP/1.x
    Http,
    /// SPDY control-frame framed traffic
    Spdy,
}
