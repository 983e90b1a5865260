//! Interfaces to the subsystems the correlation core depends on, plus small
//! in-memory implementations used by replay and tests.
//!
//! | Trait              | Supplied by           | Used for                            |
//! |--------------------|-----------------------|-------------------------------------|
//! | [`RunState`]       | test-run state        | active flag, clock, activity pings  |
//! | [`DnsTracker`]     | DNS hook              | clock anchoring by hostname         |
//! | [`SocketTracker`]  | capture layer         | connect timing, end-of-run release  |
//! | [`OutboundModifier`] | capture layer       | rewriting untracked outbound data   |
//!
//! # Reentrancy
//!
//! [`DnsTracker::find`] and [`SocketTracker::claim_connect`] are called while
//! the registry lock is held. Implementations must not block and must not call
//! back into the [`Requests`](crate::orchestrator::Requests) session. The
//! `claim_all` methods are called after the lock has been released.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, warn};

use crate::domain::{SocketId, Tick};
use crate::request::DataChunk;

// =============================================================================
// RUN STATE
// =============================================================================

/// Process-wide state of the current test run
pub trait RunState: Send + Sync {
    /// Whether capture is currently enabled
    fn is_active(&self) -> bool;

    /// Capture-clock tick at which the run started
    fn start(&self) -> Tick;

    /// Capture-clock frequency
    fn ticks_per_ms(&self) -> i64;

    /// Current capture-clock tick
    fn now(&self) -> Tick;

    /// Called by the core on every unit of work it performs
    fn activity_detected(&self);

    /// Milliseconds elapsed between the run start and `tick`
    fn elapsed_ms(&self, tick: Tick) -> f64 {
        tick.ms_since(self.start(), self.ticks_per_ms())
    }
}

enum RunClock {
    /// Nanosecond ticks measured from an origin
    Monotonic(Instant),
    /// Externally driven clock (replay, tests)
    Manual(AtomicI64),
}

/// Reference [`RunState`] implementation.
///
/// Starts inactive; call [`TestRun::set_active`] to begin capturing.
pub struct TestRun {
    active: AtomicBool,
    activity: AtomicU64,
    start: Tick,
    ticks_per_ms: i64,
    clock: RunClock,
}

impl TestRun {
    /// Run timed by the monotonic clock, one tick per nanosecond, starting at
    /// tick 0 now
    #[must_use]
    pub fn monotonic() -> Self {
        Self {
            active: AtomicBool::new(false),
            activity: AtomicU64::new(0),
            start: Tick(0),
            ticks_per_ms: 1_000_000,
            clock: RunClock::Monotonic(Instant::now()),
        }
    }

    /// Run timed by a manually advanced clock, which reads `start` initially
    #[must_use]
    pub fn manual(start: Tick, ticks_per_ms: i64) -> Self {
        Self {
            active: AtomicBool::new(false),
            activity: AtomicU64::new(0),
            start,
            ticks_per_ms,
            clock: RunClock::Manual(AtomicI64::new(start.0)),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Move a manual clock to `tick`. Ignored (with a warning) for monotonic
    /// runs.
    pub fn set_now(&self, tick: Tick) {
        match &self.clock {
            RunClock::Manual(now) => now.store(tick.0, Ordering::SeqCst),
            RunClock::Monotonic(_) => warn!("Cannot set the time of a monotonic run clock"),
        }
    }

    /// Advance a manual clock by `ms` milliseconds
    pub fn advance_ms(&self, ms: f64) {
        let next = self.now().offset_ms(ms, self.ticks_per_ms);
        self.set_now(next);
    }

    /// Number of `activity_detected` notifications received so far
    pub fn activity_count(&self) -> u64 {
        self.activity.load(Ordering::Relaxed)
    }
}

impl RunState for TestRun {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn start(&self) -> Tick {
        self.start
    }

    fn ticks_per_ms(&self) -> i64 {
        self.ticks_per_ms
    }

    #[allow(clippy::cast_possible_truncation)] // i64 nanoseconds covers ~292 years
    fn now(&self) -> Tick {
        match &self.clock {
            RunClock::Monotonic(origin) => Tick(self.start.0 + origin.elapsed().as_nanos() as i64),
            RunClock::Manual(now) => Tick(now.load(Ordering::SeqCst)),
        }
    }

    fn activity_detected(&self) {
        self.activity.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// DNS
// =============================================================================

/// A completed hostname lookup as observed by the DNS hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsLookup {
    pub addresses: Vec<IpAddr>,
    pub start: Tick,
    pub end: Tick,
}

/// Hostname lookups observed during the run
pub trait DnsTracker: Send + Sync {
    /// Most relevant lookup for `host`, if one was observed
    fn find(&self, host: &str) -> Option<DnsLookup>;

    /// Release everything recorded for the finished run
    fn claim_all(&self);
}

/// Reference [`DnsTracker`]: latest lookup per hostname, case-insensitive
#[derive(Default)]
pub struct DnsTable {
    lookups: Mutex<HashMap<String, DnsLookup>>,
}

impl DnsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup, replacing any earlier one for the same host
    pub fn record(&self, host: &str, lookup: DnsLookup) {
        debug!("DNS {host} resolved {:?} ending {}", lookup.addresses, lookup.end);
        self.lookups().insert(host.to_ascii_lowercase(), lookup);
    }

    pub fn len(&self) -> usize {
        self.lookups().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookups(&self) -> MutexGuard<'_, HashMap<String, DnsLookup>> {
        self.lookups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DnsTracker for DnsTable {
    fn find(&self, host: &str) -> Option<DnsLookup> {
        self.lookups().get(&host.to_ascii_lowercase()).cloned()
    }

    fn claim_all(&self) {
        self.lookups().clear();
    }
}

// =============================================================================
// SOCKETS
// =============================================================================

/// Connect phase of a socket on the capture clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTiming {
    pub start: Tick,
    pub end: Tick,
}

/// Capture-layer socket bookkeeping the core consults
pub trait SocketTracker: Send + Sync {
    /// Hand out the connect timing of `socket`, at most once per connect
    fn claim_connect(&self, socket: SocketId) -> Option<ConnectTiming>;

    /// Release everything recorded for the finished run
    fn claim_all(&self);
}

/// Reference [`SocketTracker`] fed by `connect` capture events
#[derive(Default)]
pub struct SocketTable {
    connects: Mutex<HashMap<SocketId, ConnectTiming>>,
}

impl SocketTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self, socket: SocketId, timing: ConnectTiming) {
        self.connects().insert(socket, timing);
    }

    pub fn len(&self) -> usize {
        self.connects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn connects(&self) -> MutexGuard<'_, HashMap<SocketId, ConnectTiming>> {
        self.connects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketTracker for SocketTable {
    fn claim_connect(&self, socket: SocketId) -> Option<ConnectTiming> {
        self.connects().remove(&socket)
    }

    fn claim_all(&self) {
        self.connects().clear();
    }
}

// =============================================================================
// OUTBOUND MODIFICATION
// =============================================================================

/// Rewrites outbound data that no tracked request owns
pub trait OutboundModifier: Send + Sync {
    /// Returns true if `chunk` was changed
    fn modify(&self, chunk: &mut DataChunk) -> bool;
}

/// Leaves untracked outbound data untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModifier;

impl OutboundModifier for NoopModifier {
    fn modify(&self, _chunk: &mut DataChunk) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let run = TestRun::manual(Tick(1_000), 1_000);
        assert_eq!(run.now(), Tick(1_000));
        run.advance_ms(2.5);
        assert_eq!(run.now(), Tick(3_500));
        assert_eq!(run.elapsed_ms(run.now()), 2.5);
    }

    #[test]
    fn test_run_starts_inactive() {
        let run = TestRun::monotonic();
        assert!(!run.is_active());
        run.set_active(true);
        assert!(run.is_active());
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let run = TestRun::monotonic();
        let first = run.now();
        run.set_now(Tick(-5)); // ignored
        assert!(run.now() >= first);
    }

    #[test]
    fn test_activity_counter() {
        let run = TestRun::manual(Tick(0), 1);
        run.activity_detected();
        run.activity_detected();
        assert_eq!(run.activity_count(), 2);
    }

    #[test]
    fn test_dns_lookup_is_case_insensitive() {
        let dns = DnsTable::new();
        dns.record(
            "WWW.Example.com",
            DnsLookup { addresses: vec!["192.0.2.1".parse().unwrap()], start: Tick(1), end: Tick(2) },
        );
        assert_eq!(dns.find("www.example.com").map(|l| l.end), Some(Tick(2)));
        dns.claim_all();
        assert!(dns.is_empty());
        assert!(dns.find("www.example.com").is_none());
    }

    #[test]
    fn test_connect_timing_is_claimed_once() {
        let sockets = SocketTable::new();
        let timing = ConnectTiming { start: Tick(10), end: Tick(20) };
        sockets.record_connect(SocketId(4), timing);
        assert_eq!(sockets.claim_connect(SocketId(4)), Some(timing));
        assert_eq!(sockets.claim_connect(SocketId(4)), None);
    }

    #[test]
    fn test_tables_survive_poisoning() {
        let dns = DnsTable::new();
        let sockets = SocketTable::new();
        std::thread::scope(|scope| {
            let poison = scope.spawn(|| {
                let _lookups = dns.lookups();
                let _connects = sockets.connects();
                panic!("capture thread died");
            });
            assert!(poison.join().is_err());
        });
        assert!(dns.lookups.is_poisoned());
        assert!(sockets.connects.is_poisoned());

        dns.record("a", DnsLookup { addresses: Vec::new(), start: Tick(1), end: Tick(2) });
        assert_eq!(dns.len(), 1);
        assert!(dns.find("a").is_some());
        dns.claim_all();
        assert!(dns.is_empty());

        let timing = ConnectTiming { start: Tick(1), end: Tick(2) };
        sockets.record_connect(SocketId(1), timing);
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets.claim_connect(SocketId(1)), Some(timing));
        sockets.record_connect(SocketId(2), timing);
        sockets.claim_all();
        assert!(sockets.is_empty());
    }

    #[test]
    fn test_noop_modifier() {
        let mut chunk = DataChunk::new(Tick(0), &b"\x16\x03\x01"[..]);
        assert!(!NoopModifier.modify(&mut chunk));
        assert_eq!(chunk.data(), b"\x16\x03\x01");
    }
}
