//! # Request Registry
//!
//! Ordered collection of every request seen during a run, plus the
//! socket → active-request map used to route captured traffic.
//!
//! Everything lives behind one lock. Callers that need several steps to be
//! atomic (create a request, then append to it) take the guard with
//! [`Registry::lock`] and work on [`RegistryState`] directly; the state's
//! helpers never lock again, so no path re-enters the mutex.
//!
//! ## Pipelining
//!
//! A socket normally keeps one request until it closes. When a new HTTP
//! preamble shows up on a socket whose HTTP request already has response
//! bytes, the old request is left in the collection and the socket is
//! remapped to a fresh one.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::domain::{ConnectionId, Protocol, RequestId, SocketId, Tick};
use crate::reconciler::ClockAnchor;
use crate::request::{BrowserRequestData, Request};
use crate::sniffer::{self, Classification};

/// How an outbound chunk was routed to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The socket already had an active request
    Existing(RequestId),
    /// A new request was created for a socket with none
    Created(RequestId),
    /// A pipelined request replaced the socket's previous one
    Superseded { previous: RequestId, current: RequestId },
    /// No request owns the socket and the data is not a request preamble
    Untracked,
}

impl Correlation {
    #[must_use]
    pub fn request(self) -> Option<RequestId> {
        match self {
            Correlation::Existing(id) | Correlation::Created(id) => Some(id),
            Correlation::Superseded { current, .. } => Some(current),
            Correlation::Untracked => None,
        }
    }

    /// Returns true if a request was created by this routing step
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(self, Correlation::Created(_) | Correlation::Superseded { .. })
    }
}

/// Per-run state guarded by the registry lock
#[derive(Debug, Default)]
pub struct RegistryState {
    requests: Vec<Request>,
    active: HashMap<SocketId, RequestId>,
    browser_data: Vec<BrowserRequestData>,
    /// Application connection ids already given connection phases
    pub connections: HashSet<ConnectionId>,
    pub anchor: ClockAnchor,
}

impl RegistryState {
    /// Append `request` to the ordered collection and return its id
    pub fn push(&mut self, mut request: Request) -> RequestId {
        let id = RequestId(self.requests.len());
        request.assign_id(id);
        self.requests.push(request);
        id
    }

    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id.0)
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(id.0)
    }

    #[must_use]
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    #[must_use]
    pub fn active_request(&self, socket: SocketId) -> Option<RequestId> {
        self.active.get(&socket).copied()
    }

    /// Create a request for `socket` and make it the socket's active request
    pub fn new_request(&mut self, socket: SocketId, protocol: Protocol) -> RequestId {
        let id = self.push(Request::captured(socket, protocol));
        self.active.insert(socket, id);
        debug!("New {protocol:?} request {id} on {socket}");
        id
    }

    /// Route an outbound chunk on `socket` to a request, creating one when the
    /// chunk starts a new request
    pub fn get_or_create_request(&mut self, socket: SocketId, data: &[u8]) -> Correlation {
        let classification = sniffer::classify(data);
        match self.active_request(socket) {
            Some(previous) => {
                let pipelined = classification == Classification::Http
                    && self.request(previous).is_some_and(|request| !request.is_spdy && request.has_response());
                if pipelined {
                    let current = self.new_request(socket, Protocol::Http);
                    debug!("{current} supersedes {previous} on {socket}");
                    Correlation::Superseded { previous, current }
                } else {
                    Correlation::Existing(previous)
                }
            }
            None => match classification {
                Classification::Http => Correlation::Created(self.new_request(socket, Protocol::Http)),
                Classification::Spdy => Correlation::Created(self.new_request(socket, Protocol::Spdy)),
                Classification::None => {
                    trace!("Untracked outbound data on {socket} ({} bytes)", data.len());
                    Correlation::Untracked
                }
            },
        }
    }

    /// Unmap `socket` and mark its request closed.
    ///
    /// Returns the request that was active on the socket, if any.
    pub fn socket_closed(&mut self, socket: SocketId, tick: Tick) -> Option<RequestId> {
        let id = self.active.remove(&socket)?;
        if let Some(request) = self.request_mut(id) {
            request.socket_closed(tick);
        }
        Some(id)
    }

    pub fn record_browser_request(&mut self, data: BrowserRequestData) {
        self.browser_data.push(data);
    }

    /// First side-channel record for `url`, removed from the store when
    /// `claim` is set
    pub fn browser_request_info(&mut self, url: &str, claim: bool) -> Option<BrowserRequestData> {
        let index = self.browser_data.iter().position(|data| data.url == url)?;
        if claim {
            Some(self.browser_data.remove(index))
        } else {
            self.browser_data.get(index).cloned()
        }
    }

    #[must_use]
    pub fn browser_data_len(&self) -> usize {
        self.browser_data.len()
    }

    /// Drop all per-run state, including the clock anchor
    pub fn clear(&mut self) {
        self.requests.clear();
        self.active.clear();
        self.browser_data.clear();
        self.connections.clear();
        self.anchor = ClockAnchor::new();
    }
}

/// Thread-safe owner of the [`RegistryState`]
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock.
    ///
    /// A panic while the lock was held leaves the state usable, so poisoning
    /// is ignored.
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn active_request(&self, socket: SocketId) -> Option<RequestId> {
        self.lock().active_request(socket)
    }

    pub fn get_or_create_request(&self, socket: SocketId, data: &[u8]) -> Correlation {
        self.lock().get_or_create_request(socket, data)
    }

    pub fn socket_closed(&self, socket: SocketId, tick: Tick) -> Option<RequestId> {
        self.lock().socket_closed(socket, tick)
    }

    /// Snapshot of one request
    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<Request> {
        self.lock().request(id).cloned()
    }

    /// Snapshot of every request in creation order
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests().to_vec()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().requests().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn browser_request_info(&self, url: &str, claim: bool) -> Option<BrowserRequestData> {
        self.lock().browser_request_info(url, claim)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
