//! # Capture Session
//!
//! [`Requests`] is the entry point the capture layer talks to. It receives
//! socket events from many threads, routes them through the [`Registry`], and
//! turns the application's timing reports into requests via the
//! [`Reconciler`].
//!
//! ```text
//! data out ──▶ sniff ──▶ get_or_create ──▶ Request::data_out
//! data in  ──▶ active request? ──────────▶ Request::data_in   (else dropped)
//! closed   ──▶ unmap socket ─────────────▶ Request::socket_closed
//! report   ──▶ parse ──▶ reconcile ──────▶ push (or reject)
//! ```
//!
//! Every event is ignored while the run is inactive.

use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::collaborators::{DnsTracker, NoopModifier, OutboundModifier, RunState, SocketTracker};
use crate::config::ReqscopeConfig;
use crate::domain::{RequestId, SocketId};
use crate::reconciler::{Reconciler, Rejection};
use crate::registry::{Registry, RegistryState};
use crate::request::{BrowserRequestData, DataChunk, Request};
use crate::timing_record;

/// Outcome of processing one application timing report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A request was synthesized and appended
    Accepted(RequestId),
    /// The request was synthesized but failed the sanity filter
    Rejected(Rejection),
    /// The report lacked a URL, an initiator, or a positive start and end time
    Skipped,
    /// The run was not active
    Inactive,
}

/// Request tracking for one test run
pub struct Requests {
    config: ReqscopeConfig,
    registry: Registry,
    run: Arc<dyn RunState>,
    dns: Arc<dyn DnsTracker>,
    sockets: Arc<dyn SocketTracker>,
    modifier: Arc<dyn OutboundModifier>,
}

impl Requests {
    pub fn new(
        config: ReqscopeConfig,
        run: Arc<dyn RunState>,
        dns: Arc<dyn DnsTracker>,
        sockets: Arc<dyn SocketTracker>,
    ) -> Self {
        Self {
            config,
            registry: Registry::new(),
            run,
            dns,
            sockets,
            modifier: Arc::new(NoopModifier),
        }
    }

    /// Rewrite untracked outbound data with `modifier`
    #[must_use]
    pub fn with_modifier(mut self, modifier: Arc<dyn OutboundModifier>) -> Self {
        self.modifier = modifier;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ReqscopeConfig {
        &self.config
    }

    #[must_use]
    pub fn run(&self) -> &dyn RunState {
        self.run.as_ref()
    }

    // =========================================================================
    // CAPTURE EVENTS
    // =========================================================================

    /// Outbound bytes on `socket`
    pub fn on_data_out(&self, socket: SocketId, mut chunk: DataChunk) {
        if !self.run.is_active() {
            return;
        }
        let mut state = self.registry.lock();
        let routed = state.get_or_create_request(socket, chunk.data());
        let Some(id) = routed.request() else {
            return;
        };
        self.run.activity_detected();
        if routed.is_new() {
            self.claim_connect(&mut state, socket, id);
        }
        self.limit(&mut chunk);
        if let Some(request) = state.request_mut(id) {
            request.data_out(chunk);
        }
    }

    /// Outbound bytes about to be sent on `socket`, which may be rewritten.
    ///
    /// Returns true if `chunk` was changed.
    pub fn on_modify_data_out(&self, socket: SocketId, chunk: &mut DataChunk) -> bool {
        if !self.run.is_active() {
            return false;
        }
        let mut state = self.registry.lock();
        let routed = state.get_or_create_request(socket, chunk.data());
        let Some(id) = routed.request() else {
            drop(state);
            return self.modifier.modify(chunk);
        };
        self.run.activity_detected();
        if routed.is_new() {
            self.claim_connect(&mut state, socket, id);
        }
        let rules = &self.config.headers;
        let modified = state.request_mut(id).is_some_and(|request| request.modify_data_out(chunk, rules));
        if modified {
            debug!("Rewrote outbound headers of {id} on {socket}");
        }
        modified
    }

    /// Inbound bytes on `socket`; dropped when no request owns the socket
    pub fn on_data_in(&self, socket: SocketId, mut chunk: DataChunk) {
        if !self.run.is_active() {
            return;
        }
        let mut state = self.registry.lock();
        let Some(id) = state.active_request(socket) else {
            trace!("Dropping {} inbound bytes on {socket}: no active request", chunk.len());
            return;
        };
        self.run.activity_detected();
        self.limit(&mut chunk);
        if let Some(request) = state.request_mut(id) {
            request.data_in(chunk);
        }
    }

    pub fn on_socket_closed(&self, socket: SocketId) {
        if !self.run.is_active() {
            return;
        }
        let now = self.run.now();
        if let Some(id) = self.registry.socket_closed(socket, now) {
            trace!("{socket} closed, {id} complete");
        }
    }

    /// Timing report from the instrumented application
    pub fn on_browser_reported_request(&self, text: &str) -> Reconciled {
        if !self.run.is_active() {
            return Reconciled::Inactive;
        }
        let record = timing_record::parse(text);
        let mut guard = self.registry.lock();
        let state = &mut *guard;

        if let Some(data) = record.browser_request_data() {
            state.record_browser_request(data);
        }
        self.run.activity_detected();

        let reconciler = Reconciler::new(self.run.as_ref(), self.dns.as_ref(), self.config.sanity_slop_ms);
        let now = self.run.now();
        match reconciler.reconcile(&record, &mut state.anchor, &mut state.connections, now) {
            Ok(Some(request)) => {
                let id = state.push(request);
                debug!("Accepted reported request {id}");
                Reconciled::Accepted(id)
            }
            Ok(None) => {
                trace!("Reported request without URL, initiator or start/end time: {:?}", record.url);
                Reconciled::Skipped
            }
            Err(rejection) => {
                warn!("Rejected reported request {:?}: {rejection}", record.url.as_deref().unwrap_or(""));
                Reconciled::Rejected(rejection)
            }
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn active_request(&self, socket: SocketId) -> Option<RequestId> {
        self.registry.active_request(socket)
    }

    #[must_use]
    pub fn has_active_request(&self, socket: SocketId) -> bool {
        self.active_request(socket).is_some()
    }

    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<Request> {
        self.registry.request(id)
    }

    /// Snapshot of every request in creation order
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.registry.requests()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Initiator record for `url`, removed when `claim` is set
    pub fn browser_request_info(&self, url: &str, claim: bool) -> Option<BrowserRequestData> {
        self.registry.browser_request_info(url, claim)
    }

    /// Application-clock milliseconds at the run start, once anchored
    #[must_use]
    pub fn clock_anchor(&self) -> Option<f64> {
        self.registry.lock().anchor.browser_start_ms()
    }

    /// Discard everything from the finished run and release the collaborators'
    /// per-run records
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.registry.lock();
            let dropped = state.requests().len();
            state.clear();
            dropped
        };
        self.dns.claim_all();
        self.sockets.claim_all();
        info!("Session reset, {dropped} requests discarded");
    }

    fn claim_connect(&self, state: &mut RegistryState, socket: SocketId, id: RequestId) {
        if let Some(timing) = self.sockets.claim_connect(socket) {
            if let Some(request) = state.request_mut(id) {
                request.set_connect_timing(timing);
            }
        }
    }

    fn limit(&self, chunk: &mut DataChunk) {
        if self.config.max_chunk_bytes > 0 {
            chunk.truncate(self.config.max_chunk_bytes);
        }
    }
}
