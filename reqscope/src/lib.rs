//! # reqscope - Socket-to-Request Correlation
//!
//! reqscope turns raw socket traffic observed by a capture layer into logical
//! HTTP/SPDY requests, and merges in the timing records an instrumented
//! application reports about its own requests, placing both on one
//! capture-clock timeline.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Capture Layer / Application                    │
//! │   data out · data in · socket closed · timing reports           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ (many threads)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Requests session (orchestrator)                 │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Sniffer    │──▶│   Registry   │◀──│  Reconciler  │         │
//! │  │ (HTTP/SPDY)  │   │ (one lock)   │   │ (clock anchor│         │
//! │  └──────────────┘   └──────┬───────┘   │  + sanity)   │         │
//! │                            │           └──────▲───────┘         │
//! │                            │                  │                 │
//! │                            │           ┌──────┴───────┐         │
//! │                            │           │ Timing record│         │
//! │                            │           │   parser     │         │
//! │                            ▼           └──────────────┘         │
//! │                   ordered Request collection                    │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         ▼
//!              report table · Chrome trace export
//! ```
//!
//! ## Module Structure
//!
//! ### Correlation Core
//!
//! - [`sniffer`]: pure classification of a buffer as an HTTP or SPDY request
//! - [`registry`]: ordered request arena and socket → active-request map
//! - [`timing_record`]: typed parser for the application's `key=value` reports
//! - [`reconciler`]: clock anchoring, phase timestamps, sanity filter
//! - [`orchestrator`]: the [`Requests`](orchestrator::Requests) session the
//!   capture layer calls into
//! - [`request`]: the request model and header injection
//!
//! ### Edges
//!
//! - [`collaborators`]: run state, DNS and socket tracker interfaces plus
//!   in-memory implementations
//! - [`config`]: JSON session configuration
//! - [`replay`]: drive a session from a recorded capture log
//! - [`export`]: Chrome Trace Event Format output
//! - [`cli`]: command-line arguments and report rendering
//! - [`domain`]: identifiers, ticks and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Replay a capture log and print the requests
//! reqscope capture.jsonl
//!
//! # Export the timeline for chrome://tracing or Perfetto
//! reqscope capture.jsonl --export trace.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Capture clock**: high-resolution ticks stamped by the capture layer
//! - **Application clock**: wall-clock milliseconds in the application's reports
//! - **Clock anchor**: offset between the two, fixed once per run from a DNS
//!   lookup both sides observed
//! - **Sanity filter**: drops reported requests whose timestamps fall far
//!   outside the run

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod export;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod replay;
pub mod request;
pub mod sniffer;
pub mod timing_record;
