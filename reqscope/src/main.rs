//! # reqscope - Main Entry Point
//!
//! Replays a recorded capture log through a correlation session, prints the
//! resulting requests, and optionally exports them as a Chrome trace.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::BufWriter;

use reqscope::cli::{report, Args};
use reqscope::config::ReqscopeConfig;
use reqscope::export::RequestTraceExporter;
use reqscope::replay::{self, ReplayClock};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("ticks per millisecond") || msg.contains("config") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ReqscopeConfig::from_file(path).context("Invalid config")?,
        None => ReqscopeConfig::default(),
    };

    let clock = ReplayClock { ticks_per_ms: args.ticks_per_ms, run_start: args.run_start };
    let replay = replay::replay_file(&args.log, config, clock)?;
    let session = replay.session();
    let requests = session.requests();
    let run_start = session.run().start();

    if !args.quiet {
        print!("{}", report::request_table(&requests, run_start, args.ticks_per_ms));
        println!();
    }
    println!("{}", report::summary_line(&replay.summary(), requests.len()));

    if let Some(path) = &args.export {
        let mut exporter = RequestTraceExporter::new(run_start, args.ticks_per_ms);
        exporter.add_requests(&requests);
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        exporter
            .export(BufWriter::new(file))
            .with_context(|| format!("Failed to write trace to {}", path.display()))?;
        info!("Wrote {} trace events to {}", exporter.event_count(), path.display());
    }
    Ok(())
}
