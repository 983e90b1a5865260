//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "reqscope",
    about = "Correlate captured socket traffic into requests and reconcile application-reported timings",
    after_help = "\
EXAMPLES:
    reqscope capture.jsonl                          Print the request table
    reqscope capture.jsonl --export trace.json      Also write a Chrome trace
    reqscope capture.jsonl --ticks-per-ms 1000000   Log ticks are nanoseconds"
)]
pub struct Args {
    /// Capture log to replay (one JSON event per line)
    #[arg(value_name = "LOG")]
    pub log: PathBuf,

    /// Session configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Export the request timeline as a Chrome trace
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Capture-clock ticks per millisecond
    #[arg(long, default_value = "1000")]
    pub ticks_per_ms: i64,

    /// Run start tick (defaults to the first event's tick)
    #[arg(long, value_name = "TICK", allow_negative_numbers = true)]
    pub run_start: Option<i64>,

    /// Suppress the request table
    #[arg(short, long)]
    pub quiet: bool,
}
