//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "defiwarder",
    about = "Detects token-leakage exploits in DeFi applications by replaying recorded transactions",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct Options {
    #[arg(
        long,
        default_value_t = 4,
        help = "Number of worker threads that execute in parallel"
    )]
    pub workers: usize,

    #[arg(
        long = "data-dir",
        default_value = "hunter",
        help = "Root directory holding the registry, ABI, price and transaction data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "time-limit",
        default_value_t = 1800,
        help = "Wall-clock budget in seconds for test-hunter rounds"
    )]
    pub time_limit: u64,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fan out extraction over a block range and sort recorded transactions
    /// into per-application datasets.
    #[command(name = "replay-hunter")]
    ReplayHunter {
        /// Application name, or `all` for every registered application.
        app: String,
        first_block: u64,
        last_block: u64,
    },

    /// Run the three-stage pipeline: parallel extraction, flow build,
    /// leakage detection.
    #[command(name = "replay-txs")]
    ReplayTxs {
        app: String,
        first_block: u64,
        last_block: u64,
    },

    /// Round-based detection loop over the recorded history, bounded by the
    /// wall-clock budget.
    #[command(name = "test-hunter")]
    TestHunter {
        app: String,
        start_block: u64,
        rounds: u32,
    },
}
