mod cli;
mod commands;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_tracing();
    let cli = cli::Cli::parse();
    let result = match &cli.command {
        cli::Command::ReplayHunter {
            app,
            first_block,
            last_block,
        } => commands::replay_hunter(&cli.opts, app, *first_block, *last_block),
        cli::Command::ReplayTxs {
            app,
            first_block,
            last_block,
        } => commands::replay_txs(&cli.opts, app, *first_block, *last_block),
        cli::Command::TestHunter {
            app,
            start_block,
            rounds,
        } => commands::test_hunter(&cli.opts, app, *start_block, *rounds),
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
