//! `raet`: run a RAET road stack, or manage its keep offline.

mod cli;
mod keys;
mod run;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use raet_road::load_config;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref());
    let result = match cli.command {
        Commands::Run { tick_ms, lane } => run::cmd_run(config, tick_ms, lane),
        Commands::Keys(sub) => keys::cmd_keys(&config, sub),
    };
    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
