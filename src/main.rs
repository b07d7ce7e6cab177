//! The `gcrawl` CLI: parses arguments, raises the process fd limit (this
//! crawler's whole point is thousands of concurrent sockets), initializes
//! logging, and hands off to the event loop in [`runtime::run`].

mod cli;
mod runtime;

use clap::Parser;
use tracing_subscriber::prelude::*;

use cli::Args;

/// `-v` repeat count to `tracing` level, used only when `RUST_LOG` isn't
/// set (mirrors the teacher's `init_tracing` default/explicit-env split).
fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::new(verbosity_filter(verbose)))
            .with(tracing_subscriber::fmt::layer().without_time().with_target(false))
            .init();
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);
    let _ = fdlimit::raise_fd_limit();

    if let Err(err) = runtime::run(args) {
        tracing::error!(target: "gcrawl", %err, "crawler exited with an error");
        std::process::exit(1);
    }
}
