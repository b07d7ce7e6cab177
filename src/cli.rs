//! Command-line surface: the handful of knobs spec.md calls out (idle
//! timeout, concurrency cap, User-Agent), each overridable via its
//! `GCRAWL_*` environment variable, plus the logging verbosity flag.

use clap::Parser;

#[derive(Clone, Debug, Parser)]
#[clap(name = "gcrawl", about = "A single-threaded Gnutella ultrapeer crawler")]
pub struct Args {
    #[clap(
        long,
        env = "GCRAWL_IDLE_TIMEOUT_SECS",
        help = "seconds a peer connection may sit idle before it is reported as a timeout",
        default_value = "10"
    )]
    pub idle_timeout_secs: f64,

    #[clap(
        long,
        env = "GCRAWL_MAX_CONNECTIONS",
        help = "maximum number of simultaneous outbound peer connections",
        default_value = "4000"
    )]
    pub max_connections: usize,

    #[clap(
        long,
        env = "GCRAWL_USER_AGENT",
        help = "User-Agent value sent in the Gnutella handshake request",
        default_value = "gcrawl/0.1"
    )]
    pub user_agent: String,

    #[clap(short, long, action = clap::ArgAction::Count, help = "increase log verbosity (repeatable); ignored if RUST_LOG is set")]
    pub verbose: u8,
}
