//! Gnutella/0.6 handshake, header accumulation, and report-line
//! formatting for a single outbound crawler connection. Generic over an
//! [`Env`] trait rather than a concrete runtime type, so this crate knows
//! nothing about the admission queue, CLI, or main loop that drives it.

pub mod connection;
pub mod error;

pub use connection::{spawn, Env, GnutellaConnection, PeerType};
pub use error::ConnError;
