//! Readiness-multiplexed event-loop reactor: the timer service, the fd
//! dispatcher, the buffered non-blocking File built on top of it, the
//! line reader, and the admission queue that gates outbound connections.
//!
//! Every piece here is generic over a caller-supplied context type `Ctx`
//! (the crawler's concrete `Runtime`), so this crate has no dependency on
//! anything Gnutella-specific.

pub mod admission;
pub mod dispatcher;
pub mod file;
pub mod line;
pub mod timer;

pub use admission::{probe_fd_available, AdmissionQueue};
pub use dispatcher::{Dispatcher, FdEvents, FdHandle, FdHandler};
pub use file::{ErrHandler, File, FileError, NoopErrHandler, OnRead, StderrErrHandler};
pub use line::{LineCallback, LineOutcome, LineReader};
pub use timer::{TimerHandle, TimerService};
