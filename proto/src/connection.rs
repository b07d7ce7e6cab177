//! Per-peer Gnutella/0.6 connection state machine: handshake, header
//! accumulation, report emission, and destruction.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use tracing::trace;

use gcrawl_core::Instant;
use gcrawl_reactor::{Dispatcher, ErrHandler, File, FileError, LineCallback, LineOutcome, LineReader};
use gcrawl_reactor::{TimerHandle, TimerService};

use crate::error::ConnError;

/// Everything a [`GnutellaConnection`] needs from its host runtime except
/// the timer service, which is threaded through every call as its own
/// sibling parameter (see the reactor crate's `FdHandler`/`OnRead`/
/// `ErrHandler` traits) rather than reachable from `Env` itself — `Env`
/// is the concrete `Runtime`, and nesting `TimerService<Runtime>` inside
/// it would make `TimerService::fire_due`'s `(&mut self, ctx: &mut
/// Runtime, ..)` call alias its own receiver out of `ctx`.
pub trait Env: Sized {
    fn now(&self) -> Instant;
    fn idle_timeout_secs(&self) -> f64;
    fn user_agent(&self) -> &str;
    fn stdout(&self) -> &Rc<RefCell<File<Self>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    Peer,
    Ultrapeer,
    Leaf,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerType::Peer => "Peer",
            PeerType::Ultrapeer => "Ultrapeer",
            PeerType::Leaf => "Leaf",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitStatus,
    ReadHeaders,
}

pub struct GnutellaConnection<E: Env> {
    addr: String,
    state: ConnState,
    user_agent: Option<String>,
    peer_type: PeerType,
    neighbors: Option<String>,
    leafs: Option<String>,
    saw_x_ultrapeer: bool,
    file: Weak<RefCell<File<E>>>,
    timer: Option<TimerHandle<E>>,
    reported: bool,
}

/// Strips the ` (os error N)` suffix `std::io::Error`'s `Display` adds,
/// so report lines read like `Failed: Connection refused` rather than
/// `Failed: Connection refused (os error 111)`.
fn errno_message(err: &io::Error) -> String {
    let full = err.to_string();
    match full.split_once(" (os error") {
        Some((msg, _)) => msg.to_string(),
        None => full,
    }
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

/// Reads `SO_ERROR` off a peer fd: `Some(message)` if the socket has a
/// pending error (typically a failed non-blocking `connect`), `None` if
/// the socket is healthy (the hangup/EOF was the peer closing normally).
fn socket_error(fd: std::os::unix::io::RawFd) -> Option<String> {
    let mut errval: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errval as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || errval == 0 {
        None
    } else {
        Some(errno_message(&io::Error::from_raw_os_error(errval)))
    }
}

fn parse_status_code(line: &str) -> Option<u16> {
    let mut parts = line.splitn(3, ' ');
    if parts.next()? != "GNUTELLA/0.6" {
        return None;
    }
    parts.next()?.parse().ok()
}

/// `Peers`/`Leaves`/`User-Agent` headers are accumulated by turning
/// commas into spaces and space-joining each repeated occurrence onto
/// the running field.
fn append_joined(field: &mut Option<String>, value: &str) {
    let tokens = value.replace(',', " ");
    let tokens = tokens.trim();
    match field {
        Some(existing) => {
            existing.push(' ');
            existing.push_str(tokens);
        }
        None => *field = Some(tokens.to_string()),
    }
}

/// Opens an outbound connection to `addr_str`, performs the Gnutella/0.6
/// handshake, and emits exactly one `R:` line when it concludes one way
/// or another. A malformed address is reported synchronously without
/// ever touching the dispatcher.
pub fn spawn<E: Env>(
    addr_str: &str,
    env: &mut E,
    timers: &mut TimerService<E>,
    dispatcher: &mut Dispatcher<E>,
) {
    trace!(target: "gnutella", addr = addr_str, "spawning connection");
    let addr = match SocketAddrV4::from_str(addr_str) {
        Ok(addr) => addr,
        Err(_) => {
            write_report(env, dispatcher, addr_str, Err(&ConnError::BadAddress));
            return;
        }
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        write_report(env, dispatcher, addr_str, Err(&ConnError::Failed(errno_message(&err))));
        return;
    }

    let sockaddr = sockaddr_in(addr);
    let connect_rc = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if connect_rc < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) => {}
            // An unusual connect(2) outcome the original source treats the
            // same as a malformed address; kept as its own distinct report
            // text for fidelity rather than folded into `Failed: …`.
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                unsafe { libc::close(fd) };
                write_report(env, dispatcher, addr_str, Err(&ConnError::BindError));
                return;
            }
            _ => {
                unsafe { libc::close(fd) };
                write_report(env, dispatcher, addr_str, Err(&ConnError::Failed(errno_message(&err))));
                return;
            }
        }
    }

    let conn = Rc::new(RefCell::new(GnutellaConnection {
        addr: addr_str.to_string(),
        state: ConnState::AwaitStatus,
        user_agent: None,
        peer_type: PeerType::Peer,
        neighbors: None,
        leafs: None,
        saw_x_ultrapeer: false,
        file: Weak::new(),
        timer: None,
        reported: false,
    }));

    let file = match File::new(fd, conn.clone(), dispatcher) {
        Ok(file) => file,
        Err(err) => {
            unsafe { libc::close(fd) };
            conn.borrow_mut().report(env, dispatcher, Err(ConnError::Failed(errno_message(&err))));
            return;
        }
    };
    conn.borrow_mut().file = Rc::downgrade(&file);
    file.borrow_mut().set_read_handler(Rc::new(RefCell::new(LineReader::new(conn.clone()))));

    let request = format!(
        "GNUTELLA CONNECT/0.6\r\nUser-Agent: {}\r\nX-Ultrapeer: False\r\nCrawler: 0.1\r\n\r\n",
        env.user_agent(),
    );
    file.borrow_mut().write(dispatcher, request.as_bytes());

    let now = env.now();
    let timeout = env.idle_timeout_secs();
    let timer_conn = conn.clone();
    let handle = timers.schedule(now, timeout, move |env: &mut E, dispatcher: &mut Dispatcher<E>| {
        timer_conn.borrow_mut().on_timeout(env, dispatcher);
    });
    conn.borrow_mut().timer = Some(handle);
}

fn write_report<E: Env>(
    env: &mut E,
    dispatcher: &mut Dispatcher<E>,
    addr: &str,
    outcome: Result<(&str, PeerType, &str, &str), &ConnError>,
) {
    let line = match outcome {
        Ok((user_agent, peer_type, neighbors, leafs)) => {
            format!("R: {addr}(|{user_agent}|): {peer_type} {neighbors}, {leafs}\n")
        }
        Err(err) => format!("R: {addr}(): {err}\n"),
    };
    env.stdout().borrow_mut().write(dispatcher, line.as_bytes());
}

impl<E: Env> GnutellaConnection<E> {
    fn report(&mut self, env: &mut E, dispatcher: &mut Dispatcher<E>, outcome: Result<(), ConnError>) {
        if self.reported {
            return;
        }
        self.reported = true;
        trace!(target: "gnutella", addr = %self.addr, ?outcome, "reporting");
        match outcome {
            Ok(()) => write_report(
                env,
                dispatcher,
                &self.addr,
                Ok((
                    self.user_agent.as_deref().unwrap_or(""),
                    self.peer_type,
                    self.neighbors.as_deref().unwrap_or(""),
                    self.leafs.as_deref().unwrap_or(""),
                )),
            ),
            Err(err) => write_report(env, dispatcher, &self.addr, Err(&err)),
        }
    }

    /// Cancels the idle timer, tearing down the timer's own place in the
    /// heap is always safe even if it already fired (see
    /// `TimerService::cancel`'s no-op-if-absent contract), then tears
    /// down the File. `file` is `Some` when called from a context that
    /// already holds the File's `&mut` (an error or line callback) —
    /// reusing that reference instead of a fresh
    /// `Weak::upgrade().borrow_mut()` avoids re-entering the same
    /// `RefCell` while the dispatcher is still inside this File's own
    /// callback. When called from the timer (no live File reference), a
    /// fresh borrow is safe because we are not inside that callback.
    fn destroy(
        &mut self,
        timers: Option<&mut TimerService<E>>,
        dispatcher: &mut Dispatcher<E>,
        file: Option<&mut File<E>>,
    ) {
        if let Some(timer) = self.timer.take() {
            if let Some(timers) = timers {
                timers.cancel(timer);
            }
        }
        match file {
            Some(file) => file.delete(dispatcher),
            None => {
                if let Some(file) = self.file.upgrade() {
                    file.borrow_mut().delete(dispatcher);
                }
            }
        }
    }

    fn finish(
        &mut self,
        env: &mut E,
        timers: Option<&mut TimerService<E>>,
        dispatcher: &mut Dispatcher<E>,
        file: Option<&mut File<E>>,
        outcome: Result<(), ConnError>,
    ) {
        self.report(env, dispatcher, outcome);
        self.destroy(timers, dispatcher, file);
    }

    fn reset_idle_timer(&mut self, env: &mut E, timers: &mut TimerService<E>) {
        if let Some(timer) = &self.timer {
            let now = env.now();
            let timeout = env.idle_timeout_secs();
            timers.reset(timer, now, timeout);
        }
    }

    /// Invoked directly by the timer service: `self.timer` has already
    /// been popped from the heap by the caller, so `destroy` is told
    /// there is no timer service to cancel against (cancelling a timer
    /// from inside its own firing callback is a no-op anyway, but this
    /// path has no `&mut TimerService` in scope to pass one).
    fn on_timeout(&mut self, env: &mut E, dispatcher: &mut Dispatcher<E>) {
        self.finish(env, None, dispatcher, None, Err(ConnError::Timeout));
    }

    fn handle_status_line(
        &mut self,
        env: &mut E,
        timers: &mut TimerService<E>,
        line: &str,
        file: &mut File<E>,
        dispatcher: &mut Dispatcher<E>,
    ) -> LineOutcome {
        self.reset_idle_timer(env, timers);
        if matches!(parse_status_code(line), Some(200 | 503 | 593)) {
            self.state = ConnState::ReadHeaders;
            return LineOutcome::Continue;
        }
        self.finish(env, Some(timers), dispatcher, Some(file), Err(ConnError::BadHandshake(line.to_string())));
        LineOutcome::Close
    }

    fn handle_header_line(
        &mut self,
        env: &mut E,
        timers: &mut TimerService<E>,
        line: &str,
        file: &mut File<E>,
        dispatcher: &mut Dispatcher<E>,
    ) -> LineOutcome {
        if line.is_empty() {
            self.finish(env, Some(timers), dispatcher, Some(file), Ok(()));
            return LineOutcome::Close;
        }
        self.reset_idle_timer(env, timers);

        let (label, value) = match line.split_once(':') {
            Some((label, value)) => (label.trim(), value.trim()),
            None => {
                self.finish(
                    env,
                    Some(timers),
                    dispatcher,
                    Some(file),
                    Err(ConnError::BadHeaders(line.to_string())),
                );
                return LineOutcome::Close;
            }
        };

        // Label match is case-sensitive, matching `strcmp("X-Ultrapeer",
        // label)` et al. in the original source: only the header *value*
        // (`true`/`false`) is documented as case-insensitive (spec.md
        // §4.9), not the label name itself.
        match label {
            "X-Ultrapeer" => {
                if self.saw_x_ultrapeer {
                    self.finish(
                        env,
                        Some(timers),
                        dispatcher,
                        Some(file),
                        Err(ConnError::MultipleXUltrapeer),
                    );
                    return LineOutcome::Close;
                }
                self.saw_x_ultrapeer = true;
                match value.to_ascii_lowercase().as_str() {
                    "true" => self.peer_type = PeerType::Ultrapeer,
                    "false" => self.peer_type = PeerType::Leaf,
                    _ => {
                        self.finish(
                            env,
                            Some(timers),
                            dispatcher,
                            Some(file),
                            Err(ConnError::BadXUltrapeer(value.to_string())),
                        );
                        return LineOutcome::Close;
                    }
                }
            }
            "Peers" => append_joined(&mut self.neighbors, value),
            "Leaves" => append_joined(&mut self.leafs, value),
            "User-Agent" => append_joined(&mut self.user_agent, value),
            _ => {}
        }
        LineOutcome::Continue
    }
}

impl<E: Env> LineCallback<E> for GnutellaConnection<E> {
    fn on_line(
        &mut self,
        env: &mut E,
        timers: &mut TimerService<E>,
        line: &str,
        file: &mut File<E>,
        dispatcher: &mut Dispatcher<E>,
    ) -> LineOutcome {
        match self.state {
            ConnState::AwaitStatus => self.handle_status_line(env, timers, line, file, dispatcher),
            ConnState::ReadHeaders => self.handle_header_line(env, timers, line, file, dispatcher),
        }
    }
}

impl<E: Env> ErrHandler<E> for GnutellaConnection<E> {
    fn on_error(
        &mut self,
        env: &mut E,
        timers: &mut TimerService<E>,
        file: &mut File<E>,
        dispatcher: &mut Dispatcher<E>,
        reason: FileError,
    ) {
        if self.reported {
            return;
        }
        let err = match reason {
            FileError::Eof => ConnError::ConnectionDropped,
            FileError::Hangup | FileError::ErrorEvent => match socket_error(file.raw_fd()) {
                Some(message) => ConnError::Failed(message),
                None => ConnError::ConnectionDropped,
            },
        };
        self.finish(env, Some(timers), dispatcher, Some(file), Err(err));
    }
}
