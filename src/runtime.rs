//! Wires the reactor and proto crates into a runnable crawler: stdin's
//! line reader feeding the admission queue, the periodic tick, and the
//! main loop that drives the dispatcher and timer service.
//!
//! `Dispatcher<Runtime>` and `TimerService<Runtime>` are sibling local
//! variables in [`run`], never fields of `Runtime` itself. `TimerService`'s
//! own `fire_due` takes `&mut self` and `ctx: &mut Runtime` at once;
//! nesting the service inside the `Ctx` it operates on would mean
//! borrowing `timers` out of `ctx` while also holding `&mut ctx`, which
//! the borrow checker cannot allow. Every reactor trait in this crate
//! (`FdHandler`, `ErrHandler`, `OnRead`/`LineCallback`) threads `timers`
//! through as an explicit parameter for the same reason.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gcrawl_core::{Clock, ClockError, Instant};
use gcrawl_reactor::{
    probe_fd_available, AdmissionQueue, Dispatcher, ErrHandler, File, FileError, LineCallback,
    LineOutcome, LineReader, StderrErrHandler, TimerHandle, TimerService,
};
use tracing::{debug, info, trace, warn};

use crate::cli::Args;

/// The interval of the `Q: <pending> <active>` status line, per spec.md
/// §4.9 ("every ~10 ms").
const TICK_INTERVAL_SECS: f64 = 0.01;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("monotonic clock unusable: {0}")]
    Clock(#[from] ClockError),
    #[error("i/o error setting up the event loop: {0}")]
    Io(#[from] io::Error),
}

/// Everything [`gcrawl_proto::connection`] needs from the runtime, plus
/// the admission/tick state the main loop itself drives.
pub struct Runtime {
    clock: Clock,
    stdout: Rc<RefCell<File<Runtime>>>,
    admission: AdmissionQueue,
    max_connections: usize,
    idle_timeout_secs: f64,
    user_agent: String,
    tick_timer: Option<TimerHandle<Runtime>>,
    shutting_down: bool,
    /// Whether stdin's `File` is still registered with the dispatcher.
    /// `dispatcher.len()` only ever holds stdout once stdin hits EOF (its
    /// `File` unregisters itself via `fail()`), so the active-connection
    /// count below must subtract this instead of a hardcoded "2".
    stdin_open: bool,
}

impl Runtime {
    /// Number of currently active peer connections: every dispatcher slot
    /// that isn't stdout, or stdin while it's still registered.
    fn active_connections(&self, dispatcher: &Dispatcher<Runtime>) -> usize {
        let housekeeping = 1 + self.stdin_open as usize;
        dispatcher.len().saturating_sub(housekeeping)
    }
}

impl gcrawl_proto::Env for Runtime {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn idle_timeout_secs(&self) -> f64 {
        self.idle_timeout_secs
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn stdout(&self) -> &Rc<RefCell<File<Self>>> {
        &self.stdout
    }
}

/// Stdin's read handler (pushes raw lines onto the admission queue,
/// leaving address validation to [`gcrawl_proto::spawn`]) and error
/// handler (cancels the tick timer on EOF, the Open Question resolution
/// that gives the main loop's termination condition a path to becoming
/// true — see spec.md §9).
struct StdinHandler;

impl LineCallback<Runtime> for StdinHandler {
    fn on_line(
        &mut self,
        ctx: &mut Runtime,
        _timers: &mut TimerService<Runtime>,
        line: &str,
        _file: &mut File<Runtime>,
        _dispatcher: &mut Dispatcher<Runtime>,
    ) -> LineOutcome {
        if !line.is_empty() {
            ctx.admission.push(line.to_string());
        }
        LineOutcome::Continue
    }
}

impl ErrHandler<Runtime> for StdinHandler {
    fn on_error(
        &mut self,
        ctx: &mut Runtime,
        timers: &mut TimerService<Runtime>,
        _file: &mut File<Runtime>,
        _dispatcher: &mut Dispatcher<Runtime>,
        reason: FileError,
    ) {
        trace!(target: "gcrawl::runtime", ?reason, "stdin closed");
        ctx.stdin_open = false;
        if let Some(timer) = ctx.tick_timer.take() {
            timers.cancel(timer);
        }
    }
}

fn tick(ctx: &mut Runtime, timers: &mut TimerService<Runtime>, dispatcher: &mut Dispatcher<Runtime>) {
    let active = ctx.active_connections(dispatcher);
    ctx.stdout
        .borrow_mut()
        .printf(dispatcher, format_args!("Q: {} {}\n", ctx.admission.len(), active));

    let now = ctx.now();
    let handle = timers.schedule(now, TICK_INTERVAL_SECS, tick);
    ctx.tick_timer = Some(handle);
}

/// Pops addresses off the admission queue while under the concurrency cap
/// and the process has spare fds, starting a new Gnutella connection for
/// each (spec.md §4.8).
fn drain_admission(ctx: &mut Runtime, timers: &mut TimerService<Runtime>, dispatcher: &mut Dispatcher<Runtime>) {
    loop {
        let active = ctx.active_connections(dispatcher);
        if active >= ctx.max_connections || ctx.admission.is_empty() {
            return;
        }
        if !probe_fd_available() {
            debug!(target: "gcrawl::admission", "fd-exhausted, deferring admission");
            return;
        }
        let addr = match ctx.admission.pop() {
            Some(addr) => addr,
            None => return,
        };
        gcrawl_proto::spawn(&addr, ctx, timers, dispatcher);
    }
}

pub fn run(args: Args) -> Result<(), RuntimeError> {
    let clock = Clock::init()?;

    let mut dispatcher: Dispatcher<Runtime> = Dispatcher::new()?;
    let mut timers: TimerService<Runtime> = TimerService::new();

    let stdout = File::new(libc::STDOUT_FILENO, Rc::new(RefCell::new(StderrErrHandler)), &mut dispatcher)?;

    let mut runtime = Runtime {
        clock,
        stdout,
        admission: AdmissionQueue::new(),
        max_connections: args.max_connections,
        idle_timeout_secs: args.idle_timeout_secs,
        user_agent: args.user_agent,
        tick_timer: None,
        shutting_down: false,
        stdin_open: true,
    };

    let stdin = File::new(libc::STDIN_FILENO, Rc::new(RefCell::new(StdinHandler)), &mut dispatcher)?;
    stdin.borrow_mut().set_read_handler(Rc::new(RefCell::new(LineReader::new(Rc::new(RefCell::new(StdinHandler))))));

    let now = runtime.now();
    let handle = timers.schedule(now, TICK_INTERVAL_SECS, tick);
    runtime.tick_timer = Some(handle);

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let shutdown_requested = shutdown_requested.clone();
        ctrlc::set_handler(move || {
            shutdown_requested.store(true, Ordering::SeqCst);
        })
        .expect("error installing Ctrl-C handler");
    }

    info!(
        target: "gcrawl::runtime",
        max_connections = runtime.max_connections,
        idle_timeout_secs = runtime.idle_timeout_secs,
        "starting crawler"
    );

    loop {
        if shutdown_requested.load(Ordering::SeqCst) && !runtime.shutting_down {
            warn!(target: "gcrawl::runtime", "shutdown requested, draining in-flight connections");
            runtime.shutting_down = true;
            if let Some(timer) = runtime.tick_timer.take() {
                timers.cancel(timer);
            }
            runtime.admission = AdmissionQueue::new();
        }

        let active = runtime.active_connections(&dispatcher);
        let has_pending_stdout = runtime.stdout.borrow().has_pending_write();
        if active == 0 && timers.is_empty() && !has_pending_stdout {
            break;
        }

        let timeout = match timers.peek_deadline() {
            Some(deadline) => {
                let now = runtime.now();
                if deadline <= now {
                    Some(Duration::ZERO)
                } else {
                    Some(Duration::from_secs_f64(deadline - now))
                }
            }
            None => None,
        };
        dispatcher.poll(timeout)?;

        let now = runtime.now();
        while timers.fire_due(now, &mut runtime, &mut dispatcher) {}

        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut runtime, &mut timers, ready);

        if !runtime.shutting_down {
            drain_admission(&mut runtime, &mut timers, &mut dispatcher);
        }
    }

    info!(target: "gcrawl::runtime", "all connections drained, exiting");
    Ok(())
}
