//! Readiness-multiplexed fd dispatcher: owns the watched-fd table and
//! invokes per-fd handlers when `mio` reports readiness.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::timer::TimerService;

/// A stable identity for a registered fd. Its slot index may move (via
/// swap-remove) but the token never changes, which is what lets the
/// dispatcher snapshot a ready set before invoking any handlers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FdHandle(Token);

#[derive(Clone, Copy, Debug, Default)]
pub struct FdEvents {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl From<&mio::event::Event> for FdEvents {
    fn from(e: &mio::event::Event) -> Self {
        Self {
            readable: e.is_readable(),
            writable: e.is_writable(),
            error: e.is_error(),
            hangup: e.is_read_closed() || e.is_write_closed(),
        }
    }
}

/// Implemented by whatever owns a registered fd (in this crate, always
/// [`crate::file::File`]). `timers` is threaded through alongside `ctx`
/// and `dispatcher` rather than reachable from either of them, so a
/// handler that needs to reset an idle timer never has to fight the
/// borrow checker over a `TimerService` nested inside its own `Ctx` (see
/// the dispatcher/timer-service sibling note in the crate docs).
pub trait FdHandler<Ctx> {
    fn on_ready(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        events: FdEvents,
        dispatcher: &mut Dispatcher<Ctx>,
    );
}

struct Slot<Ctx> {
    token: Token,
    raw_fd: RawFd,
    writable_interest: bool,
    handler: Rc<RefCell<dyn FdHandler<Ctx>>>,
}

pub struct Dispatcher<Ctx> {
    poll: Poll,
    slots: Vec<Slot<Ctx>>,
    index_of: HashMap<Token, usize>,
    next_token: usize,
    events: Events,
}

impl<Ctx> Dispatcher<Ctx> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            slots: Vec::new(),
            index_of: HashMap::new(),
            next_token: 0,
            events: Events::with_capacity(1024),
        })
    }

    /// Number of currently-registered fds (stdin + stdout + active peer
    /// connections, in the crawler's use).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn register(
        &mut self,
        raw_fd: RawFd,
        handler: Rc<RefCell<dyn FdHandler<Ctx>>>,
    ) -> io::Result<FdHandle> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&raw_fd), token, Interest::READABLE)?;

        let index = self.slots.len();
        self.slots.push(Slot { token, raw_fd, writable_interest: false, handler });
        self.index_of.insert(token, index);
        trace!(target: "dispatcher", fd = raw_fd, token = token.0, "registered");
        Ok(FdHandle(token))
    }

    /// Adds or removes write-readiness interest for a registered fd.
    pub fn set_writable(&mut self, handle: FdHandle, writable: bool) -> io::Result<()> {
        let index = *self
            .index_of
            .get(&handle.0)
            .expect("set_writable on an unregistered fd handle");
        let slot = &mut self.slots[index];
        if slot.writable_interest == writable {
            return Ok(());
        }
        slot.writable_interest = writable;
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll.registry().reregister(&mut SourceFd(&slot.raw_fd), slot.token, interest)
    }

    /// Closes the fd and swap-removes its slot, fixing up the swapped
    /// entry's index. A no-op if already unregistered.
    pub fn unregister(&mut self, handle: FdHandle) -> io::Result<()> {
        let index = match self.index_of.remove(&handle.0) {
            Some(i) => i,
            None => return Ok(()),
        };
        self.poll.registry().deregister(&mut SourceFd(&self.slots[index].raw_fd))?;
        trace!(target: "dispatcher", fd = self.slots[index].raw_fd, token = handle.0 .0, "unregistered");
        unsafe {
            libc::close(self.slots[index].raw_fd);
        }

        let last = self.slots.len() - 1;
        if index != last {
            self.slots.swap(index, last);
            self.index_of.insert(self.slots[index].token, index);
        }
        self.slots.pop();
        Ok(())
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)
    }

    /// Snapshots the current ready set as stable handles before any
    /// handler runs, so a handler unregistering an fd (its own, or one
    /// later in this same ready set) can never cause a skipped or
    /// double-invoked callback.
    pub fn ready(&self) -> Vec<(FdHandle, FdEvents)> {
        self.events.iter().map(|e| (FdHandle(e.token()), FdEvents::from(e))).collect()
    }

    pub fn dispatch(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        ready: Vec<(FdHandle, FdEvents)>,
    ) {
        for (handle, events) in ready {
            let handler = match self.index_of.get(&handle.0) {
                Some(&index) => self.slots[index].handler.clone(),
                None => continue,
            };
            handler.borrow_mut().on_ready(ctx, timers, events, self);
        }
    }
}
