//! Buffered non-blocking file: growable read/write buffers atop one fd,
//! formatted writes, and deferred-delete semantics safe to invoke from
//! inside the file's own dispatcher callback.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::trace;

use crate::dispatcher::{Dispatcher, FdEvents, FdHandle, FdHandler};
use crate::timer::TimerService;

const READ_GROWTH: usize = 4096;

/// Why a File tore itself down. Handed to [`ErrHandler::on_error`]; the
/// File closes its fd regardless of what the handler does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// `revents` carried `error`/`invalid`/`urgent`.
    ErrorEvent,
    /// The peer half-closed or fully closed the connection.
    Hangup,
    /// A `read` returned 0 (EOF) and the write buffer has since drained.
    Eof,
}

/// Supplied by whoever owns a File; told why the File is tearing down.
/// The File has already closed its fd's read/write path by the time this
/// runs, so the handler exists purely to let the owner react (emit a
/// report, release other resources) — it must not try to use `file`
/// for further I/O. `timers` is threaded through as a sibling of `ctx`
/// (not reachable from it) so an owner can cancel its own idle timer
/// without a nested `RefCell` re-borrow.
pub trait ErrHandler<Ctx> {
    fn on_error(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        file: &mut File<Ctx>,
        dispatcher: &mut Dispatcher<Ctx>,
        reason: FileError,
    );
}

/// Installed as a File's `read_handler`; invoked once per successful
/// `read` with the File's own `&mut` so the callback never needs a second
/// `RefCell` borrow of the same File.
pub trait OnRead<Ctx> {
    fn on_read(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        file: &mut File<Ctx>,
        dispatcher: &mut Dispatcher<Ctx>,
    );
}

/// An [`ErrHandler`] that silently drops the error, for stdin: a closed
/// or broken stdin is just EOF to the admission loop.
pub struct NoopErrHandler;

impl<Ctx> ErrHandler<Ctx> for NoopErrHandler {
    fn on_error(
        &mut self,
        _ctx: &mut Ctx,
        _timers: &mut TimerService<Ctx>,
        _file: &mut File<Ctx>,
        _dispatcher: &mut Dispatcher<Ctx>,
        _reason: FileError,
    ) {
    }
}

/// An [`ErrHandler`] that prints to stderr, for stdout: there is no
/// sensible recovery from a broken stdout, but losing the fd silently
/// would be worse.
pub struct StderrErrHandler;

impl<Ctx> ErrHandler<Ctx> for StderrErrHandler {
    fn on_error(
        &mut self,
        _ctx: &mut Ctx,
        _timers: &mut TimerService<Ctx>,
        _file: &mut File<Ctx>,
        _dispatcher: &mut Dispatcher<Ctx>,
        reason: FileError,
    ) {
        eprintln!("gcrawl: stdout file error: {reason:?}");
    }
}

pub struct File<Ctx> {
    fd: RawFd,
    handle: Option<FdHandle>,
    wbuf: Vec<u8>,
    rbuf: Vec<u8>,
    eof: bool,
    deleted: bool,
    in_handler: bool,
    err_handler: Rc<RefCell<dyn ErrHandler<Ctx>>>,
    read_handler: Option<Rc<RefCell<dyn OnRead<Ctx>>>>,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl<Ctx> File<Ctx> {
    /// Sets `fd` non-blocking, registers it with `dispatcher`, and returns
    /// the shared handle through which writes/reads/delete are driven.
    pub fn new(
        fd: RawFd,
        err_handler: Rc<RefCell<dyn ErrHandler<Ctx>>>,
        dispatcher: &mut Dispatcher<Ctx>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        set_nonblocking(fd)?;
        let file = Rc::new(RefCell::new(File {
            fd,
            handle: None,
            wbuf: Vec::new(),
            rbuf: Vec::new(),
            eof: false,
            deleted: false,
            in_handler: false,
            err_handler,
            read_handler: None,
        }));
        let handle = dispatcher.register(fd, file.clone())?;
        file.borrow_mut().handle = Some(handle);
        Ok(file)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_read_handler(&mut self, handler: Rc<RefCell<dyn OnRead<Ctx>>>) {
        self.read_handler = Some(handler);
    }

    pub fn clear_read_handler(&mut self) {
        self.read_handler = None;
    }

    fn handle(&self) -> FdHandle {
        self.handle.expect("File used before its dispatcher registration completed")
    }

    /// Appends `bytes` to the write buffer and arms write-readiness.
    pub fn write(&mut self, dispatcher: &mut Dispatcher<Ctx>, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
        dispatcher
            .set_writable(self.handle(), true)
            .expect("set_writable on a registered fd");
    }

    /// Formats `args` (typically via `format_args!`) and appends the
    /// result, exactly like [`File::write`].
    pub fn printf(&mut self, dispatcher: &mut Dispatcher<Ctx>, args: fmt::Arguments<'_>) {
        use std::fmt::Write as _;
        let mut formatted = String::new();
        formatted.write_fmt(args).expect("formatting a File::printf payload never fails");
        self.write(dispatcher, formatted.as_bytes());
    }

    pub fn has_pending_write(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Direct access to the read buffer for [`crate::line::LineReader`],
    /// which needs to take it by value to scan it without holding a
    /// borrow of `File` across its line callback.
    pub(crate) fn rbuf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.rbuf
    }

    /// Marks the File for teardown. If called from outside the File's own
    /// dispatcher callback, tears down (closes the fd, unregisters)
    /// immediately; if called re-entrantly from inside that callback,
    /// teardown is deferred until the callback returns.
    pub fn delete(&mut self, dispatcher: &mut Dispatcher<Ctx>) {
        if self.deleted {
            return;
        }
        self.deleted = true;
        if !self.in_handler {
            dispatcher.unregister(self.handle()).expect("unregister a registered fd");
        }
    }

    fn fail(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        dispatcher: &mut Dispatcher<Ctx>,
        reason: FileError,
    ) {
        if self.deleted {
            return;
        }
        trace!(target: "file", fd = self.fd, ?reason, "tearing down");
        let err_handler = self.err_handler.clone();
        err_handler.borrow_mut().on_error(ctx, timers, self, dispatcher, reason);
        // The handler may already have deleted us; delete() is idempotent,
        // and this guarantees the fd is closed even if it didn't.
        self.delete(dispatcher);
    }

    fn do_write(&mut self, ctx: &mut Ctx, timers: &mut TimerService<Ctx>, dispatcher: &mut Dispatcher<Ctx>) {
        if self.wbuf.is_empty() {
            return;
        }
        let n = unsafe {
            libc::write(self.fd, self.wbuf.as_ptr() as *const libc::c_void, self.wbuf.len())
        };
        if n == 0 {
            panic!("zero-byte write on a writable fd (fd={})", self.fd);
        } else if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    panic!("EAGAIN on a writable fd (fd={}) despite readiness", self.fd);
                }
                _ => self.fail(ctx, timers, dispatcher, FileError::ErrorEvent),
            }
        } else {
            self.wbuf.drain(0..n as usize);
        }
    }

    fn do_read(&mut self, ctx: &mut Ctx, timers: &mut TimerService<Ctx>, dispatcher: &mut Dispatcher<Ctx>) {
        let start = self.rbuf.len();
        if self.rbuf.capacity() - start < READ_GROWTH {
            self.rbuf.reserve(READ_GROWTH);
        }
        let spare = self.rbuf.capacity() - start;
        self.rbuf.resize(start + spare, 0);

        let n = unsafe {
            libc::read(self.fd, self.rbuf[start..].as_mut_ptr() as *mut libc::c_void, spare)
        };
        if n == 0 {
            self.rbuf.truncate(start);
            self.eof = true;
        } else if n < 0 {
            self.rbuf.truncate(start);
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    panic!("EAGAIN on a readable fd (fd={}) despite readiness", self.fd);
                }
                _ => self.fail(ctx, timers, dispatcher, FileError::ErrorEvent),
            }
        } else {
            self.rbuf.truncate(start + n as usize);
            if let Some(read_handler) = self.read_handler.clone() {
                read_handler.borrow_mut().on_read(ctx, timers, self, dispatcher);
            }
        }
    }
}

impl<Ctx> FdHandler<Ctx> for File<Ctx> {
    fn on_ready(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        events: FdEvents,
        dispatcher: &mut Dispatcher<Ctx>,
    ) {
        self.in_handler = true;

        if events.error || events.hangup {
            let reason = if events.hangup { FileError::Hangup } else { FileError::ErrorEvent };
            self.fail(ctx, timers, dispatcher, reason);
        }

        if !self.deleted && events.writable {
            self.do_write(ctx, timers, dispatcher);
        }

        if !self.deleted && events.readable {
            self.do_read(ctx, timers, dispatcher);
        }

        if !self.deleted {
            let writable = !self.wbuf.is_empty();
            dispatcher
                .set_writable(self.handle(), writable)
                .expect("set_writable on a registered fd");
            if !writable && self.eof {
                self.fail(ctx, timers, dispatcher, FileError::Eof);
            }
        }

        self.in_handler = false;
        if self.deleted {
            // Deferred from a delete() call made while in_handler was true.
            dispatcher.unregister(self.handle()).expect("unregister a registered fd");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct Ctx {
        delivered: Vec<u8>,
        errors: Vec<FileError>,
    }

    struct Recorder;
    impl OnRead<Ctx> for Recorder {
        fn on_read(&mut self, ctx: &mut Ctx, _timers: &mut TimerService<Ctx>, file: &mut File<Ctx>, _dispatcher: &mut Dispatcher<Ctx>) {
            ctx.delivered.extend_from_slice(&file.rbuf);
            file.rbuf.clear();
        }
    }

    struct ErrRecorder;
    impl ErrHandler<Ctx> for ErrRecorder {
        fn on_error(
            &mut self,
            ctx: &mut Ctx,
            _timers: &mut TimerService<Ctx>,
            _file: &mut File<Ctx>,
            _dispatcher: &mut Dispatcher<Ctx>,
            reason: FileError,
        ) {
            ctx.errors.push(reason);
        }
    }

    #[test]
    fn writes_exactly_the_given_bytes() {
        let mut dispatcher: Dispatcher<Ctx> = Dispatcher::new().unwrap();
        let mut timers: TimerService<Ctx> = TimerService::new();
        let mut ctx = Ctx { delivered: Vec::new(), errors: Vec::new() };
        let (w, r) = UnixStream::pair().unwrap();

        let wfile = File::new(w.into_raw_fd(), Rc::new(RefCell::new(ErrRecorder)), &mut dispatcher).unwrap();
        wfile.borrow_mut().write(&mut dispatcher, b"abc\n");

        dispatcher.poll(Some(Duration::from_millis(200))).unwrap();
        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut ctx, &mut timers, ready);

        use std::io::Read;
        let mut r = r;
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc\n");
    }

    #[test]
    fn delivers_bytes_read_from_a_pipe() {
        let mut dispatcher: Dispatcher<Ctx> = Dispatcher::new().unwrap();
        let mut timers: TimerService<Ctx> = TimerService::new();
        let mut ctx = Ctx { delivered: Vec::new(), errors: Vec::new() };
        let (mut w, r) = UnixStream::pair().unwrap();
        use std::io::Write;
        w.write_all(b"hello").unwrap();

        let rfile = File::new(r.into_raw_fd(), Rc::new(RefCell::new(ErrRecorder)), &mut dispatcher).unwrap();
        rfile.borrow_mut().set_read_handler(Rc::new(RefCell::new(Recorder)));

        dispatcher.poll(Some(Duration::from_millis(200))).unwrap();
        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut ctx, &mut timers, ready);

        assert_eq!(ctx.delivered, b"hello");
    }

    #[test]
    fn eof_surfaces_as_err_handler_call() {
        let mut dispatcher: Dispatcher<Ctx> = Dispatcher::new().unwrap();
        let mut timers: TimerService<Ctx> = TimerService::new();
        let mut ctx = Ctx { delivered: Vec::new(), errors: Vec::new() };
        let (w, r) = UnixStream::pair().unwrap();
        drop(w);

        let rfile = File::new(r.into_raw_fd(), Rc::new(RefCell::new(ErrRecorder)), &mut dispatcher).unwrap();
        rfile.borrow_mut().set_read_handler(Rc::new(RefCell::new(Recorder)));

        dispatcher.poll(Some(Duration::from_millis(200))).unwrap();
        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut ctx, &mut timers, ready);

        assert_eq!(ctx.errors, vec![FileError::Hangup]);
    }
}
