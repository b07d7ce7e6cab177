//! Splits a File's read buffer on `\n` or `\r\n` and delivers complete
//! lines to a callback.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::dispatcher::Dispatcher;
use crate::file::{File, OnRead};
use crate::timer::TimerService;

/// Returned by [`LineCallback::on_line`] to tell the reader whether to
/// keep scanning the buffer for more lines or to stop and close the File.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Close,
}

pub trait LineCallback<Ctx> {
    fn on_line(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        line: &str,
        file: &mut File<Ctx>,
        dispatcher: &mut Dispatcher<Ctx>,
    ) -> LineOutcome;
}

pub struct LineReader<Ctx> {
    callback: Rc<RefCell<dyn LineCallback<Ctx>>>,
}

impl<Ctx> LineReader<Ctx> {
    pub fn new(callback: Rc<RefCell<dyn LineCallback<Ctx>>>) -> Self {
        Self { callback }
    }
}

impl<Ctx> OnRead<Ctx> for LineReader<Ctx> {
    fn on_read(
        &mut self,
        ctx: &mut Ctx,
        timers: &mut TimerService<Ctx>,
        file: &mut File<Ctx>,
        dispatcher: &mut Dispatcher<Ctx>,
    ) {
        // Take the buffer by value so nothing here holds a borrow of
        // `file` across the callback, which is free to mutate or delete
        // `file` itself.
        let buf = std::mem::take(file.rbuf_mut());

        let mut last = 0;
        let mut i = 0;
        while i < buf.len() {
            if buf[i] != b'\n' {
                i += 1;
                continue;
            }
            let end = if i > last && buf[i - 1] == b'\r' { i - 1 } else { i };
            let line = String::from_utf8_lossy(&buf[last..end]).into_owned();
            last = i + 1;
            i = last;

            trace!(target: "file", fd = file.raw_fd(), len = line.len(), "line delivered");
            let outcome = self.callback.borrow_mut().on_line(ctx, timers, &line, file, dispatcher);
            if file.is_deleted() {
                // The File must not be touched further; its buffer is
                // being torn down along with it, so there's nothing left
                // to compact back in.
                return;
            }
            if outcome == LineOutcome::Close {
                file.delete(dispatcher);
                return;
            }
        }

        file.rbuf_mut().extend_from_slice(&buf[last..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{ErrHandler, FileError, NoopErrHandler};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct Ctx {
        lines: Vec<String>,
        close_after: Option<usize>,
    }

    struct Collector;
    impl LineCallback<Ctx> for Collector {
        fn on_line(
            &mut self,
            ctx: &mut Ctx,
            _timers: &mut TimerService<Ctx>,
            line: &str,
            file: &mut File<Ctx>,
            dispatcher: &mut Dispatcher<Ctx>,
        ) -> LineOutcome {
            ctx.lines.push(line.to_string());
            if ctx.close_after == Some(ctx.lines.len()) {
                file.delete(dispatcher);
                return LineOutcome::Close;
            }
            LineOutcome::Continue
        }
    }

    struct IgnoreErr;
    impl ErrHandler<Ctx> for IgnoreErr {
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

    fn deliver(input: &[u8]) -> Vec<String> {
        let mut dispatcher: Dispatcher<Ctx> = Dispatcher::new().unwrap();
        let mut timers: TimerService<Ctx> = TimerService::new();
        let mut ctx = Ctx { lines: Vec::new(), close_after: None };
        let (mut w, r) = UnixStream::pair().unwrap();
        use std::io::Write;
        w.write_all(input).unwrap();
        drop(w);

        let rfile = File::new(r.into_raw_fd(), Rc::new(RefCell::new(NoopErrHandler)), &mut dispatcher).unwrap();
        rfile.borrow_mut().set_read_handler(Rc::new(RefCell::new(LineReader::new(Rc::new(RefCell::new(Collector))))));

        dispatcher.poll(Some(Duration::from_millis(200))).unwrap();
        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut ctx, &mut timers, ready);
        ctx.lines
    }

    #[test]
    fn splits_lf_and_crlf_and_buffers_the_tail() {
        let lines = deliver(b"foo\nbar\r\nbaz");
        assert_eq!(lines, vec!["foo", "bar"]);
    }

    #[test]
    fn delete_from_within_line_callback_stops_further_delivery() {
        let mut dispatcher: Dispatcher<Ctx> = Dispatcher::new().unwrap();
        let mut timers: TimerService<Ctx> = TimerService::new();
        let mut ctx = Ctx { lines: Vec::new(), close_after: Some(1) };
        let (mut w, r) = UnixStream::pair().unwrap();
        use std::io::Write;
        w.write_all(b"one\ntwo\nthree\n").unwrap();
        drop(w);

        let rfile = File::new(r.into_raw_fd(), Rc::new(RefCell::new(IgnoreErr)), &mut dispatcher).unwrap();
        rfile.borrow_mut().set_read_handler(Rc::new(RefCell::new(LineReader::new(Rc::new(RefCell::new(Collector))))));

        dispatcher.poll(Some(Duration::from_millis(200))).unwrap();
        let ready = dispatcher.ready();
        dispatcher.dispatch(&mut ctx, &mut timers, ready);

        assert_eq!(ctx.lines, vec!["one"]);
    }
}
