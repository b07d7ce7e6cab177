//! Bounded admission queue: holds pending peer addresses and is drained
//! by the caller under a concurrency cap and fd-availability probe.

use std::ffi::CString;

use gcrawl_core::Deque;
use tracing::trace;

pub struct AdmissionQueue {
    pending: Deque<String>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self { pending: Deque::new() }
    }

    pub fn push(&mut self, addr: String) {
        trace!(target: "admission", %addr, pending = self.pending.len() + 1, "queued");
        self.pending.push_back(addr);
    }

    pub fn pop(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let addr = self.pending.pop_front();
            trace!(target: "admission", %addr, pending = self.pending.len(), "dequeued");
            Some(addr)
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens and immediately closes `/dev/null` as a cheap probe for spare fd
/// capacity. `false` means the process is fd-exhausted and admission
/// should back off until a slot frees up.
pub fn probe_fd_available() -> bool {
    let dev_null = CString::new("/dev/null").expect("no interior NUL");
    let fd = unsafe { libc::open(dev_null.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return false;
    }
    unsafe {
        libc::close(fd);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_length() {
        let mut q = AdmissionQueue::new();
        assert!(q.is_empty());
        q.push("1.2.3.4:6346".to_string());
        q.push("5.6.7.8:6346".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().as_deref(), Some("1.2.3.4:6346"));
        assert_eq!(q.pop().as_deref(), Some("5.6.7.8:6346"));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn probe_succeeds_on_a_healthy_process() {
        assert!(probe_fd_available());
    }
}
