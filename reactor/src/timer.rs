//! Monotonic priority-timer wheel: schedule callbacks at an absolute
//! deadline, with O(log n) cancel and reset.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use gcrawl_core::{Heap, Indexed, Instant};

use crate::dispatcher::Dispatcher;

pub struct TimerState<Ctx> {
    deadline: Instant,
    heap_index: Option<usize>,
    callback: Option<Box<dyn FnOnce(&mut Ctx, &mut Dispatcher<Ctx>)>>,
}

impl<Ctx> Indexed for Rc<RefCell<TimerState<Ctx>>> {
    fn heap_index(&self) -> Option<usize> {
        self.borrow().heap_index
    }
    fn set_heap_index(&mut self, index: Option<usize>) {
        self.borrow_mut().heap_index = index;
    }
}

/// A handle to a scheduled timer. Cloning shares the same underlying
/// timer; `cancel`/`reset` operate on whichever heap entry this handle
/// currently refers to.
pub struct TimerHandle<Ctx>(Rc<RefCell<TimerState<Ctx>>>);

impl<Ctx> Clone for TimerHandle<Ctx> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

fn compare_timers<Ctx>(
    a: &Rc<RefCell<TimerState<Ctx>>>,
    b: &Rc<RefCell<TimerState<Ctx>>>,
) -> Ordering {
    a.borrow()
        .deadline
        .partial_cmp(&b.borrow().deadline)
        .unwrap_or(Ordering::Equal)
}

type TimerHeap<Ctx> = Heap<
    Rc<RefCell<TimerState<Ctx>>>,
    fn(&Rc<RefCell<TimerState<Ctx>>>, &Rc<RefCell<TimerState<Ctx>>>) -> Ordering,
>;

pub struct TimerService<Ctx> {
    heap: TimerHeap<Ctx>,
}

impl<Ctx> TimerService<Ctx> {
    pub fn new() -> Self {
        Self { heap: Heap::new(compare_timers) }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.borrow().deadline)
    }

    pub fn schedule(
        &mut self,
        now: Instant,
        delay: f64,
        callback: impl FnOnce(&mut Ctx, &mut Dispatcher<Ctx>) + 'static,
    ) -> TimerHandle<Ctx> {
        let state = Rc::new(RefCell::new(TimerState {
            deadline: now + delay,
            heap_index: None,
            callback: Some(Box::new(callback)),
        }));
        self.heap.insert(state.clone());
        TimerHandle(state)
    }

    /// No-op if the timer is no longer in the heap (already fired, or
    /// cancelled re-entrantly from its own callback after the dispatcher
    /// already extracted it).
    pub fn cancel(&mut self, handle: TimerHandle<Ctx>) {
        if self.heap.contains(&handle.0) {
            self.heap.remove(&handle.0);
        }
    }

    pub fn reset(&mut self, handle: &TimerHandle<Ctx>, now: Instant, delay: f64) {
        if self.heap.contains(&handle.0) {
            self.heap.remove(&handle.0);
        }
        handle.0.borrow_mut().deadline = now + delay;
        self.heap.insert(handle.0.clone());
    }

    /// Fires the minimum timer if its deadline has passed, returning
    /// whether one fired. At most one timer fires per call, matching the
    /// dispatcher's one-timer-per-outer-iteration firing policy.
    pub fn fire_due(&mut self, now: Instant, ctx: &mut Ctx, dispatcher: &mut Dispatcher<Ctx>) -> bool {
        let due = matches!(self.heap.peek(), Some(t) if t.borrow().deadline <= now);
        if !due {
            return false;
        }
        let state = self.heap.extract_min();
        let callback = state.borrow_mut().callback.take();
        if let Some(callback) = callback {
            callback(ctx, dispatcher);
        }
        true
    }
}

impl<Ctx> Default for TimerService<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        fired: Vec<i32>,
    }

    fn mio_poll() -> Dispatcher<Ctx> {
        Dispatcher::new().expect("mio::Poll::new")
    }

    #[test]
    fn fires_in_nondecreasing_deadline_order() {
        let mut timers = TimerService::new();
        let mut dispatcher = mio_poll();
        let mut ctx = Ctx { fired: Vec::new() };

        timers.schedule(0.0, 0.3, |ctx: &mut Ctx, _| ctx.fired.push(3));
        timers.schedule(0.0, 0.1, |ctx: &mut Ctx, _| ctx.fired.push(1));
        timers.schedule(0.0, 0.2, |ctx: &mut Ctx, _| ctx.fired.push(2));

        while timers.fire_due(1.0, &mut ctx, &mut dispatcher) {}
        assert_eq!(ctx.fired, vec![1, 2, 3]);
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let mut timers = TimerService::new();
        let mut dispatcher = mio_poll();
        let mut ctx = Ctx { fired: Vec::new() };

        let handle = timers.schedule(0.0, 1.0, |ctx: &mut Ctx, _| ctx.fired.push(1));
        timers.cancel(handle);
        assert!(!timers.fire_due(10.0, &mut ctx, &mut dispatcher));
        assert!(ctx.fired.is_empty());
    }

    #[test]
    fn cancel_from_inside_callback_is_noop() {
        let mut timers = TimerService::new();
        let mut dispatcher = mio_poll();
        let mut ctx = Ctx { fired: Vec::new() };

        // A timer cancelling itself (or a handle the dispatcher already
        // extracted) must not panic or double-remove.
        let handle_cell: Rc<RefCell<Option<TimerHandle<Ctx>>>> = Rc::new(RefCell::new(None));
        let handle_cell_clone = handle_cell.clone();
        let handle = timers.schedule(0.0, 0.0, move |ctx: &mut Ctx, _| {
            ctx.fired.push(1);
            let _ = handle_cell_clone;
        });
        *handle_cell.borrow_mut() = Some(handle.clone());
        assert!(timers.fire_due(1.0, &mut ctx, &mut dispatcher));
        timers.cancel(handle);
        assert_eq!(ctx.fired, vec![1]);
    }

    #[test]
    fn reset_with_zero_delay_fires_next_iteration() {
        let mut timers = TimerService::new();
        let mut dispatcher = mio_poll();
        let mut ctx = Ctx { fired: Vec::new() };

        let handle = timers.schedule(0.0, 5.0, |ctx: &mut Ctx, _| ctx.fired.push(1));
        timers.reset(&handle, 0.0, 0.0);
        assert!(timers.fire_due(0.0, &mut ctx, &mut dispatcher));
        assert_eq!(ctx.fired, vec![1]);
    }

    #[test]
    fn reset_with_larger_delay_postpones_firing() {
        let mut timers = TimerService::new();
        let mut dispatcher = mio_poll();
        let mut ctx = Ctx { fired: Vec::new() };

        let handle = timers.schedule(0.0, 1.0, |ctx: &mut Ctx, _| ctx.fired.push(1));
        timers.reset(&handle, 0.0, 10.0);
        assert!(!timers.fire_due(5.0, &mut ctx, &mut dispatcher));
        assert!(timers.fire_due(10.0, &mut ctx, &mut dispatcher));
    }
}
