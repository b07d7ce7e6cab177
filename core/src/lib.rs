//! Dependency-free data structures shared by the crawler's reactor: a
//! back-indexed min-heap, a ring-buffer deque, and a monotonic clock.

pub mod clock;
pub mod deque;
pub mod heap;

pub use clock::{Clock, ClockError, Instant};
pub use deque::Deque;
pub use heap::{Heap, Indexed};
