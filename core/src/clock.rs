//! A monotonic, process-local clock.

use std::time::{Duration, Instant as StdInstant};

/// Seconds elapsed since the clock's zero, fixed at [`Clock::init`].
pub type Instant = f64;

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("monotonic clock resolution {0:?} is coarser than the required 5ms")]
    InsufficientResolution(Duration),
}

pub struct Clock {
    start: StdInstant,
}

impl Clock {
    /// Validates the platform's monotonic clock resolution and captures
    /// the zero point. Fails if the resolution is coarser than 5ms, one of
    /// this crate's fatal startup conditions.
    pub fn init() -> Result<Self, ClockError> {
        let mut res = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let rc = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) };
        assert_eq!(rc, 0, "clock_getres(CLOCK_MONOTONIC) failed");

        if res.tv_sec != 0 || res.tv_nsec > 5_000_000 {
            let resolution = Duration::new(res.tv_sec as u64, res.tv_nsec as u32);
            return Err(ClockError::InsufficientResolution(resolution));
        }

        Ok(Self { start: StdInstant::now() })
    }

    pub fn now(&self) -> Instant {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_nonnegative_and_nondecreasing() {
        let clock = Clock::init().expect("platform clock resolution");
        let a = clock.now();
        let b = clock.now();
        assert!(a >= 0.0);
        assert!(b >= a);
    }
}
