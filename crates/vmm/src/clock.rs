//! Monotonic tick counter.
//!
//! Heap-page load timestamps come from a tick counter advanced by the timer
//! interrupt. The count lives behind a lock so that reads from fault context
//! on one core never observe a torn update from the timer on another.

/// A lock-protected monotonic tick counter.
pub struct Clock {
    ticks: spin::Mutex<u64>,
}

impl Clock {
    /// Creates a clock at tick zero.
    pub const fn new() -> Self {
        Self {
            ticks: spin::Mutex::new(0),
        }
    }

    /// Returns the current tick.
    pub fn now(&self) -> u64 {
        *self.ticks.lock()
    }

    /// Advances the clock by one tick, returning the new value.
    pub fn advance(&self) -> u64 {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        *ticks
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.now(), 2);
    }
}
