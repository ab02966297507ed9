// SPDX-License-Identifier: MIT

//! Monotonic high-resolution tick clock

use std::time::Instant;

/// Monotonic clock reporting elapsed 100 ns ticks since construction.
///
/// All event timestamps in a trace come from one instance, so gaps between
/// them are directly comparable.
#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed ticks since the clock was created.
    pub fn elapsed_ticks(&self) -> u64 {
        let nanos = self.start.elapsed().as_nanos();
        (nanos / 100) as u64
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TICKS_PER_MS;

    #[test]
    fn ticks_are_monotonic() {
        let clock = TickClock::new();
        let a = clock.elapsed_ticks();
        let b = clock.elapsed_ticks();
        assert!(b >= a);
    }

    #[test]
    fn sleep_advances_by_roughly_the_slept_amount() {
        let clock = TickClock::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.elapsed_ticks() >= 5 * TICKS_PER_MS);
    }
}
