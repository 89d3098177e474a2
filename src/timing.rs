//! Time sources for the protocol engine
//!
//! Hardware handshakes (endpoint disable, global NAK, FIFO flush) are bounded
//! by an iteration budget rather than wall-clock time. Host-mode port and
//! transfer timers use millisecond deadlines over an injected [`Clock`], so
//! every timeout path is deterministic under test.

/// Monotonic millisecond clock
pub trait Clock {
    /// Milliseconds since an arbitrary epoch; wraps at `u32::MAX`
    fn now_ms(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// Default iteration budget for hardware handshakes
pub const DEFAULT_POLL_BUDGET: u32 = 200_000;

/// Bounded busy-wait
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    remaining: u32,
}

impl PollBudget {
    /// Budget of `iterations` polls
    pub const fn new(iterations: u32) -> Self {
        Self { remaining: iterations }
    }

    /// Poll `done` until it returns true or the budget runs out
    ///
    /// Returns `true` if the condition was met.
    #[inline]
    pub fn wait<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        loop {
            if done() {
                return true;
            }
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            core::hint::spin_loop();
        }
    }

    /// Iterations left
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_BUDGET)
    }
}

/// One-shot millisecond deadline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SoftTimer {
    deadline: Option<u32>,
}

impl SoftTimer {
    /// Disarmed timer
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the timer to expire `ms` milliseconds from `now`
    pub fn start(&mut self, now: u32, ms: u32) {
        self.deadline = Some(now.wrapping_add(ms));
    }

    /// Disarm without firing
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once the deadline has passed
    ///
    /// Wrapping-safe for intervals shorter than `u32::MAX / 2` ms.
    pub fn expired(&self, now: u32) -> bool {
        match self.deadline {
            Some(deadline) => (now.wrapping_sub(deadline) as i32) >= 0,
            None => false,
        }
    }

    /// Disarm and report expiry in one step
    pub fn poll(&mut self, now: u32) -> bool {
        if self.expired(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}
