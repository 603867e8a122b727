use std::{hint, thread};

use super::error::Result;

/// Something the controller can block on until a condition holds.
///
/// `poll` is called repeatedly; each call should make whatever progress it
/// can (drain the transport, count grants) and report whether the condition
/// now holds. An error from `poll` ends the wait.
pub trait Waiter {
    fn wait_until<F>(&mut self, poll: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>;
}

/// Spins on the condition with no timeout. After `spins_per_yield` failed
/// polls the thread yields once so a simulated mesh sharing one machine keeps
/// moving.
#[derive(Clone, Debug)]
pub struct BusyPoll {
    spins_per_yield: u32,
    polls: u64,
}

impl BusyPoll {
    pub fn new(spins_per_yield: u32) -> Self {
        Self {
            spins_per_yield: spins_per_yield.max(1),
            polls: 0,
        }
    }

    /// Total polls made across every wait.
    pub fn polls(&self) -> u64 {
        self.polls
    }
}

impl Default for BusyPoll {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Waiter for BusyPoll {
    fn wait_until<F>(&mut self, mut poll: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let mut spins = 0;
        loop {
            self.polls += 1;
            if poll()? {
                return Ok(());
            }
            spins += 1;
            if spins == self.spins_per_yield {
                spins = 0;
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }
}
