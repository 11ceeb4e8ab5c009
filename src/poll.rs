//! sdcard-blockio - Bounded polling
//!
//! Every wait in this driver is a capped retry count with a fixed interval:
//! card busy lines, data-token waits and the operating-condition poll all
//! share this helper instead of re-deriving timeout arithmetic per call
//! site. There is no cooperative suspension anywhere.

use crate::Error;

/// A poll budget: a number of attempts spaced by a fixed interval.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct BoundedPoll {
    remaining: u32,
    interval_us: u32,
}

impl BoundedPoll {
    /// A budget of `attempts` probes, `interval_us` apart. `attempts` must
    /// be at least one.
    pub fn new(attempts: u32, interval_us: u32) -> BoundedPoll {
        BoundedPoll {
            remaining: attempts,
            interval_us,
        }
    }

    /// Account one failed probe. Returns `err` once the attempt budget is
    /// spent, otherwise delays for the interval and lets the caller probe
    /// again.
    pub fn retry<F>(&mut self, mut delay: F, err: Error) -> Result<(), Error>
    where
        F: FnMut(u32),
    {
        self.remaining -= 1;
        if self.remaining == 0 {
            return Err(err);
        }
        delay(self.interval_us);
        Ok(())
    }
}
