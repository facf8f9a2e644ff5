//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::future;
use std::pin::Pin;

use crate::utils::ConclaveError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports cancellation
/// and re-kickoff with a different duration for incremental backoff, etc.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// awaiting multiple times.
    sleep: Pin<Box<Sleep>>,

    /// True if a timeout is currently scheduled.
    armed: bool,

    /// Timeout duration used by the last kickoff.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer utility in unarmed state.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
            last_dur: Duration::ZERO,
        }
    }

    /// Gets the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Arms the timer to fire after the given duration, overwriting any
    /// currently scheduled timeout.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), ConclaveError> {
        if dur.is_zero() {
            return Err(ConclaveError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        self.armed = true;
        Ok(())
    }

    /// Disarms the timer; a pending `timeout()` await will no longer fire.
    pub fn cancel(&mut self) -> Result<(), ConclaveError> {
        self.armed = false;
        Ok(())
    }

    /// Waits for the timer to fire. Never resolves while unarmed; typically
    /// used as a branch of a `tokio::select!`. Disarms upon firing.
    pub async fn timeout(&mut self) {
        if !self.armed {
            future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new_unarmed() {
        let timer = Timer::new();
        assert!(timer.get_dur().is_zero());
        assert!(!timer.armed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_kickoff() -> Result<(), ConclaveError> {
        let mut timer = Timer::new();
        // round 1 with 200ms timeout
        let mut start = Instant::now();
        timer.kickoff(Duration::from_millis(200))?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        assert_eq!(timer.get_dur(), Duration::from_millis(200));
        // round 2 with 100ms incremental backoff
        start = Instant::now();
        timer.kickoff(timer.get_dur() + Duration::from_millis(100))?;
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(300));
        assert_eq!(timer.get_dur(), Duration::from_millis(300));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), ConclaveError> {
        let mut timer = Timer::new();
        timer.kickoff(Duration::from_millis(50))?;
        timer.cancel()?;
        tokio::select! {
            _ = timer.timeout() => panic!("cancelled timer fired"),
            _ = tokio::time::sleep(Duration::from_millis(150)) => {},
        }
        Ok(())
    }
}
