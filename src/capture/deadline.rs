//! Single re-armable deadline
//!
//! One owned `Sleep` that is reset in place. Re-arming replaces the previous
//! deadline, so an earlier deadline can never fire after a later one has
//! been set.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{self, Instant, Sleep};

pub struct Deadline {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Deadline {
    /// Create a disarmed deadline; must be called inside a runtime
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// Set (or move) the deadline to `at`
    pub fn arm(&mut self, at: Instant) {
        self.sleep.as_mut().reset(at);
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Wait for the deadline, then disarm
    ///
    /// Pending forever while disarmed.
    pub async fn fired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        (&mut self.sleep).await;
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let start = Instant::now();
        let mut deadline = Deadline::new();
        deadline.arm(start + Duration::from_secs(3));
        deadline.arm(start + Duration::from_secs(5));

        deadline.fired().await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5_010));
        assert!(!deadline.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_deadline_never_fires() {
        let mut deadline = Deadline::new();
        deadline.arm(Instant::now() + Duration::from_millis(10));
        deadline.disarm();

        let mut fired = task::spawn(deadline.fired());
        assert_pending!(fired.poll());
        time::advance(Duration::from_secs(60)).await;
        assert_pending!(fired.poll());
    }
}
