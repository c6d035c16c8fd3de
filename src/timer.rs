//! Cancellable timer that can only be pulled earlier
//!
//! One abstraction backs both the per-call deadline monitor and the server's shutdown drain:
//! a clock fires once, and later requests can move the firing point earlier but never later.

use std::time::Duration;

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

/// Stand-in for "never" when a requested delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `delay` from now, clamped to a far-future instant instead of overflowing.
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

#[derive(Debug)]
pub struct DrainTimer {
    deadline: watch::Sender<Instant>,
    disarmed: CancellationToken,
}

impl DrainTimer {
    pub fn new(deadline: Instant) -> Self {
        let (deadline, _) = watch::channel(deadline);
        Self {
            deadline,
            disarmed: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }

    /// Moves the deadline to `candidate` if that is earlier than the current one.
    ///
    /// Returns whether the deadline changed.
    pub fn advance_to(&self, candidate: Instant) -> bool {
        self.deadline.send_if_modified(|current| {
            if candidate < *current {
                *current = candidate;
                true
            } else {
                false
            }
        })
    }

    /// Stops the timer; pending and future `expired` calls resolve to `false`.
    pub fn disarm(&self) {
        self.disarmed.cancel();
    }

    pub fn is_disarmed(&self) -> bool {
        self.disarmed.is_cancelled()
    }

    /// Resolves to `true` once the (possibly advanced) deadline passes, or `false`
    /// if the timer is disarmed first.
    pub async fn expired(&self) -> bool {
        let mut changes = self.deadline.subscribe();
        loop {
            let at = *changes.borrow_and_update();
            tokio::select! {
                biased;
                _ = self.disarmed.cancelled() => return false,
                _ = tokio::time::sleep_until(at) => return true,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{deadline_after, DrainTimer, FAR_FUTURE};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn oversized_delays_clamp_instead_of_overflowing() {
        let start = Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(2)), start + Duration::from_secs(2));
        assert_eq!(deadline_after(Duration::MAX), start + FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_deadline() {
        let start = Instant::now();
        let timer = DrainTimer::new(start + Duration::from_secs(3));

        assert!(timer.expired().await);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn only_earlier_deadlines_are_honored() {
        let start = Instant::now();
        let timer = DrainTimer::new(start + Duration::from_secs(10));

        assert!(!timer.advance_to(start + Duration::from_secs(20)));
        assert_eq!(timer.deadline(), start + Duration::from_secs(10));

        assert!(timer.advance_to(start + Duration::from_secs(4)));
        assert_eq!(timer.deadline(), start + Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn advancing_wakes_a_pending_wait() {
        let start = Instant::now();
        let timer = Arc::new(DrainTimer::new(start + Duration::from_secs(60)));

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.expired().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.advance_to(Instant::now());

        assert!(waiter.await.expect("waiter task"));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_resolves_false() {
        let timer = Arc::new(DrainTimer::new(Instant::now() + Duration::from_secs(60)));

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.expired().await })
        };

        timer.disarm();
        assert!(!waiter.await.expect("waiter task"));
        assert!(timer.is_disarmed());
    }
}
