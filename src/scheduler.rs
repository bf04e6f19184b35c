//! Refresh timer and the delay policy behind it
//!
//! [`RefreshScheduler`] owns the single outstanding refresh timer. Arming
//! always disarms first, so there is never more than one timer armed, however
//! quickly sessions are replaced.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::machine::TimerId;

/// Shortest delay the timer is ever armed with
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Delay before refreshing a token that expires in `expires_in`
///
/// `max(1s, expires_in - margin)`, further capped by `interval` when a fixed
/// refresh interval is configured.
///
/// ```
/// use hasura_auth_session::scheduler::refresh_delay;
/// use std::time::Duration;
///
/// let delay = refresh_delay(Duration::from_secs(3600), Duration::from_secs(60), None);
/// assert_eq!(delay, Duration::from_secs(3540));
/// ```
#[must_use]
pub fn refresh_delay(expires_in: Duration, margin: Duration, interval: Option<Duration>) -> Duration {
    let delay = expires_in.saturating_sub(margin);
    let delay = interval.map_or(delay, |interval| delay.min(interval));
    delay.max(MIN_REFRESH_DELAY)
}

/// Exponential backoff before retry number `attempt` (1-based)
///
/// `base * 2^(attempt - 1)`; attempt 0 is treated as 1.
#[must_use]
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

struct ArmedTimer {
    id: TimerId,
    deadline: Instant,
    task: JoinHandle<()>,
}

/// Holder of the single refresh timer
///
/// When an armed timer elapses, its [`TimerId`] is sent on the channel given
/// to [`RefreshScheduler::new`]. The receiver decides whether the fire is
/// still relevant.
pub struct RefreshScheduler {
    armed: Option<ArmedTimer>,
    fired: mpsc::UnboundedSender<TimerId>,
}

impl RefreshScheduler {
    /// Create a scheduler reporting fires on `fired`
    #[must_use]
    pub fn new(fired: mpsc::UnboundedSender<TimerId>) -> Self {
        Self { armed: None, fired }
    }

    /// Arm timer `id` to fire after `delay`, cancelling any armed timer first
    pub fn arm(&mut self, id: TimerId, delay: Duration) {
        self.disarm();

        let deadline = Instant::now() + delay;
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // receiver gone means the client is shutting down
            let _ = fired.send(id);
        });

        tracing::debug!(timer = %id, delay_ms = delay.as_millis(), "Refresh timer armed");
        self.armed = Some(ArmedTimer { id, deadline, task });
    }

    /// Cancel the armed timer, if any, returning its ID
    pub fn disarm(&mut self) -> Option<TimerId> {
        let armed = self.armed.take()?;
        armed.task.abort();
        tracing::trace!(timer = %armed.id, "Refresh timer disarmed");
        Some(armed.id)
    }

    /// ID of the armed timer
    #[must_use]
    pub fn armed(&self) -> Option<TimerId> {
        self.armed
            .as_ref()
            .filter(|armed| !armed.task.is_finished())
            .map(|armed| armed.id)
    }

    /// When the armed timer fires
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.armed
            .as_ref()
            .filter(|armed| !armed.task.is_finished())
            .map(|armed| armed.deadline)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("armed", &self.armed())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_delay() {
        let margin = Duration::from_secs(60);
        assert_eq!(
            refresh_delay(Duration::from_secs(3600), margin, None),
            Duration::from_secs(3540)
        );
        // floor of one second
        assert_eq!(
            refresh_delay(Duration::from_secs(30), margin, None),
            MIN_REFRESH_DELAY
        );
        assert_eq!(refresh_delay(Duration::ZERO, margin, None), MIN_REFRESH_DELAY);
        // interval caps the delay
        assert_eq!(
            refresh_delay(Duration::from_secs(3600), margin, Some(Duration::from_secs(600))),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_retry_delay() {
        let base = Duration::from_secs(5);
        assert_eq!(retry_delay(base, 0), Duration::from_secs(5));
        assert_eq!(retry_delay(base, 1), Duration::from_secs(5));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(10));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(20));
        // saturates instead of overflowing
        assert!(retry_delay(Duration::MAX, 40) == Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::new(tx);

        scheduler.arm(TimerId::new(1), Duration::from_secs(10));
        assert_eq!(scheduler.armed(), Some(TimerId::new(1)));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(TimerId::new(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::new(tx);

        scheduler.arm(TimerId::new(1), Duration::from_secs(5));
        scheduler.arm(TimerId::new(2), Duration::from_secs(10));
        scheduler.arm(TimerId::new(3), Duration::from_secs(20));
        assert_eq!(scheduler.armed(), Some(TimerId::new(3)));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.recv().await, Some(TimerId::new(3)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::new(tx);

        scheduler.arm(TimerId::new(7), Duration::from_secs(1));
        assert_eq!(scheduler.disarm(), Some(TimerId::new(7)));
        assert_eq!(scheduler.disarm(), None);
        assert!(scheduler.deadline().is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
