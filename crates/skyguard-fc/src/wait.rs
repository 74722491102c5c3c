use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::signals::{Interruption, SignalWatch};

#[derive(Debug, Clone, PartialEq)]
pub enum WaitError {
    TimedOut { after: Duration },
    Interrupted(Interruption),
}

/// Poll `cond` every `interval` until it holds or `timeout` elapses. The
/// condition is checked once before the first sleep and once more at the
/// deadline.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut cond: F) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut { after: timeout });
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Like [`wait_for`], but gives up as soon as an emergency is raised after
/// `watch` was taken.
pub async fn wait_for_unless_emergency<F>(
    timeout: Duration,
    interval: Duration,
    watch: &SignalWatch,
    mut cond: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(cause) = watch.emergency() {
            return Err(WaitError::Interrupted(Interruption::Emergency(cause)));
        }
        if cond() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut { after: timeout });
        }
        sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::signals::{EmergencyCause, FlightSignals};

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_condition_holds() {
        let polls = AtomicU32::new(0);
        let started = Instant::now();
        let res = wait_for(Duration::from_secs(10), Duration::from_millis(500), || {
            polls.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert_eq!(res, Ok(()));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500) && waited < Duration::from_millis(1550), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let started = Instant::now();
        let res = wait_for(Duration::from_secs(2), Duration::from_millis(300), || false).await;
        assert_eq!(res, Err(WaitError::TimedOut { after: Duration::from_secs(2) }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2050), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_breaks_the_wait() {
        let signals = FlightSignals::new();
        let watch = signals.watch();
        let raiser = signals.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            raiser.raise_emergency(EmergencyCause::ConnectionLoss);
        });
        let res = wait_for_unless_emergency(Duration::from_secs(30), Duration::from_millis(500), &watch, || false).await;
        assert_eq!(res, Err(WaitError::Interrupted(Interruption::Emergency(EmergencyCause::ConnectionLoss))));
    }
}
