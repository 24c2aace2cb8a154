//! Wake-up alarm and adaptive polling interval.
//!
//! The polling clock records when adaptive polling began. The next wake-up is
//! chosen from the time elapsed since then:
//!
//! | elapsed      | interval |
//! |--------------|----------|
//! | < 10 min     | 1 min    |
//! | < 30 min     | 10 min   |
//! | < 60 min     | 30 min   |
//! | otherwise    | 60 min   |
//!
//! The clock is deleted once nothing is left to poll or retry, so the next
//! job starts again at the fast interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, info};

use crate::store::{DurableStore, StoreError, get_json, put_json};

use super::keys;

const MINUTE: Duration = Duration::from_secs(60);

/// Interval used for the first wake-up and during the first ten minutes.
pub const FAST_INTERVAL: Duration = MINUTE;

/// Polling interval for a given time since polling began.
pub fn interval_for_elapsed(elapsed: Duration) -> Duration {
    if elapsed < MINUTE * 10 {
        FAST_INTERVAL
    } else if elapsed < MINUTE * 30 {
        MINUTE * 10
    } else if elapsed < MINUTE * 60 {
        MINUTE * 30
    } else {
        MINUTE * 60
    }
}

/// Persisted adaptive-polling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingClock {
    pub started_at: DateTime<Utc>,
    pub interval: Duration,
}

/// Owner of the single wake-up alarm and the polling clock.
///
/// Every write to the alarm slot also wakes the executor so it can re-read the
/// scheduled time.
pub struct AlarmScheduler {
    store: Arc<dyn DurableStore>,
    changed: Notify,
}

impl AlarmScheduler {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            changed: Notify::new(),
        }
    }

    pub async fn scheduled_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store.get_alarm().await
    }

    /// Resolves after the next change to the alarm slot (or immediately if a
    /// change happened since the last wait).
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub async fn clock(&self) -> Result<Option<PollingClock>, StoreError> {
        let store = self.store.as_ref();
        let Some(started_at) = get_json::<DateTime<Utc>>(store, keys::POLLING_STARTED_AT).await?
        else {
            return Ok(None);
        };
        let interval = get_json::<u64>(store, keys::POLLING_INTERVAL_MS)
            .await?
            .map(Duration::from_millis)
            .unwrap_or(FAST_INTERVAL);
        Ok(Some(PollingClock {
            started_at,
            interval,
        }))
    }

    /// Arm a fast wake-up unless an alarm is already scheduled.
    ///
    /// Returns the new alarm time, or `None` when an alarm already existed.
    pub async fn ensure_armed(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if let Some(existing) = self.store.get_alarm().await? {
            debug!(alarm_at = %existing, "alarm already scheduled");
            return Ok(None);
        }

        self.start_clock_if_absent(now).await?;
        let at = now + to_chrono(FAST_INTERVAL);
        self.set(at).await?;
        info!(alarm_at = %at, "polling alarm armed");
        Ok(Some(at))
    }

    /// Schedule the next wake-up according to the polling clock.
    pub async fn rearm(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        let clock = self.start_clock_if_absent(now).await?;
        let elapsed = (now - clock.started_at).to_std().unwrap_or(Duration::ZERO);
        let interval = interval_for_elapsed(elapsed);

        if interval != clock.interval {
            info!(
                previous_secs = clock.interval.as_secs(),
                interval_secs = interval.as_secs(),
                "polling interval widened"
            );
        }
        put_json(self.store.as_ref(), keys::POLLING_INTERVAL_MS, &duration_ms(interval)).await?;

        let at = now + to_chrono(interval);
        self.set(at).await?;
        debug!(alarm_at = %at, interval_secs = interval.as_secs(), "alarm re-armed");
        Ok(at)
    }

    /// Forget a fired alarm before its handler runs.
    pub async fn clear_fired(&self) -> Result<(), StoreError> {
        self.store.delete_alarm().await
    }

    /// Stop polling: delete the clock and any scheduled alarm.
    pub async fn teardown(&self) -> Result<(), StoreError> {
        self.store.delete(keys::POLLING_STARTED_AT).await?;
        self.store.delete(keys::POLLING_INTERVAL_MS).await?;
        self.store.delete_alarm().await?;
        self.changed.notify_one();
        info!("nothing left to poll; polling clock reset");
        Ok(())
    }

    async fn start_clock_if_absent(&self, now: DateTime<Utc>) -> Result<PollingClock, StoreError> {
        if let Some(clock) = self.clock().await? {
            return Ok(clock);
        }
        let store = self.store.as_ref();
        put_json(store, keys::POLLING_STARTED_AT, &now).await?;
        put_json(store, keys::POLLING_INTERVAL_MS, &duration_ms(FAST_INTERVAL)).await?;
        Ok(PollingClock {
            started_at: now,
            interval: FAST_INTERVAL,
        })
    }

    async fn set(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.set_alarm(at).await?;
        self.changed.notify_one();
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDurableStore;
    use proptest::prelude::*;

    fn scheduler() -> (Arc<InMemoryDurableStore>, AlarmScheduler) {
        let store = Arc::new(InMemoryDurableStore::new());
        let scheduler = AlarmScheduler::new(store.clone());
        (store, scheduler)
    }

    #[test]
    fn thresholds() {
        assert_eq!(interval_for_elapsed(Duration::ZERO), MINUTE);
        assert_eq!(interval_for_elapsed(MINUTE * 9), MINUTE);
        assert_eq!(interval_for_elapsed(MINUTE * 10), MINUTE * 10);
        assert_eq!(interval_for_elapsed(MINUTE * 29), MINUTE * 10);
        assert_eq!(interval_for_elapsed(MINUTE * 30), MINUTE * 30);
        assert_eq!(interval_for_elapsed(MINUTE * 59), MINUTE * 30);
        assert_eq!(interval_for_elapsed(MINUTE * 60), MINUTE * 60);
        assert_eq!(interval_for_elapsed(MINUTE * 600), MINUTE * 60);
    }

    proptest! {
        #[test]
        fn interval_never_narrows(a in 0u64..20_000, b in 0u64..20_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                interval_for_elapsed(Duration::from_secs(lo))
                    <= interval_for_elapsed(Duration::from_secs(hi))
            );
        }
    }

    #[tokio::test]
    async fn ensure_armed_is_idempotent() {
        let (store, scheduler) = scheduler();
        let now = Utc::now();

        let first = scheduler.ensure_armed(now).await.unwrap();
        assert_eq!(first, Some(now + chrono::Duration::minutes(1)));

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(scheduler.ensure_armed(later).await.unwrap(), None);
        assert_eq!(store.get_alarm().await.unwrap(), first);
    }

    #[tokio::test]
    async fn rearm_widens_with_elapsed_time() {
        let (store, scheduler) = scheduler();
        let start = Utc::now();
        scheduler.ensure_armed(start).await.unwrap();

        let now = start + chrono::Duration::minutes(15);
        let at = scheduler.rearm(now).await.unwrap();
        assert_eq!(at, now + chrono::Duration::minutes(10));
        assert_eq!(store.get_alarm().await.unwrap(), Some(at));

        let clock = scheduler.clock().await.unwrap().unwrap();
        assert_eq!(clock.started_at, start);
        assert_eq!(clock.interval, MINUTE * 10);

        let much_later = start + chrono::Duration::hours(3);
        let at = scheduler.rearm(much_later).await.unwrap();
        assert_eq!(at, much_later + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn teardown_restarts_at_fast_interval() {
        let (store, scheduler) = scheduler();
        let start = Utc::now();
        scheduler.ensure_armed(start).await.unwrap();
        scheduler
            .rearm(start + chrono::Duration::minutes(45))
            .await
            .unwrap();

        scheduler.teardown().await.unwrap();
        assert!(scheduler.clock().await.unwrap().is_none());
        assert!(store.get_alarm().await.unwrap().is_none());

        let restart = start + chrono::Duration::hours(2);
        let at = scheduler.rearm(restart).await.unwrap();
        assert_eq!(at, restart + chrono::Duration::minutes(1));
    }
}
