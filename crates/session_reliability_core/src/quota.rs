//! crates/session_reliability_core/src/quota.rs
//!
//! Daily conversation quota per user. The counter is advanced with a
//! compare-and-swap on the stored count, so concurrent checks for the same
//! user can never push it past the tier limit.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::domain::{Tier, User};
use crate::error::{SessionError, SessionResult};
use crate::ports::{NotificationLevel, Notifier, PortError, UsageStore};

/// How often a lost compare-and-swap is retried before giving up.
const MAX_CAS_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free: u32,
    pub premium: u32,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self { free: 1, premium: 3 }
    }
}

impl TierLimits {
    /// Daily limit for a tier; anonymous users get none.
    pub fn for_tier(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Anonymous => None,
            Tier::Free => Some(self.free),
            Tier::Premium => Some(self.premium),
        }
    }
}

fn limit_message(tier: Tier, limit: u32, limits: &TierLimits) -> String {
    let noun = if limit == 1 { "conversation" } else { "conversations" };
    match tier {
        Tier::Free => format!(
            "Daily limit of {limit} {noun} reached. Upgrade to Premium for up to {} conversations per day.",
            limits.premium
        ),
        _ => format!("Daily limit of {limit} {noun} reached. Please come back tomorrow."),
    }
}

pub struct QuotaEnforcer {
    usage: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    limits: TierLimits,
}

impl QuotaEnforcer {
    pub fn new(usage: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            usage,
            clock,
            notifier,
            limits: TierLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: TierLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Consumes one conversation from today's allowance, or explains why it can't.
    pub async fn can_start_conversation(&self, user: Option<&User>) -> SessionResult<bool> {
        let user = user.ok_or_else(|| {
            SessionError::Config("You must be signed in to start a conversation".to_string())
        })?;
        if user.id.trim().is_empty() {
            return Err(SessionError::Config("You must be signed in to start a conversation".to_string()));
        }
        let limit = self.limits.for_tier(user.tier).ok_or_else(|| {
            SessionError::Config("Conversations are not available for guest accounts".to_string())
        })?;

        let now = self.clock.now();
        let today = now.date_naive();

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let record = self.usage.get_or_create_usage(&user.id, today, now).await?;
            if record.conversation_count >= limit {
                let message = limit_message(user.tier, limit, &self.limits);
                info!(user_id = %user.id, count = record.conversation_count, limit, "daily quota exhausted");
                self.notifier.notify(NotificationLevel::Error, &message);
                return Err(SessionError::Limit(message));
            }

            if self
                .usage
                .increment_usage_if(&user.id, today, record.conversation_count, now)
                .await?
            {
                debug!(
                    user_id = %user.id,
                    count = record.conversation_count + 1,
                    limit,
                    "conversation counted against quota"
                );
                return Ok(true);
            }
            warn!(user_id = %user.id, attempt, "concurrent quota update, re-reading");
        }

        Err(SessionError::Store(PortError::Conflict(format!(
            "usage record for {} kept changing",
            user.id
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::domain::UsageRecord;
    use crate::memory::{MemoryStore, RecordingNotifier};
    use crate::ports::PortResult;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, Arc<RecordingNotifier>, QuotaEnforcer) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()));
        let notifier = Arc::new(RecordingNotifier::default());
        let quota = QuotaEnforcer::new(store.clone(), clock.clone(), notifier.clone());
        (store, clock, notifier, quota)
    }

    fn user(tier: Tier) -> User {
        User {
            id: "u-1".into(),
            tier,
        }
    }

    #[tokio::test]
    async fn free_user_gets_one_conversation_per_day() {
        let (store, clock, notifier, quota) = setup();
        let free = user(Tier::Free);

        assert!(quota.can_start_conversation(Some(&free)).await.unwrap());
        assert_eq!(store.usage_count("u-1", clock.now().date_naive()), Some(1));

        let err = quota.can_start_conversation(Some(&free)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Limit);
        assert!(err.to_string().contains("Daily limit of 1"));
        assert!(err.to_string().contains("Upgrade"));
        assert_eq!(store.usage_count("u-1", clock.now().date_naive()), Some(1));
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn premium_user_gets_three_and_the_fourth_fails() {
        let (_store, _clock, _notifier, quota) = setup();
        let premium = user(Tier::Premium);
        for _ in 0..3 {
            assert!(quota.can_start_conversation(Some(&premium)).await.unwrap());
        }
        let err = quota.can_start_conversation(Some(&premium)).await.unwrap_err();
        assert!(err.to_string().contains("Daily limit of 3"));
    }

    #[tokio::test]
    async fn counter_resets_on_the_next_day() {
        let (store, clock, _notifier, quota) = setup();
        let free = user(Tier::Free);
        quota.can_start_conversation(Some(&free)).await.unwrap();
        clock.advance(Duration::days(1));
        assert!(quota.can_start_conversation(Some(&free)).await.unwrap());
        assert_eq!(store.usage_count("u-1", clock.now().date_naive()), Some(1));
    }

    #[tokio::test]
    async fn guests_and_signed_out_callers_are_rejected() {
        let (store, clock, _notifier, quota) = setup();
        let err = quota.can_start_conversation(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = quota
            .can_start_conversation(Some(&user(Tier::Anonymous)))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.usage_count("u-1", clock.now().date_naive()), None);
    }

    /// Yields between the read and the compare-and-swap so that concurrent
    /// checks interleave there, and counts the swaps that lose.
    struct InterleavingUsage {
        inner: Arc<MemoryStore>,
        lost: AtomicU32,
    }

    #[async_trait]
    impl UsageStore for InterleavingUsage {
        async fn get_or_create_usage(
            &self,
            user_id: &str,
            date: NaiveDate,
            now: DateTime<Utc>,
        ) -> PortResult<UsageRecord> {
            self.inner.get_or_create_usage(user_id, date, now).await
        }

        async fn increment_usage_if(
            &self,
            user_id: &str,
            date: NaiveDate,
            expected: u32,
            now: DateTime<Utc>,
        ) -> PortResult<bool> {
            tokio::task::yield_now().await;
            let swapped = self.inner.increment_usage_if(user_id, date, expected, now).await?;
            if !swapped {
                self.lost.fetch_add(1, Ordering::SeqCst);
            }
            Ok(swapped)
        }
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_the_limit() {
        let store = Arc::new(MemoryStore::new());
        let usage = Arc::new(InterleavingUsage {
            inner: store.clone(),
            lost: AtomicU32::new(0),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()));
        let quota = QuotaEnforcer::new(usage.clone(), clock.clone(), Arc::new(RecordingNotifier::default()));
        let premium = user(Tier::Premium);

        let results = futures::future::join_all(
            (0..10).map(|_| quota.can_start_conversation(Some(&premium))),
        )
        .await;

        assert!(usage.lost.load(Ordering::SeqCst) >= 1);
        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 3);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(err.kind(), ErrorKind::Limit);
        }
        assert_eq!(store.usage_count("u-1", clock.now().date_naive()), Some(3));
    }
}
