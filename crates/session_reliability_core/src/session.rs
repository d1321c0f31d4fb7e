//! crates/session_reliability_core/src/session.rs
//!
//! Lifecycle of a practice session record:
//! `confirmed -> started -> completed | failed | abandoned | expired`.
//!
//! Every operation re-reads the record right before writing it. A session whose
//! TTL has run out is moved to `expired` by the first operation that notices.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{
    CompletionResult, CourseCompletion, Session, SessionMetadata, SessionPatch, SessionStatus,
    MAX_SESSION_TTL_SECS, MIN_SESSION_TTL_SECS,
};
use crate::error::{SessionError, SessionResult};
use crate::ports::SessionStore;

/// Checks the caller-supplied arguments of `start`.
pub fn validate_start(user_id: &str, course_id: &str, ttl_seconds: u32) -> SessionResult<()> {
    if user_id.trim().is_empty() {
        return Err(SessionError::Config("A user id is required to start a session".into()));
    }
    if course_id.trim().is_empty() {
        return Err(SessionError::Config("A course id is required to start a session".into()));
    }
    if !(MIN_SESSION_TTL_SECS..=MAX_SESSION_TTL_SECS).contains(&ttl_seconds) {
        return Err(SessionError::Config(format!(
            "Session TTL must be between {MIN_SESSION_TTL_SECS} and {MAX_SESSION_TTL_SECS} seconds, got {ttl_seconds}"
        )));
    }
    Ok(())
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn get(&self, session_id: Uuid) -> SessionResult<Session> {
        Ok(self.store.get_session(session_id).await?)
    }

    /// Persists a new `confirmed` session that expires `ttl_seconds` from now.
    pub async fn start(&self, user_id: &str, course_id: &str, ttl_seconds: u32) -> SessionResult<Uuid> {
        validate_start(user_id, course_id, ttl_seconds)?;

        let now = self.clock.now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            status: SessionStatus::Confirmed,
            ttl_seconds,
            confirmed_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + chrono::Duration::seconds(i64::from(ttl_seconds)),
            conversation_id: None,
            provider_conversation_id: None,
            accuracy_score: None,
            duration_seconds: None,
            metadata: SessionMetadata::default(),
        };
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, user_id, course_id, ttl_seconds, "session confirmed");
        Ok(session.id)
    }

    /// Writes `expired` if the TTL ran out on a live session. Returns whether it did.
    pub async fn expire_if_due(&self, session: &Session) -> SessionResult<bool> {
        if session.status.is_terminal() || !session.is_past_expiry(self.clock.now()) {
            return Ok(false);
        }
        self.store
            .update_session(session.id, &SessionPatch::status(SessionStatus::Expired))
            .await?;
        info!(session_id = %session.id, from = %session.status, "session expired");
        Ok(true)
    }

    /// Applies a partial update after checking expiry and the transition rules.
    pub async fn update(&self, session_id: Uuid, mut patch: SessionPatch) -> SessionResult<()> {
        let session = self.store.get_session(session_id).await?;

        if patch.status != Some(SessionStatus::Expired) && self.expire_if_due(&session).await? {
            return Err(SessionError::Expired { session_id });
        }

        if let Some(next) = patch.status {
            if next != session.status && !session.status.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    from: session.status,
                    to: next,
                });
            }
            if next == SessionStatus::Started && session.status != SessionStatus::Started {
                let now = self.clock.now();
                patch.started_at = Some(now);
                patch.confirmation_delay_ms =
                    Some((now - session.confirmed_at).num_milliseconds());
            }
        }

        self.store.update_session(session_id, &patch).await?;
        Ok(())
    }

    /// Records the outcome and propagates it to the user's course completion.
    pub async fn complete(&self, session_id: Uuid, result: CompletionResult) -> SessionResult<()> {
        let session = self.store.get_session(session_id).await?;

        if session.status == SessionStatus::Completed {
            // Replays converge: the completion record is rewritten from the stored result.
            self.store.upsert_completion(&completion_of(&session)).await?;
            return Ok(());
        }
        if session.status == SessionStatus::Expired || self.expire_if_due(&session).await? {
            return Err(SessionError::Expired { session_id });
        }
        if session.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Completed,
            });
        }

        let now = self.clock.now();
        let score = result.accuracy_score.map(clamp_score);
        let duration = result.duration_seconds.unwrap_or_else(|| {
            let since = session.started_at.unwrap_or(session.confirmed_at);
            (now - since).num_seconds().max(0) as u64
        });

        let patch = SessionPatch {
            status: Some(SessionStatus::Completed),
            completed_at: Some(now),
            accuracy_score: score,
            duration_seconds: Some(duration),
            conversation_id: result.conversation_id.clone(),
            ..Default::default()
        };

        if let Err(err) = self.store.update_session(session_id, &patch).await {
            let err = SessionError::from(err);
            self.mark_failed(session_id, &err).await;
            return Err(err);
        }

        let mut completed = session;
        patch.apply_to(&mut completed);
        self.store.upsert_completion(&completion_of(&completed)).await?;
        info!(%session_id, score = ?score, duration, "session completed");
        Ok(())
    }

    /// Best effort: leaves a failed status and the error on the record for inspection.
    pub async fn mark_failed(&self, session_id: Uuid, err: &SessionError) {
        let patch = SessionPatch {
            status: Some(SessionStatus::Failed),
            last_error: Some(err.to_string()),
            ..Default::default()
        };
        if let Err(write_err) = self.update(session_id, patch).await {
            warn!(%session_id, error = %write_err, "could not mark session as failed");
        }
    }
}

fn completion_of(session: &Session) -> CourseCompletion {
    CourseCompletion {
        user_id: session.user_id.clone(),
        course_id: session.course_id.clone(),
        session_id: session.id,
        accuracy_score: session.accuracy_score.unwrap_or(0.0),
        duration_seconds: session.duration_seconds.unwrap_or(0),
        completed_at: session.completed_at.unwrap_or(session.confirmed_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()));
        let manager = SessionManager::new(store.clone(), clock.clone());
        (store, clock, manager)
    }

    #[tokio::test]
    async fn ttl_bounds_are_enforced() {
        let (store, _clock, manager) = setup();
        for ttl in [0, 3601] {
            let err = manager.start("u-1", "c-1", ttl).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "ttl {ttl}");
        }
        for ttl in [1, 3600] {
            assert!(manager.start("u-1", "c-1", ttl).await.is_ok(), "ttl {ttl}");
        }
        assert_eq!(store.session_count(), 2);
    }

    #[tokio::test]
    async fn blank_ids_fail_fast() {
        let (_store, _clock, manager) = setup();
        assert!(manager.start("", "c-1", 60).await.is_err());
        assert!(manager.start("u-1", "  ", 60).await.is_err());
    }

    #[tokio::test]
    async fn start_records_confirmation_and_expiry() {
        let (_store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        let session = manager.get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Confirmed);
        assert_eq!(session.expires_at, clock.now() + Duration::seconds(600));
    }

    #[tokio::test]
    async fn starting_records_confirmation_delay() {
        let (_store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        clock.advance(Duration::milliseconds(2500));
        manager
            .update(id, SessionPatch::status(SessionStatus::Started))
            .await
            .unwrap();
        let session = manager.get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Started);
        assert_eq!(session.metadata.confirmation_delay_ms, Some(2500));
        assert_eq!(session.started_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn transitions_never_go_backwards() {
        let (_store, _clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        manager
            .update(id, SessionPatch::status(SessionStatus::Started))
            .await
            .unwrap();
        let err = manager
            .update(id, SessionPatch::status(SessionStatus::Confirmed))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));

        manager
            .update(id, SessionPatch::status(SessionStatus::Abandoned))
            .await
            .unwrap();
        assert!(manager
            .update(id, SessionPatch::status(SessionStatus::Started))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn update_after_ttl_forces_expiry() {
        let (_store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 60).await.unwrap();
        clock.advance(Duration::seconds(61));

        let patch = SessionPatch {
            conversation_id: Some("c-9".into()),
            ..Default::default()
        };
        let err = manager.update(id, patch).await.unwrap_err();
        assert!(err.is_expired());
        let session = manager.get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Expired);
        assert_eq!(session.conversation_id, None);
    }

    #[tokio::test]
    async fn terminal_sessions_are_not_force_expired() {
        let (_store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 60).await.unwrap();
        manager
            .update(id, SessionPatch::status(SessionStatus::Abandoned))
            .await
            .unwrap();
        clock.advance(Duration::seconds(120));
        let _ = manager.update(id, SessionPatch::default()).await;
        assert_eq!(manager.get(id).await.unwrap().status, SessionStatus::Abandoned);
    }

    #[tokio::test]
    async fn complete_clamps_score_and_derives_duration() {
        let (store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        manager
            .update(id, SessionPatch::status(SessionStatus::Started))
            .await
            .unwrap();
        clock.advance(Duration::seconds(95));

        manager
            .complete(
                id,
                CompletionResult {
                    accuracy_score: Some(140.0),
                    duration_seconds: None,
                    conversation_id: Some("c-7".into()),
                },
            )
            .await
            .unwrap();

        let session = manager.get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.accuracy_score, Some(100.0));
        assert_eq!(session.duration_seconds, Some(95));

        let completion = store.completion("u-1", "c-1").unwrap();
        assert_eq!(completion.session_id, id);
        assert_eq!(completion.accuracy_score, 100.0);
    }

    #[tokio::test]
    async fn completing_an_expired_session_is_a_timeout() {
        let (store, clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 30).await.unwrap();
        clock.advance(Duration::seconds(31));

        let err = manager.complete(id, CompletionResult::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(manager.get(id).await.unwrap().status, SessionStatus::Expired);
        assert!(store.completion("u-1", "c-1").is_none());
    }

    #[tokio::test]
    async fn completing_twice_is_idempotent() {
        let (store, _clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        let result = CompletionResult {
            accuracy_score: Some(-5.0),
            duration_seconds: Some(40),
            conversation_id: None,
        };
        manager.complete(id, result.clone()).await.unwrap();
        manager.complete(id, result).await.unwrap();
        assert_eq!(store.completion("u-1", "c-1").unwrap().accuracy_score, 0.0);
    }

    #[tokio::test]
    async fn failed_completion_write_marks_session_failed() {
        let (store, _clock, manager) = setup();
        let id = manager.start("u-1", "c-1", 600).await.unwrap();
        store.fail_next_session_updates(1);

        let err = manager.complete(id, CompletionResult::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);

        let session = manager.get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.metadata.last_error.unwrap().contains("injected"));
    }
}
