//! crates/session_reliability_core/src/domain.rs
//!
//! Defines the core data structures owned by the session reliability layer:
//! practice sessions, daily usage records and deferred queue items.
//! Every persisted shape has an explicit schema; optional fields are `Option`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest accepted session time-to-live, in seconds.
pub const MIN_SESSION_TTL_SECS: u32 = 1;
/// Largest accepted session time-to-live, in seconds.
pub const MAX_SESSION_TTL_SECS: u32 = 3600;

//=========================================================================================
// Users and Tiers
//=========================================================================================

/// Subscription tier of a user, which decides the daily conversation quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Premium,
}

impl Tier {
    /// Parses the tier names used by the identity collaborator. Unknown names are anonymous.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Tier::Free,
            "premium" => Tier::Premium,
            _ => Tier::Anonymous,
        }
    }
}

/// An authenticated caller, as handed over by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub tier: Tier,
}

//=========================================================================================
// Sessions
//=========================================================================================

/// Lifecycle status of a practice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Confirmed,
    Started,
    Completed,
    Failed,
    Abandoned,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Abandoned
                | SessionStatus::Expired
        )
    }

    fn rank(self) -> u8 {
        match self {
            SessionStatus::Confirmed => 0,
            SessionStatus::Started => 1,
            _ => 2,
        }
    }

    /// Statuses only move forward: a terminal status never changes, and
    /// a non-terminal one may only advance to a later stage.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Started => "started",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmed" => Some(SessionStatus::Confirmed),
            "started" => Some(SessionStatus::Started),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "abandoned" => Some(SessionStatus::Abandoned),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping attached to a session for later inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Milliseconds between confirmation and the transition into `started`.
    pub confirmation_delay_ms: Option<i64>,
}

/// One time-boxed practice attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub course_id: String,
    pub status: SessionStatus,
    pub ttl_seconds: u32,
    pub confirmed_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub provider_conversation_id: Option<String>,
    pub accuracy_score: Option<f64>,
    pub duration_seconds: Option<u64>,
    pub metadata: SessionMetadata,
}

impl Session {
    /// True when the TTL has run out at `now`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A partial update of a session. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conversation_id: Option<String>,
    pub provider_conversation_id: Option<String>,
    pub accuracy_score: Option<f64>,
    pub duration_seconds: Option<u64>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
    pub confirmation_delay_ms: Option<i64>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Applies the patch to an in-memory copy of a session.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(at) = self.started_at {
            session.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            session.completed_at = Some(at);
        }
        if let Some(id) = &self.conversation_id {
            session.conversation_id = Some(id.clone());
        }
        if let Some(id) = &self.provider_conversation_id {
            session.provider_conversation_id = Some(id.clone());
        }
        if let Some(score) = self.accuracy_score {
            session.accuracy_score = Some(score);
        }
        if let Some(duration) = self.duration_seconds {
            session.duration_seconds = Some(duration);
        }
        if let Some(count) = self.retry_count {
            session.metadata.retry_count = count;
        }
        if let Some(err) = &self.last_error {
            session.metadata.last_error = Some(err.clone());
        }
        if let Some(delay) = self.confirmation_delay_ms {
            session.metadata.confirmation_delay_ms = Some(delay);
        }
    }
}

/// The outcome reported when a practice conversation finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub accuracy_score: Option<f64>,
    pub duration_seconds: Option<u64>,
    pub conversation_id: Option<String>,
}

/// A user's latest completion of one course. One entry per (user, course).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseCompletion {
    pub user_id: String,
    pub course_id: String,
    pub session_id: Uuid,
    pub accuracy_score: f64,
    pub duration_seconds: u64,
    pub completed_at: DateTime<Utc>,
}

//=========================================================================================
// Usage
//=========================================================================================

/// One user's conversation count for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub conversation_count: u32,
    pub last_updated: DateTime<Utc>,
}

//=========================================================================================
// Courses and the Conversation Provider
//=========================================================================================

/// The slice of a course the provider client needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub conversational_context: Option<String>,
}

/// Provider settings as stored by an administrator; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProviderConfig {
    pub replica_id: Option<String>,
    pub persona_id: Option<String>,
    pub api_key: Option<String>,
}

/// Validated provider settings: every field present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub replica_id: String,
    pub persona_id: String,
    pub api_key: String,
}

/// Body of the provider's create-conversation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub replica_id: String,
    pub persona_id: String,
    pub conversational_context: String,
    pub callback_url: String,
}

/// A conversation accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "conversation_id")]
    pub id: String,
    #[serde(rename = "conversation_url")]
    pub url: String,
    pub status: String,
}

//=========================================================================================
// Offline Queue
//=========================================================================================

/// A deferred operation together with everything needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum QueuedOperation {
    #[serde(rename_all = "camelCase")]
    StartSession {
        user_id: String,
        tier: Tier,
        course_id: String,
        ttl_seconds: u32,
    },
    #[serde(rename_all = "camelCase")]
    CreateConversation {
        course_id: String,
        user_id: String,
        session_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    EndConversation { conversation_id: String },
    #[serde(rename_all = "camelCase")]
    UpdateCompletion {
        session_id: Uuid,
        result: CompletionResult,
    },
}

impl QueuedOperation {
    pub fn name(&self) -> &'static str {
        match self {
            QueuedOperation::StartSession { .. } => "startSession",
            QueuedOperation::CreateConversation { .. } => "createConversation",
            QueuedOperation::EndConversation { .. } => "endConversation",
            QueuedOperation::UpdateCompletion { .. } => "updateCompletion",
        }
    }
}

/// One entry of the durable offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    pub operation: QueuedOperation,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_only_move_forward() {
        use SessionStatus::*;
        assert!(Confirmed.can_transition_to(Started));
        assert!(Confirmed.can_transition_to(Expired));
        assert!(Started.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Confirmed));
        assert!(!Started.can_transition_to(Started));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(Completed));
    }

    #[test]
    fn queue_item_uses_tagged_payload_shape() {
        let item = QueueItem {
            id: Uuid::nil(),
            operation: QueuedOperation::EndConversation {
                conversation_id: "c-1".into(),
            },
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            retry_count: 2,
            last_error: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["operation"]["kind"], "endConversation");
        assert_eq!(json["operation"]["payload"]["conversationId"], "c-1");
        assert_eq!(json["retryCount"], 2);
    }

    #[test]
    fn unknown_tier_names_are_anonymous() {
        assert_eq!(Tier::from_name("Premium"), Tier::Premium);
        assert_eq!(Tier::from_name("free"), Tier::Free);
        assert_eq!(Tier::from_name("gold"), Tier::Anonymous);
    }
}
