//! crates/session_reliability_core/src/ports.rs
//!
//! Defines the service contracts (traits) the reliability layer depends on.
//! These traits form the boundary of the hexagonal architecture: the document
//! store, the configuration store, the course catalog, the conversation
//! provider, local durable storage and the notification sink all live behind them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{
    Course, CourseCompletion, CreateConversationRequest, RawProviderConfig, Session,
    SessionPatch, UsageRecord,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, disk).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// The backing service could not be reached; the call may succeed later.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    /// A stored document did not match its schema.
    #[error("Invalid document: {0}")]
    Invalid(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Persistent Document Store
//=========================================================================================

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> PortResult<()>;

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session>;

    /// Writes only the fields set in `patch`.
    async fn update_session(&self, session_id: Uuid, patch: &SessionPatch) -> PortResult<()>;

    /// Records the latest completion of a course; last write wins.
    async fn upsert_completion(&self, completion: &CourseCompletion) -> PortResult<()>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Returns the record for `(user_id, date)`, creating it at count 0 if absent.
    async fn get_or_create_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> PortResult<UsageRecord>;

    /// Compare-and-swap increment: bumps `conversation_count` by one only if it
    /// still equals `expected`. Returns whether the write happened.
    async fn increment_usage_if(
        &self,
        user_id: &str,
        date: NaiveDate,
        expected: u32,
        now: DateTime<Utc>,
    ) -> PortResult<bool>;
}

//=========================================================================================
// Read-only Collaborators
//=========================================================================================

#[async_trait]
pub trait ProviderConfigSource: Send + Sync {
    /// Fetches the provider settings an administrator stored, if any.
    async fn provider_config(&self) -> PortResult<Option<RawProviderConfig>>;
}

#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn get_course(&self, course_id: &str) -> PortResult<Course>;
}

//=========================================================================================
// Conversation Provider Transport
//=========================================================================================

/// A raw provider answer; status mapping is done by the client, not the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    pub status: u16,
    pub body: String,
}

/// Failures where no HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// `POST /conversations`
    async fn create_conversation(
        &self,
        api_key: &str,
        request: &CreateConversationRequest,
    ) -> Result<ProviderReply, TransportError>;

    /// `POST /conversations/{id}/end`
    async fn end_conversation(
        &self,
        api_key: &str,
        conversation_id: &str,
    ) -> Result<ProviderReply, TransportError>;
}

//=========================================================================================
// Local Durable Storage
//=========================================================================================

/// A small key-value store that survives process restarts.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn read(&self, key: &str) -> PortResult<Option<String>>;
    async fn write(&self, key: &str, value: &str) -> PortResult<()>;
}

//=========================================================================================
// Notification Sink
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// Fire-and-forget user-facing signals. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}
