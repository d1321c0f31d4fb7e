//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! store ports from the `core` crate. It handles all interactions with the
//! PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use session_reliability_core::domain::{
    Course, CourseCompletion, RawProviderConfig, Session, SessionMetadata, SessionPatch,
    SessionStatus, UsageRecord,
};
use session_reliability_core::ports::{
    CourseCatalog, PortError, PortResult, ProviderConfigSource, SessionStore, UsageStore,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter implementing the session, usage, settings and catalog ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Connection-level failures are transient; everything else is not.
fn map_db_err(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound(e.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PortError::Unavailable(e.to_string()),
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn to_i64(value: u64, field: &str) -> PortResult<i64> {
    i64::try_from(value).map_err(|_| PortError::Invalid(format!("{field} {value} is out of range")))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    user_id: String,
    course_id: String,
    status: String,
    ttl_seconds: i32,
    confirmed_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    conversation_id: Option<String>,
    provider_conversation_id: Option<String>,
    accuracy_score: Option<f64>,
    duration_seconds: Option<i64>,
    retry_count: i32,
    last_error: Option<String>,
    confirmation_delay_ms: Option<i64>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<Session> {
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            PortError::Invalid(format!("Session {} has unknown status '{}'", self.id, self.status))
        })?;
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            course_id: self.course_id,
            status,
            ttl_seconds: self.ttl_seconds.max(0) as u32,
            confirmed_at: self.confirmed_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            conversation_id: self.conversation_id,
            provider_conversation_id: self.provider_conversation_id,
            accuracy_score: self.accuracy_score,
            duration_seconds: self.duration_seconds.map(|d| d.max(0) as u64),
            metadata: SessionMetadata {
                retry_count: self.retry_count.max(0) as u32,
                last_error: self.last_error,
                confirmation_delay_ms: self.confirmation_delay_ms,
            },
        })
    }
}

#[derive(FromRow)]
struct UsageRow {
    user_id: String,
    date: NaiveDate,
    conversation_count: i32,
    last_updated: DateTime<Utc>,
}
impl UsageRow {
    fn to_domain(self) -> UsageRecord {
        UsageRecord {
            user_id: self.user_id,
            date: self.date,
            conversation_count: self.conversation_count.max(0) as u32,
            last_updated: self.last_updated,
        }
    }
}

#[derive(FromRow)]
struct ProviderSettingsRecord {
    replica_id: Option<String>,
    persona_id: Option<String>,
    api_key: Option<String>,
}

#[derive(FromRow)]
struct CourseRecord {
    id: String,
    title: String,
    conversational_context: Option<String>,
}
impl CourseRecord {
    fn to_domain(self) -> Course {
        Course {
            id: self.id,
            title: self.title,
            conversational_context: self.conversational_context,
        }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, course_id, status, ttl_seconds, confirmed_at, started_at, \
     completed_at, expires_at, conversation_id, provider_conversation_id, accuracy_score, \
     duration_seconds, retry_count, last_error, confirmation_delay_ms";

//=========================================================================================
// `SessionStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, course_id, status, ttl_seconds, confirmed_at, \
             expires_at, retry_count) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(session.id)
        .bind(&session.user_id)
        .bind(&session.course_id)
        .bind(session.status.as_str())
        .bind(session.ttl_seconds as i32)
        .bind(session.confirmed_at)
        .bind(session.expires_at)
        .bind(session.metadata.retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Session {} not found", session_id)),
            other => map_db_err(other),
        })?;
        record.to_domain()
    }

    async fn update_session(&self, session_id: Uuid, patch: &SessionPatch) -> PortResult<()> {
        let duration = patch
            .duration_seconds
            .map(|d| to_i64(d, "duration_seconds"))
            .transpose()?;
        let result = sqlx::query(
            "UPDATE sessions SET \
                status = COALESCE($2, status), \
                started_at = COALESCE($3, started_at), \
                completed_at = COALESCE($4, completed_at), \
                conversation_id = COALESCE($5, conversation_id), \
                provider_conversation_id = COALESCE($6, provider_conversation_id), \
                accuracy_score = COALESCE($7, accuracy_score), \
                duration_seconds = COALESCE($8, duration_seconds), \
                retry_count = COALESCE($9, retry_count), \
                last_error = COALESCE($10, last_error), \
                confirmation_delay_ms = COALESCE($11, confirmation_delay_ms) \
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(patch.conversation_id.as_deref())
        .bind(patch.provider_conversation_id.as_deref())
        .bind(patch.accuracy_score)
        .bind(duration)
        .bind(patch.retry_count.map(|c| c as i32))
        .bind(patch.last_error.as_deref())
        .bind(patch.confirmation_delay_ms)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Session {} not found", session_id)));
        }
        Ok(())
    }

    async fn upsert_completion(&self, completion: &CourseCompletion) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO course_completions \
                (user_id, course_id, session_id, accuracy_score, duration_seconds, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id, course_id) DO UPDATE SET \
                session_id = EXCLUDED.session_id, \
                accuracy_score = EXCLUDED.accuracy_score, \
                duration_seconds = EXCLUDED.duration_seconds, \
                completed_at = EXCLUDED.completed_at",
        )
        .bind(&completion.user_id)
        .bind(&completion.course_id)
        .bind(completion.session_id)
        .bind(completion.accuracy_score)
        .bind(to_i64(completion.duration_seconds, "duration_seconds")?)
        .bind(completion.completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }
}

//=========================================================================================
// `UsageStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl UsageStore for PgStore {
    async fn get_or_create_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> PortResult<UsageRecord> {
        sqlx::query(
            "INSERT INTO usage_records (user_id, date, conversation_count, last_updated) \
             VALUES ($1, $2, 0, $3) ON CONFLICT (user_id, date) DO NOTHING",
        )
        .bind(user_id)
        .bind(date)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        let row = sqlx::query_as::<_, UsageRow>(
            "SELECT user_id, date, conversation_count, last_updated FROM usage_records \
             WHERE user_id = $1 AND date = $2",
        )
        .bind(user_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(row.to_domain())
    }

    async fn increment_usage_if(
        &self,
        user_id: &str,
        date: NaiveDate,
        expected: u32,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE usage_records SET conversation_count = conversation_count + 1, last_updated = $4 \
             WHERE user_id = $1 AND date = $2 AND conversation_count = $3",
        )
        .bind(user_id)
        .bind(date)
        .bind(expected as i32)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

//=========================================================================================
// Read-only Collaborators
//=========================================================================================

#[async_trait]
impl ProviderConfigSource for PgStore {
    async fn provider_config(&self) -> PortResult<Option<RawProviderConfig>> {
        let record = sqlx::query_as::<_, ProviderSettingsRecord>(
            "SELECT replica_id, persona_id, api_key FROM provider_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(record.map(|r| RawProviderConfig {
            replica_id: r.replica_id,
            persona_id: r.persona_id,
            api_key: r.api_key,
        }))
    }
}

#[async_trait]
impl CourseCatalog for PgStore {
    async fn get_course(&self, course_id: &str) -> PortResult<Course> {
        let record = sqlx::query_as::<_, CourseRecord>(
            "SELECT id, title, conversational_context FROM courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Course {} not found", course_id)),
            other => map_db_err(other),
        })?;
        Ok(record.to_domain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: Uuid::new_v4(),
            user_id: "u-1".into(),
            course_id: "c-1".into(),
            status: status.into(),
            ttl_seconds: 600,
            confirmed_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now,
            conversation_id: None,
            provider_conversation_id: None,
            accuracy_score: Some(91.5),
            duration_seconds: Some(300),
            retry_count: 2,
            last_error: Some("timeout".into()),
            confirmation_delay_ms: Some(1200),
        }
    }

    #[test]
    fn session_rows_map_onto_the_domain() {
        let session = record("started").to_domain().unwrap();
        assert_eq!(session.status, SessionStatus::Started);
        assert_eq!(session.duration_seconds, Some(300));
        assert_eq!(session.metadata.retry_count, 2);
        assert_eq!(session.metadata.confirmation_delay_ms, Some(1200));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = record("paused").to_domain().unwrap_err();
        assert!(matches!(err, PortError::Invalid(_)));
    }

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(matches!(map_db_err(sqlx::Error::PoolTimedOut), PortError::Unavailable(_)));
        assert!(matches!(map_db_err(sqlx::Error::RowNotFound), PortError::NotFound(_)));
    }
}
