//! crates/session_reliability_core/src/memory.rs
//!
//! In-memory implementations of the ports. The service falls back to these when no
//! database is configured. Failure injection, the scripted provider and the recording
//! notifier exist only for tests (`cfg(test)` or the `test-util` feature).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{Course, CourseCompletion, RawProviderConfig, Session, SessionPatch, UsageRecord};
use crate::ports::{
    CourseCatalog, LocalStorage, PortError, PortResult, ProviderConfigSource, SessionStore,
    UsageStore,
};

#[cfg(any(test, feature = "test-util"))]
pub use doubles::{RecordingNotifier, ScriptedProvider};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//=========================================================================================
// Document Store
//=========================================================================================

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
    usage: Mutex<HashMap<(String, NaiveDate), UsageRecord>>,
    completions: Mutex<HashMap<(String, String), CourseCompletion>>,
    #[cfg(any(test, feature = "test-util"))]
    failing_session_inserts: AtomicU32,
    #[cfg(any(test, feature = "test-util"))]
    failing_session_updates: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage_count(&self, user_id: &str, date: NaiveDate) -> Option<u32> {
        lock(&self.usage)
            .get(&(user_id.to_string(), date))
            .map(|r| r.conversation_count)
    }

    pub fn completion(&self, user_id: &str, course_id: &str) -> Option<CourseCompletion> {
        lock(&self.completions)
            .get(&(user_id.to_string(), course_id.to_string()))
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

}

#[cfg(any(test, feature = "test-util"))]
impl MemoryStore {
    /// Makes the next `count` session inserts fail as if the store were unreachable.
    pub fn fail_next_session_inserts(&self, count: u32) {
        self.failing_session_inserts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` session updates fail as if the store were unreachable.
    pub fn fail_next_session_updates(&self, count: u32) {
        self.failing_session_updates.store(count, Ordering::SeqCst);
    }

    fn injected_insert_failure(&self) -> PortResult<()> {
        take_one(&self.failing_session_inserts, "insert")
    }

    fn injected_update_failure(&self) -> PortResult<()> {
        take_one(&self.failing_session_updates, "update")
    }
}

#[cfg(any(test, feature = "test-util"))]
fn take_one(counter: &AtomicU32, what: &str) -> PortResult<()> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(PortError::Unavailable(format!("injected session {what} failure"))),
        Err(_) => Ok(()),
    }
}

#[cfg(not(any(test, feature = "test-util")))]
impl MemoryStore {
    fn injected_insert_failure(&self) -> PortResult<()> {
        Ok(())
    }

    fn injected_update_failure(&self) -> PortResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> PortResult<()> {
        self.injected_insert_failure()?;
        lock(&self.sessions).insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        lock(&self.sessions)
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Session {session_id} not found")))
    }

    async fn update_session(&self, session_id: Uuid, patch: &SessionPatch) -> PortResult<()> {
        self.injected_update_failure()?;
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {session_id} not found")))?;
        patch.apply_to(session);
        Ok(())
    }

    async fn upsert_completion(&self, completion: &CourseCompletion) -> PortResult<()> {
        lock(&self.completions).insert(
            (completion.user_id.clone(), completion.course_id.clone()),
            completion.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_or_create_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> PortResult<UsageRecord> {
        let record = lock(&self.usage)
            .entry((user_id.to_string(), date))
            .or_insert_with(|| UsageRecord {
                user_id: user_id.to_string(),
                date,
                conversation_count: 0,
                last_updated: now,
            })
            .clone();
        Ok(record)
    }

    async fn increment_usage_if(
        &self,
        user_id: &str,
        date: NaiveDate,
        expected: u32,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut usage = lock(&self.usage);
        match usage.get_mut(&(user_id.to_string(), date)) {
            Some(record) if record.conversation_count == expected => {
                record.conversation_count += 1;
                record.last_updated = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!(
                "Usage record for {user_id} on {date} not found"
            ))),
        }
    }
}

//=========================================================================================
// Read-only Collaborators
//=========================================================================================

#[derive(Default)]
pub struct MemoryCatalog {
    courses: Mutex<HashMap<String, Course>>,
}

impl MemoryCatalog {
    pub fn insert(&self, course: Course) {
        lock(&self.courses).insert(course.id.clone(), course);
    }
}

#[async_trait]
impl CourseCatalog for MemoryCatalog {
    async fn get_course(&self, course_id: &str) -> PortResult<Course> {
        lock(&self.courses)
            .get(course_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Course {course_id} not found")))
    }
}

#[derive(Default)]
pub struct MemoryConfigSource {
    config: Mutex<Option<RawProviderConfig>>,
}

impl MemoryConfigSource {
    pub fn new(config: Option<RawProviderConfig>) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn set(&self, config: Option<RawProviderConfig>) {
        *lock(&self.config) = config;
    }
}

#[async_trait]
impl ProviderConfigSource for MemoryConfigSource {
    async fn provider_config(&self) -> PortResult<Option<RawProviderConfig>> {
        Ok(lock(&self.config).clone())
    }
}

//=========================================================================================
// Local Storage
//=========================================================================================

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn read(&self, key: &str) -> PortResult<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> PortResult<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
mod doubles {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::lock;
    use crate::domain::CreateConversationRequest;
    use crate::ports::{NotificationLevel, Notifier, ProviderApi, ProviderReply, TransportError};

    //=========================================================================================
    // Conversation Provider
    //=========================================================================================

    /// Answers provider calls from a script, oldest reply first; the last reply repeats.
    #[derive(Default)]
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<ProviderReply, TransportError>>>,
        hang: AtomicBool,
        calls: AtomicU32,
        last_request: Mutex<Option<CreateConversationRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<Result<ProviderReply, TransportError>>) -> Self {
            let provider = Self::default();
            provider.set_replies(replies);
            provider
        }

        /// A provider that never answers.
        pub fn hanging() -> Self {
            let provider = Self::default();
            provider.hang.store(true, Ordering::SeqCst);
            provider
        }

        pub fn reply(status: u16, body: &str) -> Result<ProviderReply, TransportError> {
            Ok(ProviderReply {
                status,
                body: body.to_string(),
            })
        }

        pub fn set_replies(&self, replies: Vec<Result<ProviderReply, TransportError>>) {
            *lock(&self.replies) = replies.into();
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<CreateConversationRequest> {
            lock(&self.last_request).clone()
        }

        async fn next(&self) -> Result<ProviderReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let mut replies = lock(&self.replies);
            if replies.len() > 1 {
                replies.pop_front().unwrap_or(Err(TransportError::Connect("script exhausted".into())))
            } else {
                replies
                    .front()
                    .cloned()
                    .unwrap_or(Err(TransportError::Connect("script exhausted".into())))
            }
        }
    }

    #[async_trait]
    impl ProviderApi for ScriptedProvider {
        async fn create_conversation(
            &self,
            _api_key: &str,
            request: &CreateConversationRequest,
        ) -> Result<ProviderReply, TransportError> {
            *lock(&self.last_request) = Some(request.clone());
            self.next().await
        }

        async fn end_conversation(
            &self,
            _api_key: &str,
            _conversation_id: &str,
        ) -> Result<ProviderReply, TransportError> {
            self.next().await
        }
    }

    //=========================================================================================
    // Notifications
    //=========================================================================================

    /// Keeps every notification so tests can assert on what the user would have seen.
    #[derive(Default)]
    pub struct RecordingNotifier {
        seen: Mutex<Vec<(NotificationLevel, String)>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<(NotificationLevel, String)> {
            lock(&self.seen).clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, level: NotificationLevel, message: &str) {
            lock(&self.seen).push((level, message.to_string()));
        }
    }
}
