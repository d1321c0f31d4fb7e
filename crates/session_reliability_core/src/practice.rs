//! crates/session_reliability_core/src/practice.rs
//!
//! Runs a practice session end to end: quota gate, session record, provider
//! conversation and completion, handing anything that cannot finish right now
//! to the offline queue. It also replays queued operations for the queue.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectivity::ConnectivityMonitor;
use crate::domain::{
    CompletionResult, Conversation, QueuedOperation, SessionPatch, SessionStatus, Tier, User,
};
use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::ports::{NotificationLevel, Notifier};
use crate::provider::ConversationClient;
use crate::queue::{OfflineQueue, QueueDispatcher};
use crate::quota::QuotaEnforcer;
use crate::session::{validate_start, SessionManager};

/// Outcome of asking for a new practice session.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The provider accepted the conversation; the session is `started`.
    Started {
        session_id: Uuid,
        conversation: Conversation,
    },
    /// Work was queued. `session_id` is known once the session record exists.
    Deferred { session_id: Option<Uuid> },
}

/// Outcome of finishing a practice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    Deferred,
}

pub struct PracticeSessions {
    quota: QuotaEnforcer,
    sessions: SessionManager,
    provider: ConversationClient,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<dyn Notifier>,
}

impl PracticeSessions {
    pub fn new(
        quota: QuotaEnforcer,
        sessions: SessionManager,
        provider: ConversationClient,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            quota,
            sessions,
            provider,
            queue,
            connectivity,
            notifier,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    fn report(&self, err: &SessionError) {
        match err.root().kind() {
            ErrorKind::Config => self.notifier.notify(
                NotificationLevel::Error,
                &format!("{}. Please contact an administrator.", err.root()),
            ),
            ErrorKind::Timeout if err.is_expired() => self.notifier.notify(
                NotificationLevel::Warning,
                "This practice session has expired. Please start a new one.",
            ),
            _ => {}
        }
    }

    /// Gates, records and opens a new practice session.
    pub async fn start_practice_session(
        &self,
        user: Option<&User>,
        course_id: &str,
        ttl_seconds: u32,
    ) -> SessionResult<StartOutcome> {
        if let Some(user) = user {
            validate_start(&user.id, course_id, ttl_seconds)?;
        }

        if !self.connectivity.is_online() {
            if let Some(user) = user.filter(|u| u.tier != Tier::Anonymous) {
                self.queue
                    .enqueue(QueuedOperation::StartSession {
                        user_id: user.id.clone(),
                        tier: user.tier,
                        course_id: course_id.to_string(),
                        ttl_seconds,
                    })
                    .await?;
                self.notifier.notify(
                    NotificationLevel::Info,
                    "You are offline. Your practice session will start once you reconnect.",
                );
                return Ok(StartOutcome::Deferred { session_id: None });
            }
        }

        self.quota.can_start_conversation(user).await?;
        let user_id = user.map(|u| u.id.as_str()).unwrap_or_default();
        let session_id = self.sessions.start(user_id, course_id, ttl_seconds).await?;

        match self.open_conversation(course_id, user_id, session_id).await {
            Ok(Some(conversation)) => Ok(StartOutcome::Started {
                session_id,
                conversation,
            }),
            Ok(None) => Ok(StartOutcome::Deferred {
                session_id: Some(session_id),
            }),
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Creates the provider conversation (queueing it if need be) and marks the session started.
    async fn open_conversation(
        &self,
        course_id: &str,
        user_id: &str,
        session_id: Uuid,
    ) -> SessionResult<Option<Conversation>> {
        let created = self
            .queue
            .execute_with_offline_fallback(
                || self.provider.create_conversation(course_id, user_id, session_id),
                QueuedOperation::CreateConversation {
                    course_id: course_id.to_string(),
                    user_id: user_id.to_string(),
                    session_id,
                },
            )
            .await;

        match created {
            Ok(Some(conversation)) => {
                self.attach_conversation(session_id, &conversation).await?;
                Ok(Some(conversation))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.sessions.mark_failed(session_id, &err).await;
                Err(err)
            }
        }
    }

    async fn attach_conversation(&self, session_id: Uuid, conversation: &Conversation) -> SessionResult<()> {
        let patch = SessionPatch {
            status: Some(SessionStatus::Started),
            conversation_id: Some(conversation.id.clone()),
            provider_conversation_id: Some(conversation.id.clone()),
            ..Default::default()
        };
        if let Err(err) = self.sessions.update(session_id, patch).await {
            // A conversation the session does not point at would never be ended.
            if let Err(end_err) = self.provider.end_conversation(&conversation.id).await {
                warn!(%session_id, conversation_id = %conversation.id, error = %end_err, "could not end unattached conversation");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Ends the conversation, if any, and records the outcome.
    pub async fn end_practice_session(
        &self,
        session_id: Uuid,
        conversation_id: Option<&str>,
        result: CompletionResult,
    ) -> SessionResult<CompletionOutcome> {
        let mut deferred = false;

        if let Some(conversation_id) = conversation_id {
            let ended = self
                .queue
                .execute_with_offline_fallback(
                    || self.provider.end_conversation(conversation_id),
                    QueuedOperation::EndConversation {
                        conversation_id: conversation_id.to_string(),
                    },
                )
                .await;
            match ended {
                Ok(Some(())) => {}
                Ok(None) => deferred = true,
                Err(err) => {
                    self.report(&err);
                    return Err(err);
                }
            }
        }

        let completed = self
            .queue
            .execute_with_offline_fallback(
                || self.sessions.complete(session_id, result.clone()),
                QueuedOperation::UpdateCompletion {
                    session_id,
                    result: result.clone(),
                },
            )
            .await;

        match completed {
            Ok(Some(())) if !deferred => Ok(CompletionOutcome::Completed),
            Ok(_) => Ok(CompletionOutcome::Deferred),
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl QueueDispatcher for PracticeSessions {
    async fn dispatch(&self, operation: &QueuedOperation) -> SessionResult<()> {
        match operation {
            QueuedOperation::StartSession {
                user_id,
                tier,
                course_id,
                ttl_seconds,
            } => {
                let user = User {
                    id: user_id.clone(),
                    tier: *tier,
                };
                validate_start(user_id, course_id, *ttl_seconds)?;
                // The record is written before the quota is charged: a replay that
                // fails here is retried without having spent anything.
                let session_id = self.sessions.start(user_id, course_id, *ttl_seconds).await?;
                if let Err(err) = self.quota.can_start_conversation(Some(&user)).await {
                    self.sessions.mark_failed(session_id, &err).await;
                    return Err(err);
                }
                info!(%session_id, "queued session start replayed");
                // Nothing below returns an error, so the charge is never repeated.
                if let Err(err) = self.open_conversation(course_id, user_id, session_id).await {
                    warn!(%session_id, error = %err, "conversation for replayed session failed");
                    self.report(&err);
                }
                Ok(())
            }
            QueuedOperation::CreateConversation {
                course_id,
                user_id,
                session_id,
            } => {
                let session = self.sessions.get(*session_id).await?;
                if session.status.is_terminal() {
                    info!(%session_id, status = %session.status, "session already finished, skipping queued conversation");
                    return Ok(());
                }
                if self.sessions.expire_if_due(&session).await? {
                    self.report(&SessionError::Expired {
                        session_id: *session_id,
                    });
                    return Ok(());
                }
                let conversation = self
                    .provider
                    .create_conversation(course_id, user_id, *session_id)
                    .await?;
                match self.attach_conversation(*session_id, &conversation).await {
                    Err(err) if err.is_expired() => {
                        self.report(&err);
                        Ok(())
                    }
                    other => other,
                }
            }
            QueuedOperation::EndConversation { conversation_id } => {
                self.provider.end_conversation(conversation_id).await
            }
            QueuedOperation::UpdateCompletion { session_id, result } => {
                match self.sessions.complete(*session_id, result.clone()).await {
                    Err(err) if err.is_expired() => {
                        warn!(%session_id, "session expired before its completion could be saved");
                        self.report(&err);
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }
}
