//! crates/session_reliability_core/src/provider.rs
//!
//! The conversation provider client. It validates provider settings, builds the
//! conversational context and webhook callback URL, applies per-call deadlines and
//! maps every raw failure into the `SessionError` taxonomy.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::domain::{Conversation, Course, CreateConversationRequest, ProviderConfig, RawProviderConfig};
use crate::error::{SessionError, SessionResult};
use crate::ports::{
    CourseCatalog, PortError, ProviderApi, ProviderConfigSource, ProviderReply, TransportError,
};

/// Longest conversational context sent to the provider, in characters.
pub const MAX_CONTEXT_CHARS: usize = 1000;

const CALLBACK_SUFFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    pub create: Duration,
    pub end: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(30),
            end: Duration::from_secs(15),
        }
    }
}

//=========================================================================================
// Pure Helpers
//=========================================================================================

/// Checks that every setting is present and non-empty.
pub fn validate_config(raw: Option<RawProviderConfig>) -> SessionResult<ProviderConfig> {
    let raw = raw.ok_or_else(|| {
        SessionError::Config("Conversation provider is not configured".to_string())
    })?;

    fn required(value: Option<String>, name: &str) -> SessionResult<String> {
        match value.map(|v| v.trim().to_string()) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(SessionError::Config(format!(
                "Conversation provider setting '{name}' is missing"
            ))),
        }
    }

    let api_key = required(raw.api_key, "api_key")?;
    // The key travels as a header value.
    if !api_key.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(SessionError::Config(
            "Conversation provider setting 'api_key' contains invalid characters".to_string(),
        ));
    }

    Ok(ProviderConfig {
        replica_id: required(raw.replica_id, "replica_id")?,
        persona_id: required(raw.persona_id, "persona_id")?,
        api_key,
    })
}

/// The authored context for a course, or a template built from its title,
/// cut to `MAX_CONTEXT_CHARS` characters.
pub fn conversational_context(course: &Course) -> SessionResult<String> {
    let authored = course
        .conversational_context
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    let context = match authored {
        Some(context) => context.to_string(),
        None => {
            let title = course.title.trim();
            if title.is_empty() {
                return Err(SessionError::Config(format!(
                    "Course {} has neither a conversational context nor a title",
                    course.id
                )));
            }
            format!(
                "You are a friendly practice partner for the course \"{title}\". \
                 Hold a natural conversation that helps the learner rehearse what \
                 the course teaches, ask follow-up questions, and gently correct mistakes."
            )
        }
    };

    Ok(context.chars().take(MAX_CONTEXT_CHARS).collect())
}

/// Builds `{origin}/api/callback/{user_id}/{session_id}/{timestamp}/{suffix}`.
/// Path segments are percent-encoded, so arbitrary user ids stay URL-safe.
pub fn callback_url(
    origin: &Url,
    user_id: &str,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> SessionResult<Url> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CALLBACK_SUFFIX_LEN)
        .map(char::from)
        .collect();

    let session = session_id.to_string();
    let timestamp = now.timestamp_millis().to_string();

    let mut url = origin.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| SessionError::Config(format!("Callback origin '{origin}' is not a base URL")))?
        .pop_if_empty()
        .extend([
            "api",
            "callback",
            user_id,
            session.as_str(),
            timestamp.as_str(),
            suffix.as_str(),
        ]);
    Ok(url)
}

/// Maps a non-success provider status into the error taxonomy.
pub fn classify_status(status: u16, body: &str) -> SessionError {
    let detail = if body.trim().is_empty() {
        format!("provider returned status {status}")
    } else {
        body.trim().chars().take(300).collect()
    };
    match status {
        401 | 403 => SessionError::Config(format!(
            "Conversation provider rejected the credentials ({status}): {detail}"
        )),
        404 => SessionError::Config(format!(
            "Conversation provider resource not found, check replica and persona ids: {detail}"
        )),
        _ => SessionError::Api {
            status,
            message: detail,
        },
    }
}

fn transport_error(err: TransportError, what: &str) -> SessionError {
    match err {
        TransportError::Timeout => SessionError::Timeout(format!("{what} timed out")),
        TransportError::Connect(msg) => SessionError::Network(format!("{what} failed: {msg}")),
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Runs `call` under a deadline. The in-flight future is dropped when it passes,
/// which aborts the request.
async fn with_deadline<T>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<T, TransportError>>,
) -> SessionResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(|e| transport_error(e, what)),
        Err(_) => {
            debug!(what, "provider call abandoned at deadline");
            Err(SessionError::Timeout(format!("{what} exceeded {}s", limit.as_secs())))
        }
    }
}

//=========================================================================================
// The Client
//=========================================================================================

pub struct ConversationClient {
    api: Arc<dyn ProviderApi>,
    config: Arc<dyn ProviderConfigSource>,
    catalog: Arc<dyn CourseCatalog>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    callback_origin: Url,
    timeouts: ProviderTimeouts,
}

impl ConversationClient {
    pub fn new(
        api: Arc<dyn ProviderApi>,
        config: Arc<dyn ProviderConfigSource>,
        catalog: Arc<dyn CourseCatalog>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        callback_origin: Url,
    ) -> Self {
        Self {
            api,
            config,
            catalog,
            connectivity,
            clock,
            callback_origin,
            timeouts: ProviderTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ProviderTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn ensure_online(&self) -> SessionResult<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(SessionError::Network("No network connection".to_string()))
        }
    }

    async fn load_config(&self) -> SessionResult<ProviderConfig> {
        let raw = self.config.provider_config().await.map_err(|e| match e {
            PortError::Unavailable(_) => SessionError::Store(e),
            other => SessionError::Config(format!("Could not read provider settings: {other}")),
        })?;
        validate_config(raw)
    }

    /// Asks the provider to open a conversation for one practice session.
    pub async fn create_conversation(
        &self,
        course_id: &str,
        user_id: &str,
        session_id: Uuid,
    ) -> SessionResult<Conversation> {
        self.ensure_online()?;
        let config = self.load_config().await?;

        let course = self.catalog.get_course(course_id).await.map_err(|e| match e {
            PortError::NotFound(_) => SessionError::Config(format!("Course {course_id} does not exist")),
            other => SessionError::Store(other),
        })?;
        let context = conversational_context(&course)?;
        let callback = callback_url(&self.callback_origin, user_id, session_id, self.clock.now())?;

        let request = CreateConversationRequest {
            replica_id: config.replica_id,
            persona_id: config.persona_id,
            conversational_context: context,
            callback_url: callback.to_string(),
        };

        let ProviderReply { status, body } = with_deadline(
            self.timeouts.create,
            "Creating the conversation",
            self.api.create_conversation(&config.api_key, &request),
        )
        .await?;

        if !is_success(status) {
            let err = classify_status(status, &body);
            warn!(%session_id, status, error = %err, "provider refused to create conversation");
            return Err(err);
        }

        let conversation: Conversation = serde_json::from_str(&body).map_err(|e| SessionError::Api {
            status,
            message: format!("malformed create-conversation response: {e}"),
        })?;
        info!(%session_id, conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    /// Ends a conversation. Already-ended conversations (404/409) count as success.
    pub async fn end_conversation(&self, conversation_id: &str) -> SessionResult<()> {
        self.ensure_online()?;
        let config = self.load_config().await?;

        let ProviderReply { status, body } = with_deadline(
            self.timeouts.end,
            "Ending the conversation",
            self.api.end_conversation(&config.api_key, conversation_id),
        )
        .await?;

        match status {
            s if is_success(s) => {
                info!(conversation_id, "conversation ended");
                Ok(())
            }
            404 | 409 => {
                debug!(conversation_id, status, "conversation already ended");
                Ok(())
            }
            _ => Err(classify_status(status, &body)),
        }
    }
}
