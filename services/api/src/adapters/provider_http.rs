//! services/api/src/adapters/provider_http.rs
//!
//! HTTP transport for the conversation provider. It only moves bytes: status
//! classification, deadlines and retries live in the core `ConversationClient`.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use session_reliability_core::domain::CreateConversationRequest;
use session_reliability_core::ports::{ProviderApi, ProviderReply, TransportError};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection setup budget; the per-call deadline is enforced by the core client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpProviderApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProviderApi {
    pub fn new(base_url: Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends path segments to the base URL, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Connect(format!("{} cannot be used as a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post(&self, url: Url, api_key: &str, body: Option<&CreateConversationRequest>) -> Result<ProviderReply, TransportError> {
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| TransportError::Connect(format!("invalid API key header value: {e}")))?;
        let mut request = self.client.post(url.clone()).header("x-api-key", key);
        request = match body {
            Some(body) => request.json(body),
            None => request.header(CONTENT_TYPE, "application/json"),
        };

        let response = request.send().await.map_err(map_transport_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_transport_err)?;
        debug!(%url, status, "provider responded");
        Ok(ProviderReply { status, body })
    }
}

fn map_transport_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(e.to_string())
    }
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn create_conversation(
        &self,
        api_key: &str,
        request: &CreateConversationRequest,
    ) -> Result<ProviderReply, TransportError> {
        let url = self.endpoint(&["conversations"])?;
        self.post(url, api_key, Some(request)).await
    }

    async fn end_conversation(
        &self,
        api_key: &str,
        conversation_id: &str,
    ) -> Result<ProviderReply, TransportError> {
        let url = self.endpoint(&["conversations", conversation_id, "end"])?;
        self.post(url, api_key, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> HttpProviderApi {
        let base = Url::parse(&format!("{}/v2", server.uri())).unwrap();
        HttpProviderApi::new(base).unwrap()
    }

    fn request() -> CreateConversationRequest {
        CreateConversationRequest {
            replica_id: "r-1".into(),
            persona_id: "p-1".into(),
            conversational_context: "Order a coffee in Spanish.".into(),
            callback_url: "https://learn.example.com/api/callback/u/s/1/abc".into(),
        }
    }

    #[tokio::test]
    async fn create_posts_the_request_with_the_api_key() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "conversation_id": "c-1",
            "conversation_url": "https://meet.example/c-1",
            "status": "active"
        });
        Mock::given(method("POST"))
            .and(path("/v2/conversations"))
            .and(header("x-api-key", "secret"))
            .and(body_partial_json(serde_json::json!({"replica_id": "r-1", "persona_id": "p-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .expect(1)
            .mount(&server)
            .await;

        let reply = api_for(&server).create_conversation("secret", &request()).await.unwrap();
        assert_eq!(reply.status, 200);
        assert!(reply.body.contains("c-1"));
    }

    #[tokio::test]
    async fn error_statuses_are_passed_through_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/conversations"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let reply = api_for(&server).create_conversation("secret", &request()).await.unwrap();
        assert_eq!(reply.status, 503);
        assert_eq!(reply.body, "overloaded");
    }

    #[tokio::test]
    async fn end_escapes_the_conversation_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/conversations/c%2F9/end"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let reply = api_for(&server).end_conversation("secret", "c/9").await.unwrap();
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let server = MockServer::start().await;
        let api = api_for(&server);
        drop(server);

        let err = api.end_conversation("secret", "c-1").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
