//! services/api/src/web/middleware.rs
//!
//! Caller identification. Authentication happens upstream; the gateway forwards
//! the authenticated user as `x-user-id` and `x-user-tier` headers.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use session_reliability_core::{Tier, User};
use tracing::debug;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";

/// The caller of a request; `None` when the gateway sent no user.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<User>);

fn caller_from(headers: &HeaderMap) -> Caller {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let user = header(USER_ID_HEADER).map(|id| User {
        id: id.to_string(),
        tier: header(USER_TIER_HEADER).map(Tier::from_name).unwrap_or(Tier::Anonymous),
    });
    Caller(user)
}

/// Middleware that reads the caller headers and inserts a `Caller` into the request extensions.
pub async fn identify_caller(mut req: Request, next: Next) -> Response {
    let caller = caller_from(req.headers());
    if let Some(user) = &caller.0 {
        debug!(user_id = %user.id, tier = ?user.tier, "caller identified");
    }
    req.extensions_mut().insert(caller);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn headers_become_a_user() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" learner-9 "));
        headers.insert(USER_TIER_HEADER, HeaderValue::from_static("Premium"));
        let Caller(user) = caller_from(&headers);
        let user = user.unwrap();
        assert_eq!(user.id, "learner-9");
        assert_eq!(user.tier, Tier::Premium);
    }

    #[test]
    fn missing_tier_means_anonymous_and_missing_id_means_nobody() {
        let mut headers = HeaderMap::new();
        assert!(caller_from(&headers).0.is_none());
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("learner-9"));
        assert_eq!(caller_from(&headers).0.unwrap().tier, Tier::Anonymous);
    }
}
