//! Bearer token resolution for endpoints guarded by a login call.

use serde_json::Value;
use tokio::time::Instant;

use cronhub_core::error::{CronHubError, Result};
use cronhub_core::types::{AuthRequest, truncate_output};

use crate::request::build_request;

pub struct AuthTokenResolver {
    client: reqwest::Client,
}

impl AuthTokenResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Call the auth endpoint and pull the token out of its JSON response.
    /// Every failure maps to `AuthResolutionFailed`.
    pub async fn resolve(&self, auth: &AuthRequest, deadline: Instant) -> Result<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CronHubError::AuthResolutionFailed(
                "deadline exceeded before auth request".into(),
            ));
        }

        let response = build_request(
            &self.client,
            auth.method,
            &auth.url,
            &auth.headers,
            auth.data.as_ref(),
        )
        .timeout(remaining)
        .send()
        .await
        .map_err(|e| {
            CronHubError::AuthResolutionFailed(format!("{} {}: {e}", auth.method, auth.url))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CronHubError::AuthResolutionFailed(format!("failed to read auth response: {e}"))
        })?;

        if !status.is_success() {
            return Err(CronHubError::AuthResolutionFailed(format!(
                "auth endpoint returned {}: {}",
                status.as_u16(),
                truncate_output(&body, 512)
            )));
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| {
            CronHubError::AuthResolutionFailed(format!("auth response is not JSON: {e}"))
        })?;

        let token = extract_token(&json, &auth.token_field).ok_or_else(|| {
            CronHubError::AuthResolutionFailed(format!(
                "token field '{}' not found in auth response",
                auth.token_field
            ))
        })?;

        tracing::debug!("🔑 Resolved bearer token from {}", auth.url);
        Ok(token)
    }
}

/// Walk a dotted path (`data.tokens.0.value`) to a string or number leaf.
pub fn extract_token(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
