//! Request executor: performs a task's HTTP call.
//!
//! Optional bearer auth via [`AuthTokenResolver`], retry on transport errors
//! and 5xx (never on 4xx), and every attempt bounded by the shared deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use serde_json::Value;
use tokio::time::Instant;

use cronhub_core::config::ExecutionConfig;
use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::{RequestBackend, RequestReport};
use cronhub_core::types::{Endpoint, EndpointOptions, HttpMethod, truncate_output};

use crate::auth::AuthTokenResolver;

pub struct RequestExecutor {
    user_agent: String,
    max_output_bytes: usize,
}

/// Result of a single attempt.
enum Attempt {
    Response { status: u16, body: String },
    Transport(String),
}

impl Attempt {
    fn retryable(&self) -> bool {
        match self {
            Attempt::Response { status, .. } => *status >= 500,
            Attempt::Transport(_) => true,
        }
    }
}

impl RequestExecutor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn client(&self, options: &EndpointOptions) -> Result<reqwest::Client> {
        let redirect = if options.follow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        };
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .danger_accept_invalid_certs(!options.validate_ssl)
            .redirect(redirect)
            .build()
            .map_err(|e| CronHubError::Transport(format!("client error: {e}")))
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        endpoint: &Endpoint,
        headers: &BTreeMap<String, String>,
        deadline: Instant,
    ) -> Attempt {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Attempt::Transport("timed out before the request was sent".into());
        }

        let request = build_request(
            client,
            endpoint.method,
            &endpoint.url,
            headers,
            endpoint.data.as_ref(),
        )
        .timeout(remaining);

        // the attempt timeout is whatever is left before the task deadline
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Attempt::Transport(format!(
                    "{} {}: timed out after {}ms",
                    endpoint.method,
                    endpoint.url,
                    remaining.as_millis()
                ));
            }
            Err(e) => return Attempt::Transport(format!("{} {}: {e}", endpoint.method, endpoint.url)),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => Attempt::Response { status, body },
            Err(e) if e.is_timeout() => Attempt::Transport("timed out reading the response body".into()),
            Err(e) => Attempt::Transport(format!("read body failed: {e}")),
        }
    }

    fn report(&self, attempt: Attempt, attempts: u32) -> RequestReport {
        match attempt {
            Attempt::Response { status, body } => {
                let response = truncate_output(&body, self.max_output_bytes);
                if status < 400 {
                    RequestReport {
                        success: true,
                        response,
                        status: Some(status),
                        error: None,
                        attempts,
                    }
                } else {
                    RequestReport {
                        success: false,
                        error: Some(format!("HTTP {status}: {response}")),
                        response,
                        status: Some(status),
                        attempts,
                    }
                }
            }
            Attempt::Transport(msg) => RequestReport {
                success: false,
                response: String::new(),
                status: None,
                error: Some(CronHubError::Transport(msg).to_string()),
                attempts,
            },
        }
    }
}

#[async_trait]
impl RequestBackend for RequestExecutor {
    async fn execute(&self, endpoint: &Endpoint, deadline: Instant) -> Result<RequestReport> {
        let client = self.client(&endpoint.options)?;

        let mut headers = endpoint.headers.clone();
        if let Some(auth) = &endpoint.auth_request {
            // no token, no primary request
            let token = AuthTokenResolver::new(client.clone())
                .resolve(auth, deadline)
                .await?;
            headers.retain(|k, _| !k.eq_ignore_ascii_case("authorization"));
            headers.insert("Authorization".into(), format!("Bearer {token}"));
        }

        let max_attempts = endpoint.options.retry.attempts();
        let delay = Duration::from_secs(endpoint.options.retry.delay_secs);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let attempt = self.attempt(&client, endpoint, &headers, deadline).await;

            if !attempt.retryable() || attempts >= max_attempts {
                return Ok(self.report(attempt, attempts));
            }
            let next_attempt = Instant::now().checked_add(delay);
            if next_attempt.is_none_or(|at| at >= deadline) {
                tracing::warn!(
                    "⏰ No time left to retry {} {} after attempt {}/{}",
                    endpoint.method,
                    endpoint.url,
                    attempts,
                    max_attempts
                );
                return Ok(self.report(attempt, attempts));
            }

            tracing::info!(
                "🔁 Retrying {} {} in {}s (attempt {}/{})",
                endpoint.method,
                endpoint.url,
                delay.as_secs(),
                attempts + 1,
                max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Build a request with headers and a body serialised per Content-Type:
/// JSON by default, form encoding for `x-www-form-urlencoded`, raw text for
/// anything else.
pub(crate) fn build_request(
    client: &reqwest::Client,
    method: HttpMethod,
    url: &str,
    headers: &BTreeMap<String, String>,
    data: Option<&Value>,
) -> reqwest::RequestBuilder {
    let mut request = client.request(to_reqwest_method(method), url);

    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.to_ascii_lowercase());

    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let Some(data) = data else {
        return request;
    };

    match content_type.as_deref() {
        None => request.json(data),
        Some(ct) if ct.contains("json") => request.body(data.to_string()),
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => request.form(data),
        Some(_) => match data {
            Value::String(text) => request.body(text.clone()),
            other => request.body(other.to_string()),
        },
    }
}
