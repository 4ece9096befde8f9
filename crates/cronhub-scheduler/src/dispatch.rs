//! Concrete notifiers: actually deliver a rendered notification.
//! Supports: SMTP e-mail, generic HTTP webhook, and a log-only fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use cronhub_core::config::{EmailNotifyConfig, NotifyBackend, NotifyConfig, WebhookNotifyConfig};
use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::Notifier;
use cronhub_core::types::NotificationRequest;

/// Build the notifier selected in config.
pub fn notifier_from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match config.backend {
        NotifyBackend::Log => Ok(Arc::new(LogNotifier)),
        NotifyBackend::Email => {
            let email = config.email.as_ref().ok_or_else(|| {
                CronHubError::Config("notify.backend = \"email\" needs a [notify.email] section".into())
            })?;
            Ok(Arc::new(EmailNotifier::new(email)?))
        }
        NotifyBackend::Webhook => {
            let webhook = config.webhook.as_ref().ok_or_else(|| {
                CronHubError::Config(
                    "notify.backend = \"webhook\" needs a [notify.webhook] section".into(),
                )
            })?;
            Ok(Arc::new(WebhookNotifier::new(
                webhook,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
    }
}

// ─── Log ────────────────────────────────────────────────────

/// Writes the message to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        tracing::info!(
            "📢 {} → {}\n{}",
            request.subject,
            request.recipients.to,
            request.body
        );
        Ok(())
    }
}

// ─── E-mail ─────────────────────────────────────────────────

pub struct EmailNotifier {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    pub fn new(config: &EmailNotifyConfig) -> Result<Self> {
        if config.smtp_host.is_empty() || config.from.is_empty() {
            return Err(CronHubError::Config(
                "notify.email needs smtp_host and from".into(),
            ));
        }

        let from_name = config.display_name.as_deref().unwrap_or("cronhub");
        let from: Mailbox = format!("{from_name} <{}>", config.from)
            .parse()
            .map_err(|e| CronHubError::Config(format!("Invalid from: {e}")))?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| CronHubError::Config(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        let mut builder = builder.port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }

    /// Assemble the e-mail for a request.
    pub fn message(&self, request: &NotificationRequest) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(request.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for addr in request.recipients.to_list() {
            builder = builder.to(parse_mailbox(&addr)?);
        }
        for addr in request.recipients.cc_list() {
            builder = builder.cc(parse_mailbox(&addr)?);
        }
        for addr in request.recipients.bcc_list() {
            builder = builder.bcc(parse_mailbox(&addr)?);
        }
        if let Some(reply_to) = request.recipients.reply_to.as_deref().filter(|r| !r.trim().is_empty()) {
            builder = builder.reply_to(parse_mailbox(reply_to.trim())?);
        }

        builder
            .body(request.body.clone())
            .map_err(|e| CronHubError::Notify(format!("Build email: {e}")))
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox> {
    addr.parse()
        .map_err(|e| CronHubError::Notify(format!("Invalid address '{addr}': {e}")))
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        let email = self.message(request)?;
        self.mailer
            .send(email)
            .await
            .map_err(|e| CronHubError::Notify(format!("SMTP send: {e}")))?;
        tracing::info!("📤 Email sent to: {}", request.recipients.to);
        Ok(())
    }
}

// ─── Webhook ────────────────────────────────────────────────

/// POSTs the notification as JSON.
pub struct WebhookNotifier {
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookNotifyConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CronHubError::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "task_id": request.task_id,
            "task_name": request.task_name,
            "subject": request.subject,
            "body": request.body,
            "recipients": request.recipients,
            "log": request.log,
        }));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CronHubError::Notify(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent: {}", request.subject);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CronHubError::Notify(format!("Webhook error {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use chrono::Utc;
    use cronhub_core::types::{
        ExecutionLog, ExecutionResult, MailRecipients, NotificationSettings,
    };
    use tokio::sync::Mutex;

    fn request() -> NotificationRequest {
        NotificationRequest {
            task_id: "t-1".into(),
            task_name: "backup".into(),
            log: ExecutionLog {
                executed_at: Utc::now(),
                result: ExecutionResult::Failure,
                output: String::new(),
                error: Some("disk full".into()),
                duration_ms: 5,
            },
            recipients: MailRecipients {
                to: "ops@example.com, dev@example.com".into(),
                cc: Some("lead@example.com".into()),
                bcc: None,
                reply_to: Some("noreply@example.com".into()),
            },
            settings: NotificationSettings::default(),
            subject: "[cronhub] backup: FAILURE".into(),
            body: "Task: backup\n".into(),
        }
    }

    fn email_config() -> EmailNotifyConfig {
        EmailNotifyConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "cron".into(),
            password: "secret".into(),
            from: "cron@example.com".into(),
            display_name: None,
            starttls: true,
        }
    }

    #[tokio::test]
    async fn test_email_message_headers() {
        let notifier = EmailNotifier::new(&email_config()).unwrap();
        let message = notifier.message(&request()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("From: cronhub <cron@example.com>"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("dev@example.com"));
        assert!(raw.contains("Cc: lead@example.com"));
        assert!(raw.contains("Reply-To: noreply@example.com"));
        assert!(raw.contains("Subject: [cronhub] backup: FAILURE"));
    }

    #[tokio::test]
    async fn test_email_bad_address_rejected() {
        let notifier = EmailNotifier::new(&email_config()).unwrap();
        let mut req = request();
        req.recipients.to = "not an address".into();
        assert!(matches!(notifier.message(&req), Err(CronHubError::Notify(_))));
    }

    #[test]
    fn test_email_config_required() {
        let config = NotifyConfig {
            backend: NotifyBackend::Email,
            ..Default::default()
        };
        assert!(matches!(
            notifier_from_config(&config),
            Err(CronHubError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_log_notifier_default() {
        let notifier = notifier_from_config(&NotifyConfig::default()).unwrap();
        assert_eq!(notifier.name(), "log");
        notifier.send(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let received: Arc<Mutex<Option<(HeaderMap, serde_json::Value)>>> = Arc::default();
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(slot): State<Arc<Mutex<Option<(HeaderMap, serde_json::Value)>>>>,
                     headers: HeaderMap,
                     axum::Json(body): axum::Json<serde_json::Value>| async move {
                        *slot.lock().await = Some((headers, body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/fail",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
            )
            .with_state(received.clone());
        let base = serve(router).await;

        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());
        let notifier = WebhookNotifier::new(
            &WebhookNotifyConfig {
                url: format!("{base}/hook"),
                headers,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        notifier.send(&request()).await.unwrap();

        let (headers, body) = received.lock().await.take().unwrap();
        assert_eq!(headers.get("x-token").unwrap(), "abc");
        assert_eq!(body["task_name"], "backup");
        assert_eq!(body["log"]["result"], "FAILURE");

        let failing = WebhookNotifier::new(
            &WebhookNotifyConfig {
                url: format!("{base}/fail"),
                headers: BTreeMap::new(),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(failing.send(&request()).await.is_err());
    }
}
