//! Outbound notification transport.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::NotificationRequest;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Deliver one message.
    async fn send(&self, request: &NotificationRequest) -> Result<()>;
}
