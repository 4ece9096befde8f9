//! Shared helpers for in-crate tests.

use std::sync::Arc;

/// Serve `router` on an ephemeral local port and return its base URL.
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

/// Notifier that records every request it is handed.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: tokio::sync::Mutex<Vec<cronhub_core::types::NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl cronhub_core::traits::Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        request: &cronhub_core::types::NotificationRequest,
    ) -> cronhub_core::error::Result<()> {
        self.sent.lock().await.push(request.clone());
        Ok(())
    }
}
