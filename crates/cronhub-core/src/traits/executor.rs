//! Execution backends. Both mirror a request/response function contract and
//! are cancelled by dropping the returned future.

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;
use crate::types::{Command, Endpoint};

/// `{success, output, error}` from running a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandReport {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Run the script. `Err` only for failures to run it at all (spawn,
    /// privileges); a script that ran and failed is `Ok` with `success: false`.
    async fn execute(&self, command: &Command) -> Result<CommandReport>;
}

/// `{success, response, status, error}` from an HTTP call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestReport {
    pub success: bool,
    pub response: String,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[async_trait]
pub trait RequestBackend: Send + Sync {
    /// Issue the request, retrying per the endpoint's policy without going
    /// past `deadline`.
    async fn execute(&self, endpoint: &Endpoint, deadline: Instant) -> Result<RequestReport>;
}
