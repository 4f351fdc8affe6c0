//! Backend adapter - uniform interface to an LLM code-agent subprocess
//!
//! The engine and planner never talk to a concrete agent binary; they go
//! through [`Backend`]. The production implementation spawns a detached
//! child per call and parses its newline-delimited JSON event stream.

mod error;
mod process;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use error::BackendError;
pub use process::ProcessBackend;

use crate::config::BackendConfig;

/// Default invocation timeout: 30 minutes
pub const DEFAULT_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Options for one backend invocation
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub prompt: String,

    /// Working directory for the agent process
    pub cwd: Option<PathBuf>,

    pub model: Option<String>,

    /// Continue an existing agent session
    pub session_id: Option<String>,

    /// Parse the stdout event stream and forward text deltas
    pub stream: bool,

    pub skip_permissions: bool,

    pub disable_mcp: bool,

    /// MCP config paths handed through to the agent
    pub mcp_servers: Option<Vec<String>>,

    pub timeout_ms: u64,

    /// Cooperative cancel: flips to true when the caller wants the
    /// subprocess killed
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,

    /// Backend type override (reserved for multi-backend setups)
    pub backend_type: Option<String>,
}

impl InvokeOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: None,
            model: None,
            session_id: None,
            stream: false,
            skip_permissions: true,
            disable_mcp: false,
            mcp_servers: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            cancel: None,
            backend_type: None,
        }
    }
}

/// The outcome of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub prompt: String,
    pub response: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub duration_api_ms: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Streaming text-delta callback
pub type ChunkHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Uniform interface to a code-agent backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one agent invocation to completion
    async fn invoke(&self, options: InvokeOptions, on_chunk: Option<ChunkHandler>) -> Result<Invocation, BackendError>;

    /// Whether the backend binary is present and responsive
    async fn check_available(&self) -> bool;
}

/// Build the configured backend
pub fn create_backend(config: &BackendConfig) -> Arc<dyn Backend> {
    Arc::new(ProcessBackend::from_config(config))
}
