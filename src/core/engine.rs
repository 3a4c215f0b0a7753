use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::message::{Message, MessageMetadata};
use crate::mcp::descriptor::ServerDescriptor;

/// Raw events yielded by the completion provider. The orchestrator
/// treats the provider as an opaque, resumable, cancellable event
/// source; these are normalized into [`crate::core::stream::Chunk`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    TextEnd,
    ToolCall {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
    Metadata(MessageMetadata),
    /// Fresh resumption token for the underlying provider session.
    ResumeToken(String),
    /// Provider-reported terminal error. Ends the stream.
    Error {
        message: String,
        /// Set when the provider rejected the resumption token; the
        /// session clears it so the next turn starts fresh.
        resume_token_invalid: bool,
    },
    Done,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub history: Vec<Message>,
    pub descriptors: Vec<ServerDescriptor>,
    pub resume_token: Option<String>,
}

/// The generation engine seam. `start` returns a channel of provider
/// events; implementations must stop emitting promptly once the cancel
/// token fires, typically by selecting the send loop against
/// `cancel.cancelled()`.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn start(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<ProviderEvent>, String>;
}

/// Resolves the effective provider for a turn. Attempting the preferred
/// remote provider and falling back (or failing explicitly) lives behind
/// this seam; the pipeline never proceeds half-configured.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self) -> Result<ResolvedProvider, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub name: String,
    pub model: String,
    /// True when the remote provider was unreachable and a local
    /// fallback was substituted.
    pub is_fallback: bool,
}

/// Single fixed provider, for embedders without fallback logic and for
/// tests.
#[derive(Debug, Clone)]
pub struct FixedProvider {
    pub provider: ResolvedProvider,
}

impl FixedProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ResolvedProvider {
                name: name.into(),
                model: model.into(),
                is_fallback: false,
            },
        }
    }
}

#[async_trait]
impl ProviderResolver for FixedProvider {
    async fn resolve(&self) -> Result<ResolvedProvider, String> {
        Ok(self.provider.clone())
    }
}
