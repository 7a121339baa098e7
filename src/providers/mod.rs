pub mod adapter;
pub mod huggingface;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{BackendError, OpenmuxError};
use crate::task::TaskType;

pub use adapter::Adapter;
pub use huggingface::{HuggingFaceClient, HuggingFaceConnector, HuggingFaceProvider};
pub use types::{GenerationOutput, GenerationParams, GenerationRequest, TextGenerationParams};

/// What a router sees of an inference backend. The `dyn Trait` boundary
/// between routing and backends.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// A credential is configured. Local check, no network.
    fn is_available(&self) -> bool;

    /// True iff `generate` for this task would get past model resolution.
    fn supports_task(&self, task: TaskType) -> bool;

    async fn generate(&self, request: GenerationRequest)
    -> Result<GenerationOutput, OpenmuxError>;

    /// Stop accepting work and drop cached clients. Idempotent.
    fn close(&self);
}

/// A blocking inference client. Calls run on the adapter's worker pool,
/// never on the async runtime.
pub trait InferenceBackend: Send + Sync + 'static {
    fn text_generation(
        &self,
        prompt: &str,
        model: &str,
        params: &TextGenerationParams,
    ) -> Result<String, BackendError>;

    fn feature_extraction(&self, text: &str, model: &str) -> Result<Vec<f32>, BackendError>;
}

/// Builds a backend client from the adapter's credential. Called at most once
/// per cached client.
pub trait Connector: Send + Sync + 'static {
    type Client: InferenceBackend;

    fn name(&self) -> &str;

    fn connect(&self, credential: Option<&SecretString>) -> Result<Self::Client, BackendError>;
}

/// Capability gate: first candidate that is available and supports `task`.
pub fn select(candidates: &[Arc<dyn Provider>], task: TaskType) -> Option<&Arc<dyn Provider>> {
    candidates
        .iter()
        .find(|p| p.is_available() && p.supports_task(task))
}
