//! openmux: provider adapters for a multi-provider LLM router.
//!
//! A router classifies each query into a [`TaskType`], asks every candidate
//! [`Provider`] whether it can serve it, and dispatches to one. This crate
//! supplies the provider side of that contract.

pub mod config;
pub mod error;
pub mod pool;
pub mod providers;
pub mod release;
pub mod task;

pub use config::{ProviderConfig, Settings};
pub use error::{BackendError, OpenmuxError};
pub use providers::{GenerationOutput, GenerationRequest, Provider};
pub use task::{TaskModelRegistry, TaskType};

/// Rewritten together with `Cargo.toml` by `bump-version`.
pub const VERSION: &str = "0.1.0-alpha";

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::VERSION, env!("CARGO_PKG_VERSION"));
    }
}
