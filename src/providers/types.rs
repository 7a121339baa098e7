//! Provider-agnostic request and result types

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::task::TaskType;

pub const MAX_NEW_TOKENS: &str = "max_new_tokens";
pub const TEMPERATURE: &str = "temperature";
pub const TOP_P: &str = "top_p";

pub const DEFAULT_MAX_NEW_TOKENS: u32 = 100;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;

/// One call into a provider. The query may be empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub query: String,
    pub task: TaskType,
    #[serde(default)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(query: impl Into<String>, task: TaskType) -> Self {
        Self {
            query: query.into(),
            task,
            params: GenerationParams::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Open-ended parameter bag. Backends read a fixed subset; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationParams(HashMap<String, Value>);

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sampling parameters for text generation, defaults filled in.
    /// A recognized key holding an unusable value falls back to its default.
    pub fn text_generation(&self) -> TextGenerationParams {
        TextGenerationParams {
            max_new_tokens: self
                .read(MAX_NEW_TOKENS, |v| {
                    v.as_u64()
                        .filter(|n| *n > 0)
                        .and_then(|n| u32::try_from(n).ok())
                })
                .unwrap_or(DEFAULT_MAX_NEW_TOKENS),
            temperature: self
                .read(TEMPERATURE, |v| v.as_f64().filter(|t| t.is_finite() && *t >= 0.0))
                .unwrap_or(DEFAULT_TEMPERATURE),
            top_p: self
                .read(TOP_P, |v| v.as_f64().filter(|p| (0.0..=1.0).contains(p)))
                .unwrap_or(DEFAULT_TOP_P),
            return_full_text: false,
        }
    }

    fn read<T>(&self, key: &str, extract: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let value = self.0.get(key)?;
        let parsed = extract(value);
        if parsed.is_none() {
            warn!(key, %value, "ignoring invalid generation parameter");
        }
        parsed
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for GenerationParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// What a text-generation backend call receives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TextGenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    /// Always false: only newly generated text comes back, never the prompt.
    pub return_full_text: bool,
}

impl Default for TextGenerationParams {
    fn default() -> Self {
        GenerationParams::default().text_generation()
    }
}

/// Result of a provider call. Shape follows the task category so an embedding
/// can never be mistaken for text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum GenerationOutput {
    Text(String),
    Embedding(Vec<f32>),
}

impl GenerationOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Embedding(_) => None,
        }
    }

    pub fn as_embedding(&self) -> Option<&[f32]> {
        match self {
            Self::Embedding(vector) => Some(vector),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for GenerationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Embedding(vector) => {
                f.write_str("[")?;
                for (i, x) in vector.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
        }
    }
}
