use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OpenmuxError;

/// Task categories a router classifies queries into.
/// Closed set: the result shape of a call depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Chat,
    Code,
    Embeddings,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Chat, TaskType::Code, TaskType::Embeddings];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Embeddings => "embeddings",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = OpenmuxError;

    fn from_str(s: &str) -> Result<Self, OpenmuxError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| OpenmuxError::Config(format!("unknown task type '{s}'")))
    }
}

/// Immutable task type → model id mapping.
///
/// Fields are private: the only way in is `new()`, which rejects blank model ids,
/// so `get()` returning `Some` always means a usable model.
#[derive(Debug, Clone)]
pub struct TaskModelRegistry {
    models: HashMap<TaskType, String>,
}

impl TaskModelRegistry {
    pub fn new<I, S>(entries: I) -> Result<Self, OpenmuxError>
    where
        I: IntoIterator<Item = (TaskType, S)>,
        S: Into<String>,
    {
        let mut models = HashMap::new();
        for (task, model) in entries {
            let model = model.into();
            if model.trim().is_empty() {
                return Err(OpenmuxError::Config(format!(
                    "task '{task}': model id must not be empty"
                )));
            }
            models.insert(task, model);
        }
        Ok(Self { models })
    }

    /// Stock models for the HuggingFace Inference backend.
    pub fn huggingface_defaults() -> Self {
        let models = HashMap::from([
            (TaskType::Chat, "microsoft/DialoGPT-medium".to_owned()),
            (TaskType::Code, "Salesforce/codegen-350M-mono".to_owned()),
            (
                TaskType::Embeddings,
                "sentence-transformers/all-MiniLM-L6-v2".to_owned(),
            ),
        ]);
        Self { models }
    }

    /// `None` means the task is unsupported, never "use some default".
    pub fn get(&self, task: TaskType) -> Option<&str> {
        self.models.get(&task).map(String::as_str)
    }

    pub fn contains(&self, task: TaskType) -> bool {
        self.models.contains_key(&task)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
