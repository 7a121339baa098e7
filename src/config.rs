use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::OpenmuxError;
use crate::pool::PoolLimits;
use crate::providers::huggingface::{self, HuggingFaceConnector};
use crate::task::{TaskModelRegistry, TaskType};

const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024; // 64 KiB
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Per-adapter configuration. Fixed once the adapter is built.
pub struct ProviderConfig {
    credential: Option<SecretString>,
    model_override: Option<String>,
    models: TaskModelRegistry,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("model_override", &self.model_override)
            .field("models", &self.models)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(models: TaskModelRegistry) -> Self {
        Self {
            credential: None,
            model_override: None,
            models,
        }
    }

    /// Set the credential explicitly. An empty string counts as no credential.
    pub fn with_credential(mut self, token: impl Into<String>) -> Self {
        let token: String = token.into();
        self.credential = (!token.is_empty()).then(|| SecretString::from(token));
        self
    }

    /// Fall back to the environment when no explicit credential was given.
    pub fn with_credential_from_env(self, var: &str) -> Self {
        if self.credential.is_some() {
            return self;
        }
        match std::env::var(var) {
            Ok(token) => self.with_credential(token),
            Err(_) => self,
        }
    }

    /// Model used for every task, ignoring the registry. Blank means none.
    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        let model: String = model.into();
        self.model_override = (!model.trim().is_empty()).then_some(model);
        self
    }

    pub fn credential(&self) -> Option<&SecretString> {
        self.credential.as_ref()
    }

    pub fn model_override(&self) -> Option<&str> {
        self.model_override.as_deref()
    }

    pub fn models(&self) -> &TaskModelRegistry {
        &self.models
    }

    /// Override first, then the task default. `None` means unsupported.
    pub fn resolve_model(&self, task: TaskType) -> Option<&str> {
        self.model_override().or_else(|| self.models.get(task))
    }
}

// --- TOML deserialization structs (private, map 1:1 to the settings file) ---

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    huggingface: HuggingFaceSection,
    #[serde(default)]
    pool: PoolLimits,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HuggingFaceSection {
    token_env: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    models: Option<HashMap<String, String>>,
}

// --- Validated settings ---

#[derive(Debug, Default)]
pub struct Settings {
    pub huggingface: HuggingFaceSettings,
    pub pool: PoolLimits,
}

#[derive(Debug)]
pub struct HuggingFaceSettings {
    pub token_env: String,
    pub model: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub models: TaskModelRegistry,
}

impl Default for HuggingFaceSettings {
    fn default() -> Self {
        Self {
            token_env: huggingface::TOKEN_ENV.to_owned(),
            model: None,
            base_url: huggingface::DEFAULT_BASE_URL.to_owned(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            models: TaskModelRegistry::huggingface_defaults(),
        }
    }
}

impl HuggingFaceSettings {
    /// Adapter configuration with the credential read from `token_env`.
    pub fn provider_config(&self) -> ProviderConfig {
        let config =
            ProviderConfig::new(self.models.clone()).with_credential_from_env(&self.token_env);
        match &self.model {
            Some(model) => config.with_model_override(model.clone()),
            None => config,
        }
    }

    pub fn connector(&self) -> HuggingFaceConnector {
        HuggingFaceConnector::new(self.base_url.clone(), self.timeout)
    }
}

impl FromStr for Settings {
    type Err = OpenmuxError;

    /// Parse and validate settings from a TOML string.
    fn from_str(content: &str) -> Result<Self, OpenmuxError> {
        let file: SettingsFile =
            toml::from_str(content).map_err(|e| OpenmuxError::Config(e.to_string()))?;

        if file.pool.workers == 0 {
            return Err(OpenmuxError::Config(
                "pool.workers must be at least 1".to_owned(),
            ));
        }

        if file.pool.checked_capacity().is_none() {
            return Err(OpenmuxError::Config(format!(
                "pool.workers + pool.queue_limit must not exceed {}",
                crate::pool::MAX_CAPACITY
            )));
        }

        Ok(Self {
            huggingface: compile_huggingface(file.huggingface)?,
            pool: file.pool,
        })
    }
}

impl Settings {
    /// Load settings from a TOML file. Checks file size before reading.
    pub fn load(path: &Path) -> Result<Self, OpenmuxError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| OpenmuxError::Config(format!("cannot read {}: {e}", path.display())))?;

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(OpenmuxError::Config(format!(
                "config file exceeds {MAX_CONFIG_FILE_SIZE} byte limit"
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| OpenmuxError::Config(format!("cannot read {}: {e}", path.display())))?;

        content.parse()
    }
}

fn compile_huggingface(section: HuggingFaceSection) -> Result<HuggingFaceSettings, OpenmuxError> {
    let defaults = HuggingFaceSettings::default();

    let models = match section.models {
        None => defaults.models,
        Some(entries) => {
            let entries = entries
                .into_iter()
                .map(|(task, model)| Ok((task.parse::<TaskType>()?, model)))
                .collect::<Result<Vec<_>, OpenmuxError>>()?;
            TaskModelRegistry::new(entries)?
        }
    };

    if section.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return Err(OpenmuxError::Config(
            "huggingface.model must not be empty".to_owned(),
        ));
    }

    if section.timeout_secs == Some(0) {
        return Err(OpenmuxError::Config(
            "huggingface.timeout_secs must be at least 1".to_owned(),
        ));
    }

    Ok(HuggingFaceSettings {
        token_env: section.token_env.unwrap_or(defaults.token_env),
        model: section.model,
        base_url: section.base_url.unwrap_or(defaults.base_url),
        timeout: section
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        models,
    })
}
