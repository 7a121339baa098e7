//! HuggingFace Inference backend
//!
//! Blocking HTTP client for the HuggingFace Inference router. Two pipelines are
//! used: text generation (`POST /models/{model}`) and feature extraction
//! (`POST /models/{model}/pipeline/feature-extraction`).

use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::adapter::Adapter;
use super::types::TextGenerationParams;
use super::{Connector, InferenceBackend};
use crate::config::ProviderConfig;
use crate::error::BackendError;
use crate::pool::PoolLimits;

pub const DEFAULT_BASE_URL: &str = "https://router.huggingface.co/hf-inference";
pub const TOKEN_ENV: &str = "HF_TOKEN";

pub type HuggingFaceProvider = Adapter<HuggingFaceConnector>;

impl Adapter<HuggingFaceConnector> {
    pub fn huggingface(
        config: ProviderConfig,
        connector: HuggingFaceConnector,
        limits: PoolLimits,
    ) -> Self {
        Adapter::new(config, connector, limits)
    }
}

#[derive(Debug, Clone)]
pub struct HuggingFaceConnector {
    base_url: String,
    timeout: Duration,
}

impl HuggingFaceConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        }
    }
}

impl Default for HuggingFaceConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, Duration::from_secs(60))
    }
}

impl Connector for HuggingFaceConnector {
    type Client = HuggingFaceClient;

    fn name(&self) -> &str {
        "huggingface"
    }

    fn connect(&self, credential: Option<&SecretString>) -> Result<HuggingFaceClient, BackendError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| BackendError::Client(format!("invalid base URL {}: {e}", self.base_url)))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = credential {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| BackendError::Client(format!("invalid credential: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        debug!(base_url = %self.base_url, "created HuggingFace client");
        Ok(HuggingFaceClient { http, base_url })
    }
}

pub struct HuggingFaceClient {
    http: Client,
    base_url: Url,
}

#[derive(Serialize)]
struct TextGenerationRequest<'a> {
    inputs: &'a str,
    parameters: &'a TextGenerationParams,
}

#[derive(Serialize)]
struct FeatureExtractionRequest<'a> {
    inputs: &'a str,
}

#[derive(Deserialize)]
struct Generated {
    generated_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextGenerationResponse {
    Batch(Vec<Generated>),
    Single(Generated),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeatureExtractionResponse {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
}

impl HuggingFaceClient {
    /// `{base}/models/{model}/{tail..}`. Each segment is percent-encoded, so
    /// `?` or `#` in a model id cannot change the request target.
    fn endpoint(&self, model: &str, tail: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::Client(format!("unusable base URL: {}", self.base_url)))?
            .pop_if_empty()
            .push("models")
            .extend(model.split('/'))
            .extend(tail);
        Ok(url)
    }

    fn post<B: Serialize>(&self, url: Url, body: &B) -> Result<Response, BackendError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        check_status(response)
    }
}

impl InferenceBackend for HuggingFaceClient {
    fn text_generation(
        &self,
        prompt: &str,
        model: &str,
        params: &TextGenerationParams,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(model, &[])?;
        let response = self.post(
            url,
            &TextGenerationRequest {
                inputs: prompt,
                parameters: params,
            },
        )?;

        let parsed: TextGenerationResponse = response
            .json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        match parsed {
            TextGenerationResponse::Single(generated) => Ok(generated.generated_text),
            TextGenerationResponse::Batch(batch) => batch
                .into_iter()
                .next()
                .map(|g| g.generated_text)
                .ok_or_else(|| BackendError::Malformed("empty generation list".to_owned())),
        }
    }

    fn feature_extraction(&self, text: &str, model: &str) -> Result<Vec<f32>, BackendError> {
        let url = self.endpoint(model, &["pipeline", "feature-extraction"])?;
        let response = self.post(url, &FeatureExtractionRequest { inputs: text })?;

        let parsed: FeatureExtractionResponse = response
            .json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        match parsed {
            FeatureExtractionResponse::Flat(vector) => Ok(vector),
            FeatureExtractionResponse::Nested(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| BackendError::Malformed("empty embedding list".to_owned())),
        }
    }
}

fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    Err(match status.as_u16() {
        401 | 403 => BackendError::Auth {
            status: status.as_u16(),
        },
        429 => BackendError::RateLimited,
        code => BackendError::Status {
            status: code,
            body: response.text().unwrap_or_default(),
        },
    })
}
