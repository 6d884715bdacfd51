//! Generative-AI HTTP interaction.
//!
//! This module provides the interface used by the extraction engine to talk to
//! a Gemini-style content generation API.
//!
//! # Architecture
//!
//! - [`GenerativeBackend`]: Core trait defining one generation request and model listing
//! - [`GeminiClient`]: `reqwest` implementation against the REST endpoints
//!
//! The model identifier is part of the URL path and the API key travels as the
//! `key` query parameter, so transport errors are stripped of their URL before
//! they can reach a log line. Grounded requests add the
//! `googleSearchRetrieval` tool. A request is issued exactly once; falling back to
//! another model is the caller's decision (see `extract`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::utils::truncate_for_log;

/// Default REST base for the Gemini API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Generation method a model must support to be usable for extraction.
pub const GENERATE_CONTENT: &str = "generateContent";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no API key configured")]
    MissingCredentials,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The request URL is stripped, since it carries the API key.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.without_url())
    }
}

/// A model as reported by the provider's listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Fully qualified name, e.g. `models/gemini-2.5-flash`.
    pub name: String,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

impl ModelInfo {
    /// Identifier without the `models/` prefix, as used in request paths.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn can_generate(&self) -> bool {
        self.supported_generation_methods
            .iter()
            .any(|m| m == GENERATE_CONTENT)
    }
}

/// Trait for generative model access.
///
/// Implementors send a prompt to a named model and return the text of the
/// first candidate, if any. Tests substitute an in-memory implementation.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Issue a single generation request against `model`.
    async fn generate(&self, model: &str, prompt: &str) -> Result<Option<String>, ApiError>;

    /// Like [`generate`](Self::generate), with the provider's web search
    /// retrieval tool enabled so the model can ground its answer.
    async fn generate_grounded(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<Option<String>, ApiError>;

    /// List every model visible to the configured credentials.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError>;
}

/// `reqwest` client for the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl GeminiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    fn key(&self) -> Result<&str, ApiError> {
        self.api_key.as_deref().ok_or(ApiError::MissingCredentials)
    }

    /// POST one `generateContent` request and return the first candidate's text.
    async fn generate_content(
        &self,
        model: &str,
        payload: serde_json::Value,
    ) -> Result<Option<String>, ApiError> {
        let key = self.key()?;
        let url = Url::parse_with_params(
            &format!("{}/models/{}:{}", self.base_url, model, GENERATE_CONTENT),
            [("key", key)],
        )?;

        let t0 = Instant::now();
        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        if !status.is_success() {
            warn!(elapsed_ms, status = status.as_u16(), "Generation request rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body, 200),
            });
        }

        debug!(elapsed_ms, bytes = body.len(), "Generation request succeeded");
        Ok(first_candidate_text(&body)?)
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    #[instrument(level = "info", skip_all, fields(%model))]
    async fn generate(&self, model: &str, prompt: &str) -> Result<Option<String>, ApiError> {
        self.generate_content(model, generation_payload(prompt, false)).await
    }

    #[instrument(level = "info", skip_all, fields(%model, grounded = true))]
    async fn generate_grounded(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<Option<String>, ApiError> {
        self.generate_content(model, generation_payload(prompt, true)).await
    }

    #[instrument(level = "info", skip_all)]
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        let key = self.key()?;
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = Url::parse_with_params(
                &format!("{}/models", self.base_url),
                [("key", key), ("pageSize", "1000")],
            )?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let response = self.client.get(url).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body: truncate_for_log(&body, 200),
                });
            }

            let page: ModelList = serde_json::from_str(&body)?;
            models.extend(page.models);
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        Ok(models)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

/// Request body for one prompt, optionally with search retrieval enabled.
fn generation_payload(prompt: &str, grounded: bool) -> serde_json::Value {
    let mut payload = json!({
        "contents": [{
            "parts": [{ "text": prompt }]
        }]
    });
    if grounded {
        payload["tools"] = json!([{ "googleSearchRetrieval": {} }]);
    }
    payload
}

/// Text of the first part of the first candidate in a generation response.
fn first_candidate_text(body: &str) -> Result<Option<String>, serde_json::Error> {
    let parsed: GenerateResponse = serde_json::from_str(body)?;
    Ok(parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .filter(|t| !t.trim().is_empty()))
}
