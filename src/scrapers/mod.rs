//! Event sources and the page fetcher.
//!
//! This module contains the source registry and the seam used to turn one
//! source page into text for the extraction engine.
//!
//! # Source Registry
//!
//! Sources are declared in YAML (`sources.yaml` is compiled in as the default
//! registry, `--sources` replaces it):
//!
//! ```yaml
//! sources:
//!   - id: parque_la_ruina
//!     city: Hermosillo
//!     category: General
//!     url: https://www.facebook.com/ParqueLaRuinaHMO
//!     mode: metadata
//! ```
//!
//! # Fetching
//!
//! [`PageFetcher`] is implemented by [`page::HttpPageFetcher`]. A scan calls it
//! once per source, strictly in registry order. Failures are per source and
//! never abort the scan.

pub mod page;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

use crate::models::SourceDescriptor;

const BUILTIN_SOURCES: &str = include_str!("../../sources.yaml");

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read source registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source registry is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid source registry: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
}

/// Turns a source page into text for the extraction engine.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `source` and return its extracted text (possibly empty).
    async fn fetch(&self, source: &SourceDescriptor) -> Result<String, FetchError>;
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    sources: Vec<SourceDescriptor>,
}

/// The fixed, ordered list of sources visited by every scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRegistry {
    sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    /// Validate and wrap a list of sources.
    ///
    /// Ids must be non-empty and unique, cities non-empty and URLs absolute.
    pub fn new(sources: Vec<SourceDescriptor>) -> Result<Self, SourceError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if source.id.trim().is_empty() {
                return Err(SourceError::Invalid("source with empty id".to_string()));
            }
            if !seen.insert(source.id.clone()) {
                return Err(SourceError::Invalid(format!("duplicate source id `{}`", source.id)));
            }
            if source.city.trim().is_empty() {
                return Err(SourceError::Invalid(format!("source `{}` has no city", source.id)));
            }
            Url::parse(&source.url).map_err(|e| {
                SourceError::Invalid(format!("source `{}` has invalid URL: {e}", source.id))
            })?;
        }
        Ok(Self { sources })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, SourceError> {
        let file: RegistryFile = serde_yaml::from_str(raw)?;
        Self::new(file.sources)
    }

    /// The registry compiled into the binary.
    pub fn builtin() -> Result<Self, SourceError> {
        Self::from_yaml(BUILTIN_SOURCES)
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let registry = Self::from_yaml(&raw)?;
        info!(count = registry.len(), "Loaded source registry");
        Ok(registry)
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// City of the first source; used as context for documents without one.
    pub fn primary_city(&self) -> Option<&str> {
        self.sources.first().map(|s| s.city.as_str())
    }
}
