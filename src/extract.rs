//! Event extraction from page text with model fallback.
//!
//! The [`Extractor`] turns free text into [`CandidateEvent`]s by sending one
//! fixed prompt to a generative model. Which models are tried, and in which
//! order, is decided by a [`ModelStrategy`]: models discovered at startup that
//! match the preference list come first, otherwise the static preference list
//! is used as-is.
//!
//! Each attempt produces an [`AttemptOutcome`]. The first parsed response
//! wins; rejected requests and malformed responses fall through to the next
//! model. When every model fails the result is empty, never an error.
//!
//! [`Extractor::search`] skips the page text entirely: it asks a single model
//! for a city's events with web search grounding enabled.

use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{ApiError, GenerativeBackend, ModelInfo};
use crate::models::{CandidateEvent, SourceDescriptor};
use crate::utils::{excerpt, looks_truncated, strip_code_fences, truncate_for_log};

/// Texts shorter than this are not worth a model call.
pub const MIN_TEXT_LEN: usize = 50;

/// Upper bound on page text embedded in the prompt, in characters.
pub const MAX_EXCERPT_CHARS: usize = 50_000;

/// Maximum number of models tried for one text.
pub const MAX_ATTEMPTS: usize = 4;

/// Static preference order, lite and free-tier friendly models first.
pub const DEFAULT_MODEL_PREFERENCE: [&str; 4] = [
    "gemini-2.0-flash-lite-preview-02-05",
    "gemini-flash-lite-latest",
    "gemini-2.5-flash",
    "gemini-1.5-flash",
];

/// What the prompt tells the model about where the text came from.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub id: &'a str,
    pub city: &'a str,
    pub category: &'a str,
}

impl<'a> From<&'a SourceDescriptor> for SourceContext<'a> {
    fn from(source: &'a SourceDescriptor) -> Self {
        Self {
            id: &source.id,
            city: &source.city,
            category: &source.category,
        }
    }
}

/// Models confirmed callable for content generation, discovered once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelCatalog {
    models: Vec<String>,
}

impl ModelCatalog {
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }

    /// Keep the listed models that support content generation.
    pub fn from_listing(listing: &[ModelInfo]) -> Self {
        Self::new(
            listing
                .iter()
                .filter(|m| m.can_generate())
                .map(|m| m.short_name().to_string())
                .unique()
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }
}

/// Ordered model fallback.
#[derive(Debug, Clone)]
pub struct ModelStrategy {
    preferences: Vec<String>,
    catalog: ModelCatalog,
}

impl ModelStrategy {
    pub fn new(preferences: Vec<String>, catalog: ModelCatalog) -> Self {
        let preferences = if preferences.is_empty() {
            DEFAULT_MODEL_PREFERENCE.iter().map(|m| m.to_string()).collect()
        } else {
            preferences
        };
        Self {
            preferences,
            catalog,
        }
    }

    /// Models to try, in order.
    ///
    /// For each preference an exact catalog match comes before catalog models
    /// that merely contain the preference. If the catalog is empty or nothing
    /// in it matches, the preference list itself is returned.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        if !self.catalog.is_empty() {
            for pref in &self.preferences {
                let exact = self.catalog.models().iter().filter(|m| *m == pref);
                let partial = self
                    .catalog
                    .models()
                    .iter()
                    .filter(|m| *m != pref && m.contains(pref.as_str()));
                for model in exact.chain(partial) {
                    if !targets.contains(model) {
                        targets.push(model.clone());
                    }
                }
            }
        }
        if targets.is_empty() {
            targets = self.preferences.clone();
        }
        targets.truncate(MAX_ATTEMPTS);
        targets
    }
}

/// Result of one request against one model.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Response parsed into events (possibly none).
    Parsed(Vec<CandidateEvent>),
    /// The model answered without any text.
    NoContent,
    /// Transport failure or non-success status.
    Rejected(ApiError),
    /// Text came back but was not the expected JSON.
    Malformed(serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    events: Vec<CandidateEvent>,
}

/// Build the fixed extraction prompt for one text.
pub fn build_prompt(text: &str, context: SourceContext<'_>) -> String {
    format!(
        r#"You are an event scout for {city}.
Read the following website text from "{id}" (default category: {category}) and extract upcoming events.

Return a JSON object with an "events" array.
Each event must have:
- title: String (clean title)
- date: String (YYYY-MM-DD or "Upcoming")
- time: String (e.g. "8:00 PM"), omit if unknown
- location: String (specific venue name, never just "{city}")
- category: String (e.g. "Fiesta", "Cultura", "Familia", "Deportes", "General")
- description: String (short summary, max 100 chars)
- link: String (source URL if available)

If it's a login page, an error page, or purely generic info, return {{"events": []}}.
Extract ALL upcoming events you find on the page.

Text Snippet:
{text}
"#,
        city = context.city,
        id = context.id,
        category = context.category,
        text = excerpt(text, MAX_EXCERPT_CHARS),
    )
}

/// Build the city-wide prompt for a search-grounded request.
pub fn build_search_prompt(city: &str) -> String {
    format!(
        r#"Give a full list of parties, concerts, live music at bars, cultural and family events in {city} for the next 30 days.
Check all available sources and focus on {city}.

Return a JSON object with an "events" array.
Each event must have:
- title: String (in Spanish)
- date: String (YYYY-MM-DD or "Upcoming")
- time: String (e.g. "8:00 PM")
- location: String (specific venue name, never just "{city}" or the state)
- category: One of ["Deportes", "Cultura", "Familia", "Fiesta", "General"]
- description: String (max 100 chars, in Spanish, mention the venue if known)
- link: String (source URL if available)
"#
    )
}

/// Parse a model response into candidate events.
///
/// Code fences are stripped first. If the remaining text is not JSON, the
/// outermost `{...}` span is tried before giving up.
pub fn parse_events(raw: &str) -> Result<Vec<CandidateEvent>, serde_json::Error> {
    let cleaned = strip_code_fences(raw);
    let parsed = match serde_json::from_str::<ExtractionResponse>(&cleaned) {
        Ok(parsed) => parsed,
        Err(e) => match (cleaned.find('{'), cleaned.rfind('}')) {
            (Some(start), Some(end)) if start < end && (start > 0 || end + 1 < cleaned.len()) => {
                serde_json::from_str::<ExtractionResponse>(&cleaned[start..=end])?
            }
            _ => return Err(e),
        },
    };
    Ok(parsed.events)
}

/// Drop untitled candidates and repeats of the same dedup key.
fn titled_unique(events: Vec<CandidateEvent>) -> Vec<CandidateEvent> {
    events
        .into_iter()
        .filter(|e| e.title.as_deref().is_some_and(|t| !t.trim().is_empty()))
        .unique_by(|e| e.dedup_key())
        .collect()
}

/// The extraction engine.
pub struct Extractor<B> {
    backend: B,
    strategy: ModelStrategy,
}

impl<B: GenerativeBackend> Extractor<B> {
    pub fn new(backend: B, strategy: ModelStrategy) -> Self {
        Self { backend, strategy }
    }

    pub fn strategy(&self) -> &ModelStrategy {
        &self.strategy
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    /// Extract candidate events from `text`.
    ///
    /// # Arguments
    ///
    /// * `text` - Page or document text; at most [`MAX_EXCERPT_CHARS`] of it reach the prompt
    /// * `context` - Source id, city and default category named in the prompt
    ///
    /// # Returns
    ///
    /// Titled candidates without repeated dedup keys. The list is empty,
    /// without any request, when the text is shorter than [`MIN_TEXT_LEN`],
    /// and empty when every target model fails.
    #[instrument(level = "info", skip_all, fields(source = %context.id, chars = text.chars().count()))]
    pub async fn extract(&self, text: &str, context: SourceContext<'_>) -> Vec<CandidateEvent> {
        if text.trim().chars().count() < MIN_TEXT_LEN {
            debug!("Text below minimum length; skipping model call");
            return Vec::new();
        }

        let prompt = build_prompt(text, context);
        let targets = self.strategy.targets();
        info!(models = %targets.join(", "), "Attempting extraction");

        for model in &targets {
            match self.attempt(model, &prompt, false).await {
                AttemptOutcome::Parsed(events) => {
                    let before = events.len();
                    let events = titled_unique(events);
                    info!(%model, returned = before, kept = events.len(), "Extraction succeeded");
                    return events;
                }
                AttemptOutcome::NoContent => {
                    warn!(%model, "Model returned no content");
                    return Vec::new();
                }
                AttemptOutcome::Rejected(ApiError::MissingCredentials) => {
                    error!("Missing API key; extraction disabled");
                    return Vec::new();
                }
                AttemptOutcome::Rejected(e) => {
                    warn!(%model, error = %e, "Model request failed; trying next model");
                }
                AttemptOutcome::Malformed(e) => {
                    warn!(
                        %model,
                        error = %e,
                        truncated = looks_truncated(&e),
                        "Model returned non-conforming JSON; trying next model"
                    );
                }
            }
        }

        error!(attempted = targets.len(), "All models failed");
        Vec::new()
    }

    /// Ask `model` for events in `city` with web search grounding.
    ///
    /// One request, no fallback. Every failure yields an empty list.
    #[instrument(level = "info", skip_all, fields(%model, %city))]
    pub async fn search(&self, model: &str, city: &str) -> Vec<CandidateEvent> {
        match self.attempt(model, &build_search_prompt(city), true).await {
            AttemptOutcome::Parsed(events) => {
                let before = events.len();
                let events = titled_unique(events);
                info!(returned = before, kept = events.len(), "Grounded search succeeded");
                events
            }
            AttemptOutcome::NoContent => {
                warn!("Grounded search returned no content");
                Vec::new()
            }
            AttemptOutcome::Rejected(e) => {
                warn!(error = %e, "Grounded search request failed");
                Vec::new()
            }
            AttemptOutcome::Malformed(e) => {
                warn!(
                    error = %e,
                    truncated = looks_truncated(&e),
                    "Grounded search returned non-conforming JSON"
                );
                Vec::new()
            }
        }
    }

    async fn attempt(&self, model: &str, prompt: &str, grounded: bool) -> AttemptOutcome {
        let reply = if grounded {
            self.backend.generate_grounded(model, prompt).await
        } else {
            self.backend.generate(model, prompt).await
        };
        match reply {
            Ok(Some(raw)) => match parse_events(&raw) {
                Ok(events) => AttemptOutcome::Parsed(events),
                Err(e) => {
                    debug!(%model, preview = %truncate_for_log(&raw, 300), "Unparseable response");
                    AttemptOutcome::Malformed(e)
                }
            },
            Ok(None) => AttemptOutcome::NoContent,
            Err(e) => AttemptOutcome::Rejected(e),
        }
    }
}
