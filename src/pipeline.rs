//! One scan, end to end.
//!
//! [`ScanPipeline`] refreshes the forecast, optionally runs one grounded
//! search for the whole city, then visits every source in registry order:
//! fetch the page, extract candidates, merge and persist.
//! Progress is reported as log frames; a failing source is reported and
//! skipped. Pruning, rescheduling and the final result frame are handled by
//! the [`Scheduler`](crate::scheduler::Scheduler) once the scan returns.
//!
//! Startup helpers for model discovery and knowledge-base ingestion live here
//! too, since they drive the same extractor and store.

use async_trait::async_trait;
use chrono::Utc;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::api::{ApiError, GenerativeBackend};
use crate::broadcast::Broadcaster;
use crate::extract::{Extractor, ModelCatalog, SourceContext};
use crate::models::{DEFAULT_CATEGORY, FetchMode, LogLevel, SourceDescriptor};
use crate::scheduler::{ScanError, ScanJob, ScanSummary};
use crate::scrapers::{PageFetcher, SourceRegistry};
use crate::store::StoreHandle;
use crate::weather::ForecastProvider;

/// Source id recorded for events ingested from the knowledge-base file.
pub const KNOWLEDGE_BASE_ID: &str = "knowledge_base_doc";

/// Source id recorded for events found by grounded search.
pub const SEARCH_GROUNDING_ID: &str = "search_grounding";

pub struct ScanPipeline<B> {
    registry: SourceRegistry,
    fetcher: Box<dyn PageFetcher>,
    extractor: Extractor<B>,
    weather: Box<dyn ForecastProvider>,
    store: StoreHandle,
    broadcaster: Broadcaster,
    search_model: Option<String>,
}

impl<B: GenerativeBackend> ScanPipeline<B> {
    pub fn new(
        registry: SourceRegistry,
        fetcher: Box<dyn PageFetcher>,
        extractor: Extractor<B>,
        weather: Box<dyn ForecastProvider>,
        store: StoreHandle,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            registry,
            fetcher,
            extractor,
            weather,
            store,
            broadcaster,
            search_model: None,
        }
    }

    /// Run a grounded search with `model` before visiting the sources.
    pub fn with_grounded_search(mut self, model: Option<String>) -> Self {
        self.search_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    fn log(&self, message: impl Into<String>, level: LogLevel, progress: Option<u8>) {
        self.broadcaster.log(&self.store, message, level, progress);
    }

    /// Ask the search model for events in `city` and merge them.
    async fn grounded_search(&self, model: &str, city: &str) -> (usize, usize) {
        self.log(
            format!("Attempting search grounding with {model}..."),
            LogLevel::Info,
            Some(5),
        );
        let candidates = self.extractor.search(model, city).await;
        if candidates.is_empty() {
            self.log(
                "Search grounding found nothing; continuing with sources",
                LogLevel::Warn,
                Some(5),
            );
            return (0, 0);
        }

        let source = SourceDescriptor {
            id: SEARCH_GROUNDING_ID.to_string(),
            city: city.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            url: String::new(),
            mode: FetchMode::Text,
        };
        let found = candidates.len();
        let added = self
            .store
            .merge_and_save(candidates, &source, Utc::now())
            .await;
        self.log(
            format!("Search grounding: {found} candidates, {added} new"),
            LogLevel::Success,
            Some(5),
        );
        (found, added)
    }

    /// Visit one source and return `(candidates, added)`.
    #[instrument(level = "info", skip_all, fields(source = %source.id))]
    async fn scan_source(&self, source: &SourceDescriptor, progress: u8) -> (usize, usize) {
        let text = match self.fetcher.fetch(source).await {
            Ok(text) if text.trim().is_empty() => {
                self.log(
                    format!("No text extracted from {}", source.id),
                    LogLevel::Warn,
                    Some(progress),
                );
                return (0, 0);
            }
            Ok(text) => text,
            Err(e) => {
                self.log(
                    format!("Could not load {}: {e}", source.id),
                    LogLevel::Warn,
                    Some(progress),
                );
                return (0, 0);
            }
        };

        let candidates = self.extractor.extract(&text, source.into()).await;
        drop(text);
        if candidates.is_empty() {
            self.log(
                format!("No events found on {}", source.id),
                LogLevel::Info,
                Some(progress),
            );
            return (0, 0);
        }

        let found = candidates.len();
        let added = self
            .store
            .merge_and_save(candidates, source, Utc::now())
            .await;
        self.log(
            format!("{}: {found} candidates, {added} new", source.id),
            LogLevel::Success,
            Some(progress),
        );
        (found, added)
    }
}

#[async_trait]
impl<B: GenerativeBackend> ScanJob for ScanPipeline<B> {
    async fn run(&self) -> Result<ScanSummary, ScanError> {
        if self.registry.is_empty() {
            return Err("no sources configured".into());
        }
        let t0 = Instant::now();
        self.store.update(|s| s.clear_logs());

        self.log("Fetching weather forecast...", LogLevel::Info, Some(0));
        refresh_weather(&*self.weather, &self.store).await;

        let city = self.registry.primary_city().unwrap_or_default();
        let total_sources = self.registry.len();
        self.log(
            format!("Starting scan of {total_sources} sources for {city}"),
            LogLevel::Info,
            Some(5),
        );

        let mut summary = ScanSummary {
            sources: total_sources,
            ..Default::default()
        };
        if let Some(model) = &self.search_model {
            let (found, added) = self.grounded_search(model, city).await;
            summary.candidates += found;
            summary.added += added;
        }
        for (i, source) in self.registry.sources().iter().enumerate() {
            let progress = (5 + i * 90 / total_sources) as u8;
            self.log(
                format!("Visiting {} ({}/{total_sources})", source.id, i + 1),
                LogLevel::Info,
                Some(progress),
            );
            let (found, added) = self.scan_source(source, progress).await;
            summary.candidates += found;
            summary.added += added;
        }

        summary.total = self.store.read(|s| s.events().len());
        if summary.candidates > 0 {
            self.log(
                format!(
                    "Scan complete. Found {} candidates, added {} new. Total: {}.",
                    summary.candidates, summary.added, summary.total
                ),
                LogLevel::Success,
                Some(100),
            );
        } else {
            self.log("Scan finished. No new events found.", LogLevel::Warn, Some(100));
        }
        info!(elapsed_ms = t0.elapsed().as_millis() as u64, "Pipeline done");
        Ok(summary)
    }
}

/// Replace the cached forecast if the provider returns a non-empty one.
pub async fn refresh_weather(provider: &dyn ForecastProvider, store: &StoreHandle) -> bool {
    match provider.forecast().await {
        Ok(entries) if !entries.is_empty() => {
            store.update(|s| s.set_weather(entries));
            true
        }
        Ok(_) => {
            warn!("Forecast was empty; keeping previous weather");
            false
        }
        Err(e) => {
            warn!(error = %e, "Weather fetch failed; keeping previous weather");
            false
        }
    }
}

/// List the provider's models and keep the ones usable for extraction.
#[instrument(level = "info", skip_all)]
pub async fn discover_models<B: GenerativeBackend>(backend: &B) -> ModelCatalog {
    match backend.list_models().await {
        Ok(listing) => {
            let catalog = ModelCatalog::from_listing(&listing);
            if catalog.is_empty() {
                error!(listed = listing.len(), "Key valid but no generation models found");
            } else {
                info!(
                    count = catalog.len(),
                    models = %catalog.models().join(", "),
                    "Discovered models"
                );
            }
            catalog
        }
        Err(ApiError::MissingCredentials) => {
            warn!("No API key configured; skipping model discovery");
            ModelCatalog::default()
        }
        Err(e) => {
            error!(error = %e, "Model discovery failed; using static preference order");
            ModelCatalog::default()
        }
    }
}

fn processed_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".processed");
    PathBuf::from(name)
}

/// Extract events from a local text file once.
///
/// After events have been merged the file is renamed to `<name>.processed`.
/// Returns the number of records added.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ingest_knowledge_base<B: GenerativeBackend>(
    path: &Path,
    extractor: &Extractor<B>,
    store: &StoreHandle,
    city: &str,
) -> usize {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            error!(error = %e, "Failed to read knowledge base");
            return 0;
        }
    };
    info!(chars = text.chars().count(), "Ingesting knowledge base");

    let source = SourceDescriptor {
        id: KNOWLEDGE_BASE_ID.to_string(),
        city: city.to_string(),
        category: DEFAULT_CATEGORY.to_string(),
        url: String::new(),
        mode: FetchMode::Text,
    };
    let candidates = extractor.extract(&text, SourceContext::from(&source)).await;
    if candidates.is_empty() {
        warn!("No events extracted from knowledge base; leaving file in place");
        return 0;
    }

    let found = candidates.len();
    let added = store.merge_and_save(candidates, &source, Utc::now()).await;
    let done = processed_path(path);
    if let Err(e) = tokio::fs::rename(path, &done).await {
        error!(error = %e, "Failed to mark knowledge base as processed");
    }
    info!(found, added, "Knowledge base ingested");
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ModelStrategy;
    use crate::extract::tests::ScriptedBackend;
    use crate::models::{Frame, WeatherEntry};
    use crate::scheduler::{ScanGate, ScheduleSettings, Scheduler, TriggerOutcome};
    use crate::scrapers::FetchError;
    use crate::store::tests::{candidate, offset};
    use crate::store::{EventStore, VenueRule};
    use chrono::TimeZone;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const EVENTS_JSON: &str = r#"```json
{"events": [
  {"title": "Jazz Night", "date": "2099-02-01", "time": "9:00 PM", "location": "Parque La Ruina", "category": "Fiesta"},
  {"title": "Feria del Pitic", "date": "Upcoming", "location": "Hermosillo"}
]}
```"#;

    struct StubFetcher {
        pages: HashMap<String, Result<String, u16>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, source: &SourceDescriptor) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(&source.id) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(FetchError::Status(*status)),
                None => Ok(String::new()),
            }
        }
    }

    struct StubWeather(Option<Vec<WeatherEntry>>);

    #[async_trait]
    impl ForecastProvider for StubWeather {
        async fn forecast(&self) -> Result<Vec<WeatherEntry>, ApiError> {
            self.0.clone().ok_or(ApiError::Status {
                status: 500,
                body: "down".to_string(),
            })
        }
    }

    fn descriptor(id: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: id.to_string(),
            city: "Hermosillo".to_string(),
            category: "General".to_string(),
            url: format!("https://example.com/{id}"),
            mode: FetchMode::Text,
        }
    }

    fn extractor(reply: Option<&str>) -> Extractor<ScriptedBackend> {
        Extractor::new(
            ScriptedBackend::with(vec![("test-model", Ok(reply))]),
            ModelStrategy::new(vec!["test-model".to_string()], ModelCatalog::default()),
        )
    }

    fn long_page() -> String {
        "Sábado: Jazz Night en Parque La Ruina a las 9 PM, entrada libre. ".repeat(3)
    }

    fn forecast() -> Vec<WeatherEntry> {
        vec![WeatherEntry {
            date: "2026-01-15".to_string(),
            min: 9,
            max: 24,
        }]
    }

    fn pipeline(
        pages: Vec<(&str, Result<String, u16>)>,
        reply: Option<&str>,
        weather: Option<Vec<WeatherEntry>>,
        store: StoreHandle,
        broadcaster: Broadcaster,
    ) -> (ScanPipeline<ScriptedBackend>, Arc<AtomicUsize>) {
        let registry =
            SourceRegistry::new(pages.iter().map(|(id, _)| descriptor(id)).collect()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = StubFetcher {
            pages: pages
                .into_iter()
                .map(|(id, page)| (id.to_string(), page))
                .collect(),
            calls: Arc::clone(&calls),
        };
        let pipeline = ScanPipeline::new(
            registry,
            Box::new(fetcher),
            extractor(reply),
            Box::new(StubWeather(weather)),
            store,
            broadcaster,
        );
        (pipeline, calls)
    }

    fn empty_store(dir: &Path) -> StoreHandle {
        StoreHandle::new(
            EventStore::new(VenueRule::default(), offset()),
            dir.join("events_db.json"),
        )
    }

    #[tokio::test]
    async fn test_failing_source_does_not_abort_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let store = empty_store(tmp.path());
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe_with(Vec::new);
        let (pipeline, calls) = pipeline(
            vec![("blocked", Err(403)), ("agenda", Ok(long_page()))],
            Some(EVENTS_JSON),
            Some(forecast()),
            store.clone(),
            broadcaster.clone(),
        );

        let summary = pipeline.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            summary,
            ScanSummary {
                sources: 2,
                candidates: 2,
                added: 2,
                total: 2,
            }
        );
        store.read(|s| {
            assert_eq!(s.snapshot().weather, forecast());
            assert_eq!(s.events()[0].venue.name, "Parque La Ruina");
            assert_eq!(s.events()[1].venue.name, "Ubicación por definir");
        });

        let mut messages = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await
        {
            if let Frame::Log(log) = frame {
                messages.push((log.message, log.level, log.progress));
            }
        }
        assert!(messages.iter().any(|(m, l, _)| m.contains("Could not load blocked") && *l == LogLevel::Warn));
        let last = messages.last().unwrap();
        assert_eq!(last.1, LogLevel::Success);
        assert_eq!(last.2, Some(100));
        let progress: Vec<u8> = messages.iter().filter_map(|m| m.2).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        // Logs of the scan are also kept for late status requests.
        assert_eq!(store.read(|s| s.logs().len()), messages.len());
    }

    #[tokio::test]
    async fn test_short_page_makes_no_model_call() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(
            vec![("thin", Ok("Log in".to_string()))],
            Some(EVENTS_JSON),
            None,
            empty_store(tmp.path()),
            Broadcaster::new(),
        );

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.candidates, 0);
        assert_eq!(pipeline.extractor_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_weather_keeps_previous_forecast() {
        let tmp = tempfile::tempdir().unwrap();
        let store = empty_store(tmp.path());
        store.update(|s| s.set_weather(forecast()));

        assert!(!refresh_weather(&StubWeather(None), &store).await);
        assert!(!refresh_weather(&StubWeather(Some(Vec::new())), &store).await);
        assert_eq!(store.read(|s| s.snapshot().weather), forecast());
    }

    #[tokio::test]
    async fn test_scan_with_no_candidates_prunes_and_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let store = empty_store(tmp.path());
        store.update(|s| {
            s.merge(
                vec![
                    candidate("Old Expo", Some("2020-01-01")),
                    candidate("Future Fest", Some("2099-12-31")),
                ],
                &descriptor("seed"),
                Utc.with_ymd_and_hms(2019, 12, 1, 0, 0, 0).unwrap(),
            )
        });
        let broadcaster = Broadcaster::new();
        let (pipeline, _) = pipeline(
            vec![("agenda", Ok(long_page()))],
            Some(r#"{"events": []}"#),
            None,
            store.clone(),
            broadcaster.clone(),
        );
        let scheduler = Scheduler::new(
            pipeline,
            ScanGate::default(),
            store.clone(),
            broadcaster,
            ScheduleSettings::default(),
        );

        let outcome = scheduler.trigger().await;

        assert!(matches!(outcome, TriggerOutcome::Completed(s) if s.candidates == 0));
        let raw = std::fs::read_to_string(tmp.path().join("events_db.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let titles: Vec<&str> = json["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["Future Fest"]);
        assert!(json["nextScan"].is_i64());
    }

    #[tokio::test]
    async fn test_grounded_search_runs_before_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let store = empty_store(tmp.path());
        let (pipeline, calls) = pipeline(
            vec![("quiet", Ok(String::new()))],
            Some(EVENTS_JSON),
            None,
            store.clone(),
            Broadcaster::new(),
        );
        let pipeline = pipeline.with_grounded_search(Some("test-model".to_string()));

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.added, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *pipeline.extractor.backend().grounded_models.lock().unwrap(),
            vec!["test-model"]
        );
        store.read(|s| {
            assert_eq!(s.events().len(), 2);
            assert!(s.events().iter().all(|e| e.venue.city == "Hermosillo"));
        });
        assert!(tmp.path().join("events_db.json").exists());
    }

    #[tokio::test]
    async fn test_failed_grounded_search_falls_through_to_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let store = empty_store(tmp.path());
        let (pipeline, _) = pipeline(
            vec![("agenda", Ok(long_page()))],
            Some(EVENTS_JSON),
            None,
            store.clone(),
            Broadcaster::new(),
        );
        let pipeline = pipeline.with_grounded_search(Some("unavailable-model".to_string()));

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(pipeline.extractor_calls(), 2);
        assert!(store.read(|s| {
            s.logs()
                .iter()
                .any(|l| l.message.contains("Search grounding found nothing"))
        }));
    }

    #[tokio::test]
    async fn test_blank_search_model_disables_grounding() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(
            vec![("agenda", Ok(long_page()))],
            Some(EVENTS_JSON),
            None,
            empty_store(tmp.path()),
            Broadcaster::new(),
        );
        let pipeline = pipeline.with_grounded_search(Some("  ".to_string()));

        pipeline.run().await.unwrap();

        assert!(pipeline.extractor.backend().grounded_models.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_fails_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(Vec::new(), None, None, empty_store(tmp.path()), Broadcaster::new());
        assert!(pipeline.run().await.is_err());
    }

    #[tokio::test]
    async fn test_knowledge_base_is_ingested_once() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = tmp.path().join("knowledge_base.txt");
        std::fs::write(&kb, long_page()).unwrap();
        let store = empty_store(tmp.path());
        let extractor = extractor(Some(EVENTS_JSON));

        let added = ingest_knowledge_base(&kb, &extractor, &store, "Hermosillo").await;

        assert_eq!(added, 2);
        assert!(!kb.exists());
        assert!(tmp.path().join("knowledge_base.txt.processed").exists());
        assert!(tmp.path().join("events_db.json").exists());

        assert_eq!(ingest_knowledge_base(&kb, &extractor, &store, "Hermosillo").await, 0);
    }

    #[tokio::test]
    async fn test_knowledge_base_without_events_stays() {
        let tmp = tempfile::tempdir().unwrap();
        let kb = tmp.path().join("knowledge_base.txt");
        std::fs::write(&kb, long_page()).unwrap();

        let added =
            ingest_knowledge_base(&kb, &extractor(None), &empty_store(tmp.path()), "Hermosillo").await;

        assert_eq!(added, 0);
        assert!(kb.exists());
    }

    #[tokio::test]
    async fn test_discover_models_with_empty_listing() {
        let backend = ScriptedBackend::default();
        assert!(discover_models(&backend).await.is_empty());
    }

    impl ScanPipeline<ScriptedBackend> {
        fn extractor_calls(&self) -> usize {
            self.extractor.backend().calls.load(Ordering::SeqCst)
        }
    }
}
