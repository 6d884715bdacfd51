//! # Event Scout
//!
//! A local event discovery service. Once a day it visits a fixed list of
//! source pages, asks a generative model to pull structured events out of
//! each page, merges them into a deduplicated cache and streams progress and
//! results to every connected client over server-sent events.
//!
//! ## Usage
//!
//! ```sh
//! GEMINI_API_KEY=... event_scout --port 3000 --scan-on-start
//! ```
//!
//! ## Architecture
//!
//! 1. **Sources**: an ordered registry of pages (`sources.yaml`)
//! 2. **Fetching**: one isolated request per page, text or metadata extraction
//! 3. **Extraction**: one prompt per page, falling back across models
//! 4. **Merge**: dedup by title + date, prune past events, persist to JSON
//! 5. **Broadcast**: log and result frames to all `/scrape` subscribers

use chrono::Utc;
use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod broadcast;
mod cli;
mod extract;
mod models;
mod pipeline;
mod scheduler;
mod scrapers;
mod server;
mod store;
mod utils;
mod weather;

use api::GeminiClient;
use broadcast::Broadcaster;
use cli::Cli;
use extract::{Extractor, ModelCatalog, ModelStrategy};
use pipeline::{ScanPipeline, discover_models, ingest_knowledge_base, refresh_weather};
use scheduler::{ScanGate, Scheduler};
use scrapers::SourceRegistry;
use scrapers::page::HttpPageFetcher;
use server::AppState;
use store::{EventStore, StoreHandle};
use utils::ensure_writable_dir;
use weather::OpenMeteoClient;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Loaded before tracing so RUST_LOG may come from .env.
    let dotenv = dotenvy::dotenv();

    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "Failed to read .env; continuing with process environment"),
    }

    let start_time = std::time::Instant::now();
    info!(version = env!("CARGO_PKG_VERSION"), "event_scout starting up");

    let args = Cli::parse();
    debug!(?args.cache_file, ?args.sources, port = args.port, "Parsed CLI arguments");

    // Early check: the cache must be writable before any scan runs.
    let cache_dir = args
        .cache_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if let Err(e) = ensure_writable_dir(cache_dir).await {
        error!(
            path = %cache_dir.display(),
            error = %e,
            "Cache directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let registry = match &args.sources {
        Some(path) => SourceRegistry::load(path).await?,
        None => SourceRegistry::builtin()?,
    };
    let city = registry.primary_city().unwrap_or_default().to_string();
    info!(sources = registry.len(), %city, "Source registry ready");

    let store = EventStore::load(&args.cache_file, args.venue_rule(), args.utc_offset()).await?;
    let store = StoreHandle::new(store, &args.cache_file);
    let broadcaster = Broadcaster::new();

    // --- Extraction engine ---
    let client = GeminiClient::new(
        args.gemini_base_url.clone(),
        args.gemini_api_key.clone(),
        args.ai_timeout(),
    )?;
    let catalog = if client.has_credentials() {
        discover_models(&client).await
    } else {
        warn!("GEMINI_API_KEY not set; scans will find no events");
        ModelCatalog::default()
    };
    let extractor = Extractor::new(client, ModelStrategy::new(args.models.clone(), catalog));
    info!(models = %extractor.strategy().targets().join(", "), "Model fallback order");

    // --- Startup refreshes ---
    let weather = OpenMeteoClient::new(args.weather_url.clone(), args.page_timeout())?;
    if refresh_weather(&weather, &store).await {
        store.save_or_log().await;
        info!("Initial weather cached");
    }
    let ingested = ingest_knowledge_base(&args.knowledge_base, &extractor, &store, &city).await;
    if ingested > 0 {
        info!(added = ingested, "Merged knowledge base events");
    }

    // --- Scheduler ---
    let fetcher = HttpPageFetcher::new(args.page_timeout())?;
    let pipeline = ScanPipeline::new(
        registry,
        Box::new(fetcher),
        extractor,
        Box::new(weather),
        store.clone(),
        broadcaster.clone(),
    )
    .with_grounded_search(args.search_model.clone());
    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        ScanGate::default(),
        store.clone(),
        broadcaster.clone(),
        args.schedule(),
    ));
    scheduler.schedule_initial(Utc::now()).await;
    tokio::spawn(Arc::clone(&scheduler).run_forever());
    if args.scan_on_start {
        scheduler.trigger_in_background();
    }

    // --- HTTP ---
    let router = server::build_router(Arc::new(AppState {
        store,
        broadcaster,
        scheduler,
    }));
    server::serve(router, args.port).await?;

    info!(
        uptime_secs = start_time.elapsed().as_secs(),
        "event_scout stopped"
    );
    Ok(())
}
