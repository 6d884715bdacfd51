//! Command-line interface definitions for Event Scout.
//!
//! All options can be given as flags or environment variables; a `.env` file
//! in the working directory is loaded before parsing.

use chrono::{FixedOffset, Offset, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::DEFAULT_BASE_URL;
use crate::scheduler::{DEFAULT_SCAN_HOUR, DEFAULT_UTC_OFFSET_HOURS, ScheduleSettings};
use crate::store::{DEFAULT_VENUE_PLACEHOLDER, VenueRule};
use crate::weather::DEFAULT_WEATHER_URL;

/// Command-line arguments for the Event Scout server.
///
/// # Examples
///
/// ```sh
/// # Serve on the default port with the built-in source list
/// GEMINI_API_KEY=... event_scout
///
/// # Custom sources, scan right away, prefer one model
/// event_scout --sources ./sources.yaml --scan-on-start --model gemini-2.5-flash
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Port for the HTTP server
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Path of the JSON cache file
    #[arg(short, long, env = "CACHE_FILE", default_value = "events_db.json")]
    pub cache_file: PathBuf,

    /// YAML source registry (defaults to the built-in list)
    #[arg(short, long, env = "SOURCES_FILE")]
    pub sources: Option<PathBuf>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Base URL of the Gemini REST API
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub gemini_base_url: String,

    /// Model to try, in preference order (repeatable)
    #[arg(long = "model", value_name = "MODEL")]
    pub models: Vec<String>,

    /// Model for a search-grounded pass before the sources (disabled if unset)
    #[arg(long, env = "SEARCH_MODEL", value_name = "MODEL")]
    pub search_model: Option<String>,

    /// Daily forecast endpoint
    #[arg(long, env = "WEATHER_URL", default_value = DEFAULT_WEATHER_URL)]
    pub weather_url: String,

    /// Hour of day (0-23) of the scheduled scan
    #[arg(long, default_value_t = DEFAULT_SCAN_HOUR, value_parser = clap::value_parser!(u32).range(0..24))]
    pub scan_hour: u32,

    /// UTC offset in hours for the scan schedule and event dates
    #[arg(
        long,
        default_value_t = DEFAULT_UTC_OFFSET_HOURS,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i32).range(-12..=14)
    )]
    pub utc_offset_hours: i32,

    /// Text file ingested once at startup, then renamed to `<name>.processed`
    #[arg(long, env = "KNOWLEDGE_BASE_FILE", default_value = "knowledge_base.txt")]
    pub knowledge_base: PathBuf,

    /// Venue name used when the model gives no usable location
    #[arg(long, default_value = DEFAULT_VENUE_PLACEHOLDER)]
    pub venue_placeholder: String,

    /// Location rejected as a venue name, besides the source city (repeatable)
    #[arg(long = "reject-venue", value_name = "NAME", default_value = "Sonora")]
    pub reject_venues: Vec<String>,

    /// Timeout for loading one source page, in seconds
    #[arg(long, default_value_t = 20)]
    pub page_timeout_secs: u64,

    /// Timeout for one model request, in seconds
    #[arg(long, default_value_t = 60)]
    pub ai_timeout_secs: u64,

    /// Run a scan right after startup
    #[arg(long)]
    pub scan_on_start: bool,
}

impl Cli {
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn venue_rule(&self) -> VenueRule {
        VenueRule::new(self.venue_placeholder.clone(), self.reject_venues.clone())
    }

    pub fn schedule(&self) -> ScheduleSettings {
        ScheduleSettings {
            target_hour: self.scan_hour,
            offset: self.utc_offset(),
            ..Default::default()
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }
}
