//! Data models for sources, extracted candidates, persisted events and stream frames.
//!
//! This module defines the core data structures used throughout the application:
//! - [`SourceDescriptor`]: One page or profile visited during a scan
//! - [`CandidateEvent`]: Unvalidated event data returned by the model for one page
//! - [`EventRecord`]: Canonical, deduplicated event owned by the store
//! - [`PersistedSnapshot`]: The on-disk shape of the cache
//! - [`Frame`]: One unit streamed to subscribed clients (`log` or `result`)
//!
//! Field names on the wire use camelCase to match what the presentation layer
//! already consumes, hence the `rename_all` attributes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Date sentinel the model uses for events without a concrete day.
pub const UPCOMING: &str = "Upcoming";

/// Default `time` for records whose candidate carried none.
pub const TIME_TBD: &str = "TBD";

/// Category used when the model did not classify an event.
pub const DEFAULT_CATEGORY: &str = "General";

/// How the fetcher turns a page into text for the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Headings and article-like blocks, falling back to the full body text.
    #[default]
    Text,
    /// Only `<title>` and Open Graph metadata.
    Metadata,
}

/// A source page scanned for event text.
///
/// Descriptors are defined at deploy time (see `sources.yaml`) and never
/// mutated while the process runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceDescriptor {
    /// Unique key, also used as the source name in prompts and logs.
    pub id: String,
    /// City the source reports on. Becomes the venue city of merged records.
    pub city: String,
    /// Default category for the source.
    pub category: String,
    /// Page to fetch.
    pub url: String,
    /// Extraction variant for this page.
    #[serde(default)]
    pub mode: FetchMode,
}

/// Event data as returned by the model for a single page.
///
/// Every field is optional because the model is free to omit or null any of
/// them. Candidates only live for one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CandidateEvent {
    #[serde(default)]
    pub title: Option<String>,
    /// `YYYY-MM-DD` or [`UPCOMING`].
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    /// Venue name as given by the model.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl CandidateEvent {
    /// Identity used to detect the same event across scans.
    pub fn dedup_key(&self) -> String {
        dedup_key(
            self.title.as_deref().unwrap_or_default(),
            self.date.as_deref(),
        )
    }
}

/// Lowercased concatenation of the trimmed title and the date.
pub fn dedup_key(title: &str, date: Option<&str>) -> String {
    format!("{}{}", title.trim(), date.unwrap_or_default()).to_lowercase()
}

/// Where an event takes place.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Venue {
    pub name: String,
    pub city: String,
    pub category: String,
    #[serde(default)]
    pub url: String,
}

/// A canonical event record, owned by the store.
///
/// Records are created once when a candidate is first merged and are never
/// updated afterwards; a later duplicate is discarded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub time: String,
    pub venue: Venue,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub ai_verified: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EventRecord {
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.title, self.date.as_deref())
    }

    pub fn event_date(&self) -> EventDate {
        EventDate::classify(self.date.as_deref())
    }
}

/// Classification of a raw `date` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDate {
    Missing,
    Upcoming,
    Day(NaiveDate),
    Unparseable,
}

impl EventDate {
    /// Classify a raw date as the model or the cache file spells it.
    ///
    /// Accepts plain ISO dates, ISO date-times with or without an offset and
    /// slash-separated ISO dates. Anything else is [`EventDate::Unparseable`].
    pub fn classify(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return EventDate::Missing;
        };
        if raw == UPCOMING {
            return EventDate::Upcoming;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return EventDate::Day(dt.date_naive());
        }
        for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
            if let Ok(day) = NaiveDate::parse_from_str(raw, fmt) {
                return EventDate::Day(day);
            }
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
                return EventDate::Day(dt.date());
            }
        }
        EventDate::Unparseable
    }
}

/// One day of the forecast.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WeatherEntry {
    pub date: String,
    pub min: i32,
    pub max: i32,
}

/// On-disk representation of the cache. Written wholesale on every save.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    #[serde(default)]
    pub events: Vec<EventRecord>,
    #[serde(default)]
    pub weather: Vec<WeatherEntry>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Next scheduled scan, epoch milliseconds.
    #[serde(default)]
    pub next_scan: Option<i64>,
}

/// Severity of a log frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// Progress message streamed while a scan runs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogFrame {
    pub message: String,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Epoch milliseconds.
    pub time: i64,
}

impl LogFrame {
    pub fn new(message: impl Into<String>, level: LogLevel, progress: Option<u8>) -> Self {
        Self {
            message: message.into(),
            level,
            progress,
            time: Utc::now().timestamp_millis(),
        }
    }
}

/// Cache contents pushed to clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFrame {
    pub events: Vec<EventRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<Vec<WeatherEntry>>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scan: Option<i64>,
}

/// One streamed message, serialized as `{"type": "log" | "result", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Log(LogFrame),
    Result(ResultFrame),
}

impl Frame {
    pub fn log(message: impl Into<String>, level: LogLevel) -> Self {
        Frame::Log(LogFrame::new(message, level, None))
    }
}
