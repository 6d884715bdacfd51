//! Merge & persistence store for event records.
//!
//! [`EventStore`] owns the canonical event set together with the rest of the
//! cache: weather, the last scan timestamp, the next scheduled scan and the log
//! buffer of the current or most recent scan. It is plain data; the shared,
//! lock-guarded form used by the server and the scheduler is [`StoreHandle`].
//!
//! # Invariants
//!
//! - No two records share a dedup key (lowercased title + date).
//! - Records are kept in insertion order.
//! - A record is removed only when its date parses and lies before today.
//!
//! # Persistence
//!
//! The snapshot is written wholesale as pretty JSON to a temporary file and
//! renamed over the cache file. A failed write is logged and the in-memory
//! state stays authoritative.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    CandidateEvent, DEFAULT_CATEGORY, EventDate, EventRecord, LogFrame, PersistedSnapshot,
    ResultFrame, SourceDescriptor, TIME_TBD, Venue, WeatherEntry, dedup_key,
};

/// Venue name used when the model gave no usable location.
pub const DEFAULT_VENUE_PLACEHOLDER: &str = "Ubicación por definir";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Validation rule for AI-provided venue names.
///
/// A location that is empty, equal to the source city, or equal to one of the
/// rejected names (all case-insensitive) is replaced with the placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueRule {
    placeholder: String,
    rejected: Vec<String>,
}

impl Default for VenueRule {
    fn default() -> Self {
        Self::new(DEFAULT_VENUE_PLACEHOLDER, Vec::new())
    }
}

impl VenueRule {
    pub fn new(placeholder: impl Into<String>, rejected: Vec<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            rejected: rejected.into_iter().map(|r| r.trim().to_lowercase()).collect(),
        }
    }

    pub fn resolve(&self, location: Option<&str>, city: &str) -> String {
        match location.map(str::trim).filter(|l| !l.is_empty()) {
            Some(name) if !self.is_degenerate(name, city) => name.to_string(),
            _ => self.placeholder.clone(),
        }
    }

    fn is_degenerate(&self, name: &str, city: &str) -> bool {
        let lower = name.to_lowercase();
        lower == city.trim().to_lowercase() || self.rejected.iter().any(|r| *r == lower)
    }
}

/// City/category restriction applied to the snapshot a new client receives.
///
/// A missing value, an empty value or `all` means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &EventRecord) -> bool {
        fn wanted(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty() && *v != "all")
        }
        wanted(&self.city).is_none_or(|c| event.venue.city == c)
            && wanted(&self.category).is_none_or(|c| event.venue.category == c)
    }
}

/// The cache: event records plus scan metadata.
#[derive(Debug)]
pub struct EventStore {
    events: Vec<EventRecord>,
    keys: HashSet<String>,
    weather: Vec<WeatherEntry>,
    timestamp: Option<DateTime<Utc>>,
    next_scan: Option<i64>,
    logs: Vec<LogFrame>,
    venue_rule: VenueRule,
    offset: FixedOffset,
}

impl EventStore {
    /// An empty store. `offset` defines where "today" starts for cleanup.
    pub fn new(venue_rule: VenueRule, offset: FixedOffset) -> Self {
        Self {
            events: Vec::new(),
            keys: HashSet::new(),
            weather: Vec::new(),
            timestamp: None,
            next_scan: None,
            logs: Vec::new(),
            venue_rule,
            offset,
        }
    }

    /// Build a store from a persisted snapshot.
    ///
    /// Records repeating an earlier dedup key are dropped so the invariant
    /// holds even for hand-edited or legacy files.
    pub fn from_snapshot(
        snapshot: PersistedSnapshot,
        venue_rule: VenueRule,
        offset: FixedOffset,
    ) -> Self {
        let mut store = Self::new(venue_rule, offset);
        for event in snapshot.events {
            if store.keys.insert(event.dedup_key()) {
                store.events.push(event);
            } else {
                warn!(title = %event.title, "Dropping duplicate record from cache file");
            }
        }
        store.weather = snapshot.weather;
        store.timestamp = snapshot.timestamp;
        store.next_scan = snapshot.next_scan;
        store
    }

    /// Load the cache file, or start empty if it does not exist.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(
        path: &Path,
        venue_rule: VenueRule,
        offset: FixedOffset,
    ) -> Result<Self, StoreError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No cache file yet; starting empty");
                return Ok(Self::new(venue_rule, offset));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let snapshot: PersistedSnapshot = serde_json::from_str(&raw)?;
        let store = Self::from_snapshot(snapshot, venue_rule, offset);
        info!(events = store.events.len(), "Loaded events from disk");
        Ok(store)
    }

    /// Calendar day in the store's offset that contains `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Merge candidates from one source and return how many records were added.
    ///
    /// Candidates with a present, non-`Upcoming` date that does not parse are
    /// dropped. Candidates whose dedup key (trimmed, lowercased title plus
    /// date) already exists are discarded without touching the existing
    /// record. Afterwards the timestamp is refreshed and
    /// [`EventStore::cleanup`] runs.
    ///
    /// # Arguments
    ///
    /// * `candidates` - Events returned by the model for one source
    /// * `source` - The source they came from; supplies the venue city
    /// * `now` - Scan time, stored as the cache timestamp
    ///
    /// # Returns
    ///
    /// The number of new records. Duplicates and dropped candidates are not counted.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let jazz = candidate("Jazz Night", Some("2026-02-01"));
    /// assert_eq!(store.merge(vec![jazz.clone()], &source, Utc::now()), 1);
    /// assert_eq!(store.merge(vec![jazz], &source, Utc::now()), 0);
    /// ```
    pub fn merge(
        &mut self,
        candidates: Vec<CandidateEvent>,
        source: &SourceDescriptor,
        now: DateTime<Utc>,
    ) -> usize {
        let mut added = 0;
        for candidate in candidates {
            let title = candidate.title.as_deref().map(str::trim).unwrap_or_default();
            if title.is_empty() {
                debug!("Dropping candidate without title");
                continue;
            }
            if EventDate::classify(candidate.date.as_deref()) == EventDate::Unparseable {
                debug!(%title, date = ?candidate.date, "Dropping candidate with malformed date");
                continue;
            }
            let key = dedup_key(title, candidate.date.as_deref());
            if self.keys.contains(&key) {
                continue;
            }

            let record = self.build_record(candidate, source);
            self.keys.insert(key);
            self.events.push(record);
            added += 1;
        }

        self.timestamp = Some(now);
        self.cleanup(self.today(now));
        added
    }

    fn build_record(&self, candidate: CandidateEvent, source: &SourceDescriptor) -> EventRecord {
        let category = candidate
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let link = candidate.link.unwrap_or_default();
        EventRecord {
            id: format!("gen_{}", Uuid::new_v4().simple()),
            title: candidate.title.unwrap_or_default().trim().to_string(),
            date: candidate.date,
            time: candidate
                .time
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| TIME_TBD.to_string()),
            venue: Venue {
                name: self.venue_rule.resolve(candidate.location.as_deref(), &source.city),
                city: source.city.clone(),
                category: category.clone(),
                url: link.clone(),
            },
            description: candidate.description.unwrap_or_default(),
            link,
            ai_verified: true,
            tags: vec![category],
        }
    }

    /// Remove records dated before `today`; returns how many were removed.
    ///
    /// Records with a missing, unparseable or `Upcoming` date are kept.
    pub fn cleanup(&mut self, today: NaiveDate) -> usize {
        let before = self.events.len();
        self.events.retain(|event| match event.event_date() {
            EventDate::Day(day) => day >= today,
            EventDate::Missing | EventDate::Upcoming | EventDate::Unparseable => true,
        });
        let removed = before - self.events.len();
        if removed > 0 {
            self.keys = self.events.iter().map(EventRecord::dedup_key).collect();
            info!(removed, "Cleaned up expired events");
        }
        removed
    }

    /// Persistable state.
    pub fn snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            events: self.events.clone(),
            weather: self.weather.clone(),
            timestamp: self.timestamp,
            next_scan: self.next_scan,
        }
    }

    /// Result frame for a client, restricted by `filter`.
    pub fn result_frame(&self, filter: &EventFilter) -> ResultFrame {
        ResultFrame {
            events: self
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
            weather: Some(self.weather.clone()),
            timestamp: self.timestamp,
            next_scan: self.next_scan,
        }
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn set_weather(&mut self, weather: Vec<WeatherEntry>) {
        self.weather = weather;
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn next_scan(&self) -> Option<DateTime<Utc>> {
        self.next_scan.and_then(DateTime::from_timestamp_millis)
    }

    pub fn set_next_scan(&mut self, at: DateTime<Utc>) {
        self.next_scan = Some(at.timestamp_millis());
    }

    pub fn logs(&self) -> &[LogFrame] {
        &self.logs
    }

    pub fn push_log(&mut self, frame: LogFrame) {
        self.logs.push(frame);
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }
}

/// Shared handle to the single [`EventStore`].
///
/// The state lock is only held for synchronous sections and never across an
/// `.await`. File writes are serialized by a separate async lock so the last
/// writer always persists the latest state.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    state: Arc<Mutex<EventStore>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    path: PathBuf,
}

impl StoreHandle {
    pub fn new(store: EventStore, path: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(store)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            path: path.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventStore> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&EventStore) -> R) -> R {
        f(&self.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut EventStore) -> R) -> R {
        f(&mut self.lock())
    }

    /// Write the current snapshot to the cache file.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn save(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.read(EventStore::snapshot);
        let json = serde_json::to_string_pretty(&snapshot)?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        info!(events = snapshot.events.len(), "Saved events to disk");
        Ok(())
    }

    /// [`StoreHandle::save`], logging instead of returning the failure.
    pub async fn save_or_log(&self) -> bool {
        match self.save().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to save cache; keeping in-memory state");
                false
            }
        }
    }

    /// Merge one source's candidates and persist the result.
    pub async fn merge_and_save(
        &self,
        candidates: Vec<CandidateEvent>,
        source: &SourceDescriptor,
        now: DateTime<Utc>,
    ) -> usize {
        let added = self.update(|store| store.merge(candidates, source, now));
        self.save_or_log().await;
        added
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn offset() -> FixedOffset {
        FixedOffset::west_opt(7 * 3600).unwrap()
    }

    pub(crate) fn source() -> SourceDescriptor {
        SourceDescriptor {
            id: "parque_la_ruina".to_string(),
            city: "Hermosillo".to_string(),
            category: "General".to_string(),
            url: "https://www.facebook.com/ParqueLaRuinaHMO".to_string(),
            mode: Default::default(),
        }
    }

    pub(crate) fn candidate(title: &str, date: Option<&str>) -> CandidateEvent {
        CandidateEvent {
            title: Some(title.to_string()),
            date: date.map(str::to_string),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap()
    }

    fn store() -> EventStore {
        EventStore::new(VenueRule::default(), offset())
    }

    #[test]
    fn test_merge_same_candidate_twice() {
        let mut store = store();
        let jazz = candidate("Jazz Night", Some("2026-02-01"));

        assert_eq!(store.merge(vec![jazz.clone()], &source(), now()), 1);
        assert_eq!(store.merge(vec![jazz], &source(), now()), 0);
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_duplicate_keeps_first_record_untouched() {
        let mut store = store();
        let mut first = candidate("Jazz Night", Some("2026-02-01"));
        first.description = Some("original".to_string());
        let mut second = candidate("JAZZ night", Some("2026-02-01"));
        second.description = Some("updated".to_string());

        store.merge(vec![first, second], &source(), now());

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].description, "original");
        assert_eq!(store.events()[0].title, "Jazz Night");
    }

    #[test]
    fn test_malformed_date_is_dropped() {
        let mut store = store();
        let added = store.merge(vec![candidate("X", Some("not-a-date"))], &source(), now());
        assert_eq!(added, 0);
        assert!(store.events().is_empty());
    }

    #[test]
    fn test_missing_and_upcoming_dates_are_accepted() {
        let mut store = store();
        let added = store.merge(
            vec![candidate("Feria", None), candidate("Expo", Some("Upcoming"))],
            &source(),
            now(),
        );
        assert_eq!(added, 2);
    }

    #[test]
    fn test_record_defaults() {
        let mut store = store();
        store.merge(vec![candidate("Jazz Night", Some("2026-02-01"))], &source(), now());
        let record = &store.events()[0];

        assert!(record.id.starts_with("gen_"));
        assert_eq!(record.time, TIME_TBD);
        assert_eq!(record.venue.name, DEFAULT_VENUE_PLACEHOLDER);
        assert_eq!(record.venue.city, "Hermosillo");
        assert_eq!(record.venue.category, DEFAULT_CATEGORY);
        assert_eq!(record.tags, vec![DEFAULT_CATEGORY.to_string()]);
        assert!(record.ai_verified);
        assert_eq!(store.timestamp(), Some(now()));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let mut store = store();
        store.merge(
            vec![candidate("A", Some("2026-02-01")), candidate("B", Some("2026-02-01"))],
            &source(),
            now(),
        );
        assert_ne!(store.events()[0].id, store.events()[1].id);
    }

    #[test]
    fn test_venue_rule() {
        let rule = VenueRule::new("TBD venue", vec!["Sonora".to_string()]);
        assert_eq!(rule.resolve(Some("Parque La Ruina"), "Hermosillo"), "Parque La Ruina");
        assert_eq!(rule.resolve(Some("hermosillo"), "Hermosillo"), "TBD venue");
        assert_eq!(rule.resolve(Some(" SONORA "), "Hermosillo"), "TBD venue");
        assert_eq!(rule.resolve(Some(""), "Hermosillo"), "TBD venue");
        assert_eq!(rule.resolve(None, "Hermosillo"), "TBD venue");
    }

    #[test]
    fn test_cleanup_by_date() {
        let mut store = store();
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let yesterday = (today - Duration::days(1)).format("%Y-%m-%d").to_string();
        let tomorrow = (today + Duration::days(1)).format("%Y-%m-%d").to_string();
        let today_str = today.format("%Y-%m-%d").to_string();

        store.merge(
            vec![
                candidate("Concert", Some(&tomorrow)),
                candidate("Soon", Some(&tomorrow)),
                candidate("Today", Some(&today_str)),
                candidate("Someday", Some("Upcoming")),
            ],
            &source(),
            now(),
        );
        // Inserted directly so merge-time cleanup does not remove it first.
        let mut past = store.events()[0].clone();
        past.title = "Past".to_string();
        past.date = Some(yesterday);
        store.events.push(past);

        let removed = store.cleanup(today);

        assert_eq!(removed, 1);
        let titles: Vec<&str> = store.events().iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Concert", "Soon", "Today", "Someday"]);
    }

    #[test]
    fn test_cleanup_frees_dedup_key() {
        let mut store = store();
        store.merge(vec![candidate("Jazz Night", Some("2026-01-20"))], &source(), now());
        store.cleanup(NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert!(store.events().is_empty());
        assert!(store.keys.is_empty());
    }

    #[test]
    fn test_merge_runs_cleanup_in_offset_today() {
        // 2026-01-16 03:00 UTC is still 2026-01-15 at UTC-7.
        let late = Utc.with_ymd_and_hms(2026, 1, 16, 3, 0, 0).unwrap();
        let mut store = store();
        let added = store.merge(vec![candidate("Tonight", Some("2026-01-15"))], &source(), late);
        assert_eq!(added, 1);
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_keys_unique_across_merges() {
        let mut store = store();
        for _ in 0..3 {
            store.merge(
                vec![
                    candidate("Jazz Night", Some("2026-02-01")),
                    candidate("jazz night", Some("2026-02-01")),
                    candidate("Rock", Some("2026-02-02")),
                ],
                &source(),
                now(),
            );
        }
        let keys: HashSet<String> = store.events().iter().map(EventRecord::dedup_key).collect();
        assert_eq!(keys.len(), store.events().len());
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_padded_title_is_a_duplicate() {
        let mut store = store();
        assert_eq!(
            store.merge(vec![candidate("Jazz Night", Some("2026-02-01"))], &source(), now()),
            1
        );
        assert_eq!(
            store.merge(vec![candidate("  Jazz Night ", Some("2026-02-01"))], &source(), now()),
            0
        );

        assert_eq!(store.events().len(), 1);
        let keys: HashSet<String> = store.events().iter().map(EventRecord::dedup_key).collect();
        assert_eq!(keys.len(), store.events().len());
    }

    #[test]
    fn test_from_snapshot_drops_duplicates() {
        let mut seed = store();
        seed.merge(vec![candidate("Jazz Night", Some("2026-02-01"))], &source(), now());
        let mut snapshot = seed.snapshot();
        snapshot.events.push(snapshot.events[0].clone());

        let store = EventStore::from_snapshot(snapshot, VenueRule::default(), offset());
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_filter() {
        let mut store = store();
        let mut fiesta = candidate("Fiesta", Some("2026-02-01"));
        fiesta.category = Some("Fiesta".to_string());
        store.merge(vec![fiesta, candidate("Expo", Some("2026-02-01"))], &source(), now());

        let all = EventFilter {
            city: Some("all".to_string()),
            category: Some("all".to_string()),
        };
        assert_eq!(store.result_frame(&all).events.len(), 2);

        let only_fiesta = EventFilter {
            city: Some("Hermosillo".to_string()),
            category: Some("Fiesta".to_string()),
        };
        assert_eq!(store.result_frame(&only_fiesta).events.len(), 1);

        let elsewhere = EventFilter {
            city: Some("Guaymas".to_string()),
            category: None,
        };
        assert!(store.result_frame(&elsewhere).events.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events_db.json");

        let mut store = store();
        store.merge(vec![candidate("Jazz Night", Some("2026-02-01"))], &source(), now());
        store.set_weather(vec![WeatherEntry {
            date: "2026-01-15".to_string(),
            min: 9,
            max: 24,
        }]);
        store.set_next_scan(now() + Duration::hours(24));
        let handle = StoreHandle::new(store, &path);
        handle.save().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["events"][0]["title"], "Jazz Night");
        assert_eq!(json["weather"][0]["max"], 24);
        assert!(json["timestamp"].is_string());
        assert!(json["nextScan"].is_i64());

        let loaded = EventStore::load(&path, VenueRule::default(), offset()).await.unwrap();
        assert_eq!(loaded.events().len(), 1);
        assert_eq!(loaded.next_scan(), Some(now() + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::load(&tmp.path().join("nope.json"), VenueRule::default(), offset())
            .await
            .unwrap();
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_keeps_memory_state() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not_a_dir");
        std::fs::write(&blocker, "file").unwrap();
        let handle = StoreHandle::new(store(), blocker.join("events_db.json"));

        let added = handle
            .merge_and_save(vec![candidate("Jazz Night", Some("2026-02-01"))], &source(), now())
            .await;

        assert_eq!(added, 1);
        assert!(!handle.save_or_log().await);
        assert_eq!(handle.read(|s| s.events().len()), 1);
    }
}
