//! Scan scheduler.
//!
//! At most one scan runs at a time. [`ScanGate::try_begin`] is the only way to
//! move from [`ScanState::Idle`] to [`ScanState::Scanning`], and the returned
//! [`ScanGuard`] moves the state back when dropped, whatever happened in
//! between.
//!
//! After every scan, successful or not, the scheduler prunes expired events,
//! schedules the next scan one interval later, persists the cache and sends
//! the result frame to all clients.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeDelta, Utc};
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::broadcast::Broadcaster;
use crate::models::{Frame, LogLevel};
use crate::store::{EventFilter, StoreHandle};

/// Wall-clock hour (in the configured offset) of the daily scan.
pub const DEFAULT_SCAN_HOUR: u32 = 5;

/// Offset used for the daily anchor and for "today" (UTC-7, Hermosillo).
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = -7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning { started_at: DateTime<Utc> },
}

/// Shared scan state with guarded transitions.
#[derive(Debug, Clone)]
pub struct ScanGate {
    state: Arc<Mutex<ScanState>>,
}

impl Default for ScanGate {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScanState::Idle)),
        }
    }
}

impl ScanGate {
    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enter `Scanning` unless a scan is already running.
    pub fn try_begin(&self, now: DateTime<Utc>) -> Option<ScanGuard> {
        let mut state = self.lock();
        match *state {
            ScanState::Scanning { .. } => None,
            ScanState::Idle => {
                *state = ScanState::Scanning { started_at: now };
                Some(ScanGuard {
                    state: Arc::clone(&self.state),
                })
            }
        }
    }

    pub fn state(&self) -> ScanState {
        *self.lock()
    }

    pub fn is_scanning(&self) -> bool {
        self.started_at().is_some()
    }

    /// When the running scan started, if one is running.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self.state() {
            ScanState::Idle => None,
            ScanState::Scanning { started_at } => Some(started_at),
        }
    }
}

/// Proof that the holder owns the running scan. Dropping it returns to `Idle`.
#[derive(Debug)]
pub struct ScanGuard {
    state: Arc<Mutex<ScanState>>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = ScanState::Idle;
    }
}

/// Next occurrence of `hour:00` in `offset`, strictly after `now`.
///
/// If `now` is at or past today's target, tomorrow's target is returned.
///
/// # Arguments
///
/// * `now` - The reference instant
/// * `hour` - Target hour of day (0-23) on the local clock
/// * `offset` - Fixed UTC offset of that local clock
///
/// # Returns
///
/// The target instant in UTC, always within the next 24 hours.
///
/// # Examples
///
/// ```ignore
/// let mst = FixedOffset::west_opt(7 * 3600).unwrap();
/// // 04:59 local: the scan fires one minute later, the same day.
/// let now = Utc.with_ymd_and_hms(2026, 1, 15, 11, 59, 0).unwrap();
/// assert_eq!(compute_next_fire_time(now, 5, mst), Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap());
/// ```
pub fn compute_next_fire_time(now: DateTime<Utc>, hour: u32, offset: FixedOffset) -> DateTime<Utc> {
    let target_time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let local_target = now.with_timezone(&offset).date_naive().and_time(target_time);
    let today = (local_target - TimeDelta::seconds(offset.local_minus_utc().into())).and_utc();
    if now >= today {
        today + TimeDelta::days(1)
    } else {
        today
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub target_hour: u32,
    pub offset: FixedOffset,
    /// Delay between a finished scan and the next one.
    pub interval: TimeDelta,
    /// How long the timer waits before retrying when a scan is already running.
    pub busy_retry: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            target_hour: DEFAULT_SCAN_HOUR,
            offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600)
                .unwrap_or_else(|| Utc.fix()),
            interval: TimeDelta::hours(24),
            busy_retry: Duration::from_secs(30),
        }
    }
}

/// Counts reported by one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub sources: usize,
    pub candidates: usize,
    pub added: usize,
    pub total: usize,
}

pub type ScanError = Box<dyn Error + Send + Sync>;

/// One full scan.
#[async_trait]
pub trait ScanJob: Send + Sync {
    async fn run(&self) -> Result<ScanSummary, ScanError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(ScanSummary),
    Failed,
    AlreadyRunning,
}

pub struct Scheduler<J> {
    job: Arc<J>,
    gate: ScanGate,
    store: StoreHandle,
    broadcaster: Broadcaster,
    settings: ScheduleSettings,
}

impl<J: ScanJob + 'static> Scheduler<J> {
    pub fn new(
        job: J,
        gate: ScanGate,
        store: StoreHandle,
        broadcaster: Broadcaster,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            job: Arc::new(job),
            gate,
            store,
            broadcaster,
            settings,
        }
    }

    pub fn gate(&self) -> &ScanGate {
        &self.gate
    }

    /// Anchor the next scan to the daily target hour and persist it.
    pub async fn schedule_initial(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = compute_next_fire_time(now, self.settings.target_hour, self.settings.offset);
        self.store.update(|s| s.set_next_scan(next));
        self.store.save_or_log().await;
        info!(next_scan = %next, "Scheduled first scan");
        next
    }

    /// Run a scan now, unless one is already in progress.
    pub async fn trigger(&self) -> TriggerOutcome {
        match self.gate.try_begin(Utc::now()) {
            Some(guard) => self.run_scan(guard).await,
            None => {
                info!(started_at = ?self.gate.started_at(), "Scan already in progress; trigger ignored");
                TriggerOutcome::AlreadyRunning
            }
        }
    }

    /// Start a scan on a background task. Returns `false` if one is running.
    pub fn trigger_in_background(self: &Arc<Self>) -> bool {
        let Some(guard) = self.gate.try_begin(Utc::now()) else {
            info!("Scan already in progress; trigger ignored");
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_scan(guard).await;
        });
        true
    }

    #[instrument(level = "info", skip_all)]
    async fn run_scan(&self, guard: ScanGuard) -> TriggerOutcome {
        let t0 = std::time::Instant::now();
        info!("Scan started");

        // A panicking job surfaces as a JoinError instead of unwinding here.
        let job = Arc::clone(&self.job);
        let result = tokio::spawn(async move { job.run().await }).await;

        let outcome = match result {
            Ok(Ok(summary)) => {
                info!(
                    sources = summary.sources,
                    candidates = summary.candidates,
                    added = summary.added,
                    total = summary.total,
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "Scan finished"
                );
                TriggerOutcome::Completed(summary)
            }
            Ok(Err(e)) => {
                self.report_failure(&e.to_string());
                TriggerOutcome::Failed
            }
            Err(e) => {
                self.report_failure(&e.to_string());
                TriggerOutcome::Failed
            }
        };

        self.finish(Utc::now()).await;
        drop(guard);

        let frame = self.store.read(|s| s.result_frame(&EventFilter::default()));
        let delivered = self.broadcaster.broadcast(Frame::Result(frame));
        info!(clients = delivered, "Sent scan result");
        outcome
    }

    fn report_failure(&self, reason: &str) {
        error!(critical = true, error = %reason, "Scan failed");
        self.broadcaster.log(
            &self.store,
            format!("Scan failed: {reason}"),
            LogLevel::Error,
            Some(100),
        );
    }

    async fn finish(&self, now: DateTime<Utc>) {
        let next = now + self.settings.interval;
        self.store.update(|s| {
            s.cleanup(s.today(now));
            s.set_next_scan(next);
        });
        self.store.save_or_log().await;
        info!(next_scan = %next, "Next scan scheduled");
    }

    /// Timer loop: sleep until the persisted next scan time, then trigger.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let due = self.store.read(|s| s.next_scan()).unwrap_or(now);
            if due > now {
                let wait = (due - now).to_std().unwrap_or_default();
                info!(next_scan = %due, wait_secs = wait.as_secs(), "Waiting for next scan");
                tokio::time::sleep(wait).await;
                continue;
            }
            if self.trigger().await == TriggerOutcome::AlreadyRunning {
                warn!(retry_secs = self.settings.busy_retry.as_secs(), "Timer fired during a scan");
                tokio::time::sleep(self.settings.busy_retry).await;
            }
        }
    }
}
