// ABOUTME: TransferLoop - runs SyncJobs window by window, commits on confirmed delivery
// ABOUTME: Retries failed jobs after a fixed backoff until they succeed or the loop is told to stop

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, TimeZone, Timelike, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::destination::TelemetrySink;
use crate::driver::SensorBinding;
use crate::error::SourceError;
use crate::line_protocol::format_record;
use crate::planner::{SyncJob, SyncPlanner};
use crate::source::{SourceAdapter, SourceRow, TimeRange};
use crate::state::{SyncStateStore, TableKey};

/// Pacing and bounds of the transfer loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Start time of every backfill
    pub far_past: DateTime<Utc>,
    /// Largest time span read by one source query
    pub max_window_days: u32,
    /// An incremental job stops after this many records; the rest follows next pass
    pub max_records_per_job: usize,
    /// A pass in which no job reached this many records counts as caught up
    pub min_records: usize,
    pub retry_backoff_secs: u64,
    /// Sleep after a caught-up pass
    pub idle_sleep_secs: u64,
    /// Local hour of day after which no new jobs are started
    pub cutoff_hour: Option<u32>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            far_past: Utc
                .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            max_window_days: 5,
            max_records_per_job: 50_000,
            min_records: 100,
            retry_backoff_secs: 60,
            idle_sleep_secs: 900,
            cutoff_hour: None,
        }
    }
}

impl TransferSettings {
    pub fn max_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_window_days))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }
}

/// True once the local wall clock has reached the cutoff hour.
pub fn past_cutoff<Tz: TimeZone>(now: &DateTime<Tz>, cutoff_hour: Option<u32>) -> bool {
    cutoff_hour.is_some_and(|hour| now.hour() >= hour)
}

type Clock = Box<dyn FnMut() -> DateTime<FixedOffset> + Send>;

/// Combined stop condition: shutdown request or daily cutoff.
pub struct StopSignal {
    shutdown: Option<broadcast::Receiver<()>>,
    cutoff_hour: Option<u32>,
    clock: Clock,
    stopped: bool,
}

impl StopSignal {
    pub fn new(shutdown: Option<broadcast::Receiver<()>>, cutoff_hour: Option<u32>) -> Self {
        Self {
            shutdown,
            cutoff_hour,
            clock: Box::new(|| DateTime::<FixedOffset>::from(Local::now())),
            stopped: false,
        }
    }

    /// Read the wall clock for the cutoff check from `clock` instead of the
    /// local system time.
    pub fn with_clock(
        mut self,
        clock: impl FnMut() -> DateTime<FixedOffset> + Send + 'static,
    ) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::new(None, None)
    }

    pub fn should_stop(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        if let Some(rx) = self.shutdown.as_mut() {
            match rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    tracing::info!("Shutdown signal received");
                    self.stopped = true;
                }
                Err(broadcast::error::TryRecvError::Closed) => self.shutdown = None,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        if !self.stopped && past_cutoff(&(self.clock)(), self.cutoff_hour) {
            tracing::info!("Daily cutoff hour reached, not starting new jobs");
            self.stopped = true;
        }
        self.stopped
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if the loop
    /// should stop.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if let Some(rx) = self.shutdown.as_mut() {
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Err(broadcast::error::RecvError::Closed) => {
                        self.shutdown = None;
                        tokio::time::sleep(duration).await;
                    }
                    _ => {
                        tracing::info!("Shutdown signal received while waiting");
                        self.stopped = true;
                    }
                },
                _ = tokio::time::sleep(duration) => {}
            }
        } else {
            tokio::time::sleep(duration).await;
        }
        !self.should_stop()
    }
}

/// Result of one successful job execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Source rows read
    pub rows: usize,
    /// Line-protocol records delivered
    pub records: usize,
    /// Time of the newest row delivered
    pub synced_until: Option<DateTime<Utc>>,
    /// Backfill columns that produced a plausible value and were committed
    pub activated: Vec<String>,
}

/// Statistics from draining one job list.
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    pub jobs_completed: usize,
    pub jobs_abandoned: usize,
    pub records: usize,
    /// Jobs that delivered at least `min_records`
    pub busy_jobs: usize,
}

impl PassStats {
    pub fn caught_up(&self) -> bool {
        self.busy_jobs == 0
    }
}

/// Backfill columns that have produced a plausible value, per table.
///
/// The history and live jobs of a table share one entry, so a column that
/// became active on archived rows stays active for the live rows.
#[derive(Debug, Default)]
pub struct Activations {
    columns: BTreeMap<TableKey, BTreeSet<String>>,
}

impl Activations {
    pub fn is_active(&self, key: &TableKey, column: &str) -> bool {
        self.columns
            .get(key)
            .is_some_and(|columns| columns.contains(column))
    }

    fn record(&mut self, key: &TableKey, columns: &[String]) {
        self.columns
            .entry(key.clone())
            .or_default()
            .extend(columns.iter().cloned());
    }
}

/// Tracks which columns of a job may emit values.
///
/// Incremental columns are active from the start. Backfill columns become
/// active with their first plausible value and stay active.
struct ColumnGate<'j> {
    sensors: &'j [SensorBinding],
    active: Vec<bool>,
}

impl<'j> ColumnGate<'j> {
    fn new(job: &'j SyncJob, activations: &Activations) -> Self {
        let active = job
            .sensors()
            .iter()
            .map(|s| !job.unsynced || activations.is_active(&job.state_key, &s.column))
            .collect();
        Self {
            sensors: job.sensors(),
            active,
        }
    }

    fn admit(&mut self, idx: usize, value: f64) -> bool {
        if self.active[idx] {
            return true;
        }
        if self.sensors[idx].thresholds.accepts(value) {
            self.active[idx] = true;
            return true;
        }
        false
    }

    fn activated(&self) -> Vec<String> {
        self.sensors
            .iter()
            .zip(&self.active)
            .filter(|(_, active)| **active)
            .map(|(s, _)| s.column.clone())
            .collect()
    }
}

/// Executes jobs strictly one after another against a single source.
pub struct TransferLoop<'a, S: SourceAdapter, T: TelemetrySink> {
    source: &'a S,
    sink: &'a T,
    settings: &'a TransferSettings,
}

impl<'a, S: SourceAdapter, T: TelemetrySink> TransferLoop<'a, S, T> {
    pub fn new(source: &'a S, sink: &'a T, settings: &'a TransferSettings) -> Self {
        Self {
            source,
            sink,
            settings,
        }
    }

    /// Run every job in order, resolving backfill jobs with the planner as
    /// they finish. Jobs not started because of a stop are resolved as
    /// abandoned.
    pub async fn drain(
        &self,
        jobs: Vec<SyncJob>,
        planner: &mut SyncPlanner,
        store: &mut SyncStateStore,
        stop: &mut StopSignal,
    ) -> PassStats {
        let mut stats = PassStats::default();
        let mut activations = Activations::default();

        for job in &jobs {
            let outcome = if stop.should_stop() {
                None
            } else {
                self.run_job(job, store, stop, &mut activations).await
            };

            match outcome {
                Some(outcome) => {
                    stats.jobs_completed += 1;
                    stats.records += outcome.records;
                    if outcome.records >= self.settings.min_records {
                        stats.busy_jobs += 1;
                    }
                }
                None => stats.jobs_abandoned += 1,
            }

            if job.unsynced {
                if let Err(e) = planner.resolve(job.id) {
                    tracing::warn!("{}", e);
                }
            }
        }

        stats
    }

    /// Execute `job`, retrying after the backoff until it succeeds or the stop
    /// signal fires. A table that vanished from the source is given up at once.
    ///
    /// Columns the job activates are added to `activations` once it succeeds.
    pub async fn run_job(
        &self,
        job: &SyncJob,
        store: &mut SyncStateStore,
        stop: &mut StopSignal,
        activations: &mut Activations,
    ) -> Option<JobOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute_job(job, store, activations).await {
                Ok(outcome) => {
                    activations.record(&job.state_key, &outcome.activated);
                    tracing::debug!(
                        "Finished {}: {} rows, {} records",
                        job.describe(),
                        outcome.rows,
                        outcome.records
                    );
                    return Some(outcome);
                }
                Err(e) => {
                    let not_found = e
                        .downcast_ref::<SourceError>()
                        .is_some_and(SourceError::is_not_found);
                    if not_found {
                        tracing::warn!("Skipping {}: {}", job.describe(), e);
                        return None;
                    }
                    // Log with :? to show full error chain including root cause
                    tracing::error!(
                        "{} failed (attempt {}): {:?}",
                        job.describe(),
                        attempt,
                        e
                    );
                    if !stop.sleep(self.settings.retry_backoff()).await {
                        tracing::warn!("Abandoning {} without committing", job.describe());
                        return None;
                    }
                }
            }
        }
    }

    /// Execute `job` once.
    ///
    /// Reads `[cursor, cursor + window)` slices up to the table's last write,
    /// skipping empty slices. Incremental jobs commit their watermark after
    /// every delivered slice and stop at the record cap. Backfill jobs run to
    /// the end and commit their columns once, so an interrupted backfill is
    /// simply planned again. Backfill columns already in `activations` skip
    /// the plausibility gate.
    pub async fn execute_job(
        &self,
        job: &SyncJob,
        store: &mut SyncStateStore,
        activations: &Activations,
    ) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::default();
        let columns = job.sensor_columns();

        let last_write = self.source.last_write_time(&job.db_name, &job.table_name)?;
        let Some(last_write) = last_write else {
            tracing::debug!("{}.{} is empty", job.db_name, job.table_name);
            return Ok(outcome);
        };

        let mut cursor = job.start_time;
        if job.unsynced {
            if let Some(first) = self.source.first_time(&job.db_name, &job.table_name)? {
                cursor = cursor.max(first);
            }
        }

        let now = Utc::now();
        let window = self.settings.max_window();
        let mut gate = ColumnGate::new(job, activations);

        while cursor <= last_write && cursor < now {
            let end = cursor.checked_add_signed(window).unwrap_or(now).min(now);
            let range = TimeRange::new(cursor, end);
            let rows = self
                .source
                .query_range(&job.db_name, &job.table_name, &columns, range)?;
            cursor = end;

            let Some(newest) = rows.last().map(|r| r.time) else {
                continue;
            };

            let records = format_rows(job, &rows, &mut gate);
            if !records.is_empty() {
                self.sink.submit(&records).await.with_context(|| {
                    format!(
                        "Failed to submit {} record(s) for {}",
                        records.len(),
                        job.describe()
                    )
                })?;
            }

            outcome.rows += rows.len();
            outcome.records += records.len();
            outcome.synced_until = outcome.synced_until.max(Some(newest));

            if !job.unsynced {
                store.advance_watermark(&job.state_key, newest)?;
                if outcome.records >= self.settings.max_records_per_job {
                    tracing::info!(
                        "{}: record cap of {} reached, continuing next pass",
                        job.describe(),
                        self.settings.max_records_per_job
                    );
                    break;
                }
            }
        }

        if job.unsynced {
            outcome.activated = gate.activated();
            if outcome.activated.is_empty() {
                tracing::info!(
                    "{}: no plausible values yet, columns stay pending",
                    job.describe()
                );
            } else {
                store.record_backfill(
                    &job.state_key,
                    &outcome.activated,
                    outcome.synced_until.unwrap_or(job.start_time),
                    job.fresh_table,
                )?;
                tracing::info!(
                    "Backfilled {} rows of {}.{} into {} (columns {})",
                    outcome.rows,
                    job.db_name,
                    job.table_name,
                    job.destination_instance_id,
                    outcome.activated.join(",")
                );
            }
        }

        Ok(outcome)
    }
}

/// One record per row; null cells and not-yet-plausible backfill values are
/// left out, and rows left with no field are dropped.
fn format_rows(job: &SyncJob, rows: &[SourceRow], gate: &mut ColumnGate<'_>) -> Vec<String> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut fields = Vec::with_capacity(job.sensors().len());
        for (idx, sensor) in job.sensors().iter().enumerate() {
            let Some(value) = row.values.get(idx).copied().flatten() else {
                continue;
            };
            if gate.admit(idx, value) {
                fields.push((sensor.sensor_id.as_str(), value));
            }
        }
        match format_record(
            &job.destination_asset_id,
            &job.destination_instance_id,
            &fields,
            row.time,
        ) {
            Some(record) => records.push(record),
            None if !fields.is_empty() => {
                tracing::warn!(
                    "Dropping row at {} of {}: timestamp out of range",
                    row.time,
                    job.table_name
                )
            }
            None => {}
        }
    }
    records
}
