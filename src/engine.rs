// ABOUTME: SyncEngine - repeats scan, map, backfill, incremental passes until cutoff or shutdown
// ABOUTME: Mapping errors are fatal, everything else is logged and retried on the next pass

use anyhow::{Context, Result};
use std::time::Instant;
use tokio::sync::broadcast;

use crate::config::ForwarderConfig;
use crate::destination::{LabelSource, TelemetrySink};
use crate::driver::DriverSet;
use crate::error::MappingError;
use crate::mapper::{AssetTableMapping, SourceDestinationMapper};
use crate::planner::{SyncJob, SyncPlanner};
use crate::scanner::SourceStructureScanner;
use crate::source::{ScanResult, SourceAdapter};
use crate::state::SyncStateStore;
use crate::transfer::{PassStats, StopSignal, TransferLoop};

/// Jobs a pass would run, for dry runs.
#[derive(Debug, Clone, Default)]
pub struct PlannedPass {
    pub unsynced: Vec<SyncJob>,
    /// Planned against the current state, i.e. as if every backfill above
    /// committed nothing
    pub incremental: Vec<SyncJob>,
}

/// Statistics of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub mappings: usize,
    pub backfill: PassStats,
    pub incremental: PassStats,
    pub duration_ms: u64,
}

impl PassSummary {
    /// True when no job of the pass had a meaningful amount of data.
    pub fn caught_up(&self) -> bool {
        self.backfill.caught_up() && self.incremental.caught_up()
    }

    pub fn records(&self) -> usize {
        self.backfill.records + self.incremental.records
    }
}

/// Drives the forwarder for one source installation.
pub struct SyncEngine<'a, S: SourceAdapter, T: TelemetrySink, L: LabelSource> {
    config: &'a ForwarderConfig,
    drivers: DriverSet,
    source: &'a S,
    sink: &'a T,
    labels: &'a L,
}

impl<'a, S: SourceAdapter, T: TelemetrySink, L: LabelSource> SyncEngine<'a, S, T, L> {
    pub fn new(
        config: &'a ForwarderConfig,
        source: &'a S,
        sink: &'a T,
        labels: &'a L,
    ) -> Result<Self> {
        Ok(Self {
            config,
            drivers: config.driver_set()?,
            source,
            sink,
            labels,
        })
    }

    /// Discover the source structure.
    pub fn scan(&self) -> ScanResult {
        SourceStructureScanner::new(self.source, &self.config.source.layout).scan()
    }

    /// Scan and map against a fresh label snapshot.
    pub async fn discover(&self) -> Result<Vec<AssetTableMapping>> {
        let scan = self.scan();
        let labels = self
            .labels
            .load_labels()
            .await
            .context("Failed to load destination labels")?;
        let mappings = SourceDestinationMapper::new(
            &self.config.destination.workspaces,
            &self.config.source.layout,
            &self.drivers,
        )
        .mapping(&scan, &labels)?;
        Ok(mappings)
    }

    /// Record the driver fingerprint, logging when the drivers changed since
    /// the state was last written.
    pub fn check_driver_fingerprint(&self, store: &mut SyncStateStore) -> Result<()> {
        let previous = store.driver_fingerprint().map(str::to_string);
        let current = self.drivers.fingerprint();
        if store.set_driver_fingerprint(&current)? {
            match previous {
                Some(previous) => tracing::info!(
                    "Driver configuration changed ({} -> {}); new columns will be backfilled",
                    &previous[..previous.len().min(12)],
                    &current[..12]
                ),
                None => tracing::info!("Recorded driver configuration {}", &current[..12]),
            }
        }
        Ok(())
    }

    /// Plan one pass without transferring anything.
    pub async fn plan(&self, store: &SyncStateStore) -> Result<PlannedPass> {
        let mappings = self.discover().await?;
        let mut planner = SyncPlanner::new(self.config.transfer.far_past);
        let unsynced = planner.plan_unsynced(&mappings, store);
        for job in &unsynced {
            planner.resolve(job.id)?;
        }
        let incremental = planner.plan_incremental(&mappings, store)?;
        Ok(PlannedPass { unsynced, incremental })
    }

    /// Run one pass: backfill everything new, then move every synced table
    /// forward.
    pub async fn run_pass(
        &self,
        planner: &mut SyncPlanner,
        store: &mut SyncStateStore,
        stop: &mut StopSignal,
    ) -> Result<PassSummary> {
        let start = Instant::now();
        let mut summary = PassSummary::default();
        let transfer = TransferLoop::new(self.source, self.sink, &self.config.transfer);

        let mappings = self.discover().await?;
        summary.mappings = mappings.len();

        let unsynced = planner.plan_unsynced(&mappings, store);
        summary.backfill = transfer.drain(unsynced, planner, store, stop).await;

        if !stop.should_stop() {
            let incremental = planner.plan_incremental(&mappings, store)?;
            summary.incremental = transfer.drain(incremental, planner, store, stop).await;
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        Ok(summary)
    }

    /// Run passes until the cutoff hour, a shutdown signal, or (with `once`)
    /// after the first pass.
    ///
    /// A caught-up pass is followed by the idle sleep; a busy one by the next
    /// pass immediately. A failed pass is retried after the retry backoff,
    /// except for mapping errors, which need an operator and end the run.
    pub async fn run(
        &self,
        store: &mut SyncStateStore,
        shutdown: Option<broadcast::Receiver<()>>,
        once: bool,
    ) -> Result<()> {
        let settings = &self.config.transfer;
        let mut stop = StopSignal::new(shutdown, settings.cutoff_hour);
        let mut planner = SyncPlanner::new(settings.far_past);
        let mut passes = 0u64;

        self.check_driver_fingerprint(store)?;

        tracing::info!(
            "Starting SyncEngine with max_window={}d, idle_sleep={:?}, cutoff_hour={:?}",
            settings.max_window_days,
            settings.idle_sleep(),
            settings.cutoff_hour
        );

        while !stop.should_stop() {
            passes += 1;
            tracing::info!("Starting pass {}", passes);

            match self.run_pass(&mut planner, store, &mut stop).await {
                Ok(summary) => {
                    tracing::info!(
                        "Pass {} completed: {} mapped table(s), {} record(s), \
                         {} job(s) abandoned in {}ms",
                        passes,
                        summary.mappings,
                        summary.records(),
                        summary.backfill.jobs_abandoned + summary.incremental.jobs_abandoned,
                        summary.duration_ms
                    );
                    if once {
                        break;
                    }
                    if summary.caught_up() && !stop.sleep(settings.idle_sleep()).await {
                        break;
                    }
                }
                Err(e) => {
                    if e.downcast_ref::<MappingError>().is_some() {
                        return Err(e.context("Mapping configuration is inconsistent"));
                    }
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Pass {} failed: {:?}", passes, e);
                    if once {
                        return Err(e);
                    }
                    if !stop.sleep(settings.retry_backoff()).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("SyncEngine stopped after {} pass(es)", passes);
        Ok(())
    }
}
