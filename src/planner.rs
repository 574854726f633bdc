// ABOUTME: SyncPlanner - turns mappings plus persisted state into backfill and incremental jobs
// ABOUTME: Backfill planning must be fully resolved before incremental planning may run

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::driver::SensorBinding;
use crate::error::PlanError;
use crate::mapper::AssetTableMapping;
use crate::state::{SyncStateStore, TableKey};

/// One unit of transfer work.
///
/// Columns and destination sensor ids are stored together as bindings, so the
/// pairing between them cannot be broken by reordering one side.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    /// Sequence number within the current planning cycle
    pub id: u64,
    /// Database to read from (live or archive)
    pub db_name: String,
    pub table_name: String,
    /// Where progress is recorded; always the live database's key
    pub state_key: TableKey,
    pub destination_instance_id: String,
    pub destination_asset_id: String,
    pub start_time: DateTime<Utc>,
    /// `true` for a backfill of columns never synced before
    pub unsynced: bool,
    /// The table had no state at all when this job was planned; only then may
    /// a backfill move the watermark
    pub fresh_table: bool,
    sensors: Vec<SensorBinding>,
}

impl SyncJob {
    pub fn sensors(&self) -> &[SensorBinding] {
        &self.sensors
    }

    pub fn sensor_columns(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.column.clone()).collect()
    }

    pub fn sensor_ids(&self) -> Vec<&str> {
        self.sensors.iter().map(|s| s.sensor_id.as_str()).collect()
    }

    pub fn is_history(&self) -> bool {
        self.db_name != self.state_key.database
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {}.{} [{}] from {}",
            if self.unsynced { "backfill" } else { "incremental" },
            self.db_name,
            self.table_name,
            self.sensor_columns().join(","),
            self.start_time.to_rfc3339()
        )
    }
}

/// Two-phase planner. Planning only reads the state store.
#[derive(Debug)]
pub struct SyncPlanner {
    far_past: DateTime<Utc>,
    next_id: u64,
    outstanding: BTreeSet<u64>,
}

impl SyncPlanner {
    /// `far_past` is the start time of every backfill.
    pub fn new(far_past: DateTime<Utc>) -> Self {
        Self {
            far_past,
            next_id: 0,
            outstanding: BTreeSet::new(),
        }
    }

    /// Number of backfill jobs handed out and not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Plan backfills for untracked tables and for columns added to tracked ones.
    ///
    /// Starts a new planning cycle. Archive jobs come before the live job of
    /// the same table so that older data is committed first.
    pub fn plan_unsynced(
        &mut self,
        mappings: &[AssetTableMapping],
        store: &SyncStateStore,
    ) -> Vec<SyncJob> {
        if !self.outstanding.is_empty() {
            tracing::warn!(
                "Discarding {} unresolved backfill job(s) from the previous cycle",
                self.outstanding.len()
            );
            self.outstanding.clear();
        }
        self.next_id = 0;

        let mut jobs = Vec::new();
        for mapping in mappings {
            let key = mapping.key();
            let (sensors, fresh_table): (Vec<SensorBinding>, bool) = match store.get(&key) {
                None => (mapping.sensor_models.clone(), true),
                Some(state) => (
                    mapping
                        .sensor_models
                        .iter()
                        .filter(|s| !state.sensor_columns.contains(&s.column))
                        .cloned()
                        .collect(),
                    false,
                ),
            };
            if sensors.is_empty() {
                continue;
            }

            let databases = mapping
                .source_db_history
                .iter()
                .chain(std::iter::once(&mapping.source_db_live));
            for db_name in databases {
                let job = self.job(
                    mapping,
                    db_name,
                    &key,
                    sensors.clone(),
                    self.far_past,
                    true,
                    fresh_table,
                );
                self.outstanding.insert(job.id);
                jobs.push(job);
            }
        }

        tracing::info!("Planned {} backfill job(s)", jobs.len());
        jobs
    }

    /// Plan one incremental job per tracked table, covering the columns that
    /// are both mapped and already synced.
    ///
    /// Fails while backfill jobs of this cycle are unresolved.
    pub fn plan_incremental(
        &mut self,
        mappings: &[AssetTableMapping],
        store: &SyncStateStore,
    ) -> Result<Vec<SyncJob>, PlanError> {
        if !self.outstanding.is_empty() {
            return Err(PlanError::UnsyncedOutstanding {
                count: self.outstanding.len(),
            });
        }

        let mut jobs = Vec::new();
        for mapping in mappings {
            let key = mapping.key();
            let Some(state) = store.get(&key) else {
                continue;
            };
            let sensors: Vec<SensorBinding> = mapping
                .sensor_models
                .iter()
                .filter(|s| state.sensor_columns.contains(&s.column))
                .cloned()
                .collect();
            if sensors.is_empty() {
                tracing::debug!("No synced columns of {} are still mapped", key);
                continue;
            }

            let job = self.job(
                mapping,
                &mapping.source_db_live,
                &key,
                sensors,
                state.last_synced,
                false,
                false,
            );
            jobs.push(job);
        }

        tracing::info!("Planned {} incremental job(s)", jobs.len());
        Ok(jobs)
    }

    /// Mark a backfill job as finished, failed or abandoned.
    pub fn resolve(&mut self, job_id: u64) -> Result<(), PlanError> {
        if self.outstanding.remove(&job_id) {
            Ok(())
        } else {
            Err(PlanError::UnknownJob(job_id))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn job(
        &mut self,
        mapping: &AssetTableMapping,
        db_name: &str,
        key: &TableKey,
        sensors: Vec<SensorBinding>,
        start_time: DateTime<Utc>,
        unsynced: bool,
        fresh_table: bool,
    ) -> SyncJob {
        let id = self.next_id;
        self.next_id += 1;
        SyncJob {
            id,
            db_name: db_name.to_string(),
            table_name: mapping.source_table.clone(),
            state_key: key.clone(),
            destination_instance_id: mapping.destination_instance_id.clone(),
            destination_asset_id: mapping.destination_asset_id.clone(),
            start_time,
            unsynced,
            fresh_table,
            sensors,
        }
    }
}
