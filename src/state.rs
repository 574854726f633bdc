// ABOUTME: SyncStateStore - durable per-table watermarks and synced sensor columns
// ABOUTME: JSON file replaced atomically on every change so a crash never leaves a torn state

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_VERSION: u32 = 1;

/// Identifies a tracked source table. Backfills from an archival database are
/// recorded under the key of the live database they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub database: String,
    pub table: String,
}

impl TableKey {
    pub fn new(database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
        }
    }

    /// Get the qualified name (database.table) used as the map key on disk
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Sync state for a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSyncState {
    pub database: String,
    pub table: String,
    /// Timestamp up to which the synced columns are confirmed delivered.
    /// Never moves backwards.
    pub last_synced: DateTime<Utc>,
    /// Sensor columns that have been backfilled and are now synced incrementally.
    /// Only ever grows.
    pub sensor_columns: BTreeSet<String>,
    /// Wall-clock time of the last change to this entry
    pub updated_at: DateTime<Utc>,
}

impl TableSyncState {
    fn new(key: &TableKey, last_synced: DateTime<Utc>) -> Self {
        Self {
            database: key.database.clone(),
            table: key.table.clone(),
            last_synced,
            sensor_columns: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(&self.database, &self.table)
    }
}

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncState {
    version: u32,
    /// Destination endpoint (sanitized - no password)
    destination_url: String,
    /// SHA-256 of the driver configuration the state was last written with
    #[serde(default)]
    driver_fingerprint: Option<String>,
    tables: BTreeMap<String, TableSyncState>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SyncState {
    fn new(destination_url: &str) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            destination_url: crate::utils::sanitize_url(destination_url),
            driver_fingerprint: None,
            tables: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable store of [`TableSyncState`] entries.
///
/// The store is owned by exactly one transfer loop. Every mutation is written
/// through to disk before it returns.
#[derive(Debug)]
pub struct SyncStateStore {
    path: PathBuf,
    state: SyncState,
}

impl SyncStateStore {
    /// Open the store at `path`, creating an empty one if the file does not exist.
    ///
    /// An unreadable file is moved aside to `<path>.corrupt` and a fresh state is
    /// started; the worst outcome of that is re-delivering data already sent.
    pub fn open(path: &Path, destination_url: &str) -> Result<Self> {
        if path.exists() {
            match Self::load(path) {
                Ok(state) => {
                    tracing::info!(
                        "Loaded sync state for {} table(s) from {:?}",
                        state.tables.len(),
                        path
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        state,
                    });
                }
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    tracing::warn!(
                        "Failed to load sync state from {:?}: {:?}. \
                         Moving it to {:?} and starting over.",
                        path,
                        e,
                        aside
                    );
                    fs::rename(path, &aside)
                        .with_context(|| format!("Failed to move {:?} aside", path))?;
                }
            }
        }

        tracing::info!("Creating new sync state at {:?}", path);
        let store = Self::unsaved(path, destination_url);
        store.save()?;
        Ok(store)
    }

    /// Read the store at `path` without ever writing to it.
    ///
    /// Returns `None` when no state file exists yet. An unreadable file is an
    /// error and is left where it is for its owner to deal with.
    pub fn load_existing(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let state = Self::load(path)?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            state,
        }))
    }

    /// An empty store that has not been written to disk.
    pub fn unsaved(path: &Path, destination_url: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            state: SyncState::new(destination_url),
        }
    }

    fn load(path: &Path) -> Result<SyncState> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync state from {:?}", path))?;
        let state: SyncState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync state from {:?}", path))?;
        if state.version != STATE_VERSION {
            bail!(
                "Unsupported sync state version {} (expected {})",
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Write the state to a temporary sibling, flush it, then rename it over the
    /// real file.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(&self.state).context("Failed to serialize sync state")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {:?}", tmp))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write {:?}", tmp))?;
            file.sync_all()
                .with_context(|| format!("Failed to flush {:?}", tmp))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace sync state at {:?}", self.path))?;
        Ok(())
    }

    pub fn get(&self, key: &TableKey) -> Option<&TableSyncState> {
        self.state.tables.get(&key.qualified_name())
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.get(key).is_some()
    }

    /// All tracked tables, ordered by qualified name.
    pub fn tables(&self) -> impl Iterator<Item = &TableSyncState> {
        self.state.tables.values()
    }

    pub fn len(&self) -> usize {
        self.state.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.tables.is_empty()
    }

    pub fn driver_fingerprint(&self) -> Option<&str> {
        self.state.driver_fingerprint.as_deref()
    }

    /// Record the fingerprint of the active driver configuration.
    ///
    /// Returns `true` if it differs from the previously stored one.
    pub fn set_driver_fingerprint(&mut self, fingerprint: &str) -> Result<bool> {
        if self.state.driver_fingerprint.as_deref() == Some(fingerprint) {
            return Ok(false);
        }
        self.state.driver_fingerprint = Some(fingerprint.to_string());
        self.state.updated_at = Utc::now();
        self.save()?;
        Ok(true)
    }

    /// Commit a completed backfill.
    ///
    /// The columns are unioned into the synced set. The watermark is only moved
    /// (forward, never back) when `advance_watermark` is set, which the caller
    /// does for tables that were untracked when the backfill was planned. A
    /// backfill of newly added columns on a tracked table must not touch the
    /// watermark of the columns already being synced.
    pub fn record_backfill(
        &mut self,
        key: &TableKey,
        columns: &[String],
        synced_until: DateTime<Utc>,
        advance_watermark: bool,
    ) -> Result<()> {
        let entry = self
            .state
            .tables
            .entry(key.qualified_name())
            .or_insert_with(|| TableSyncState::new(key, synced_until));

        if advance_watermark && synced_until > entry.last_synced {
            entry.last_synced = synced_until;
        }
        entry.sensor_columns.extend(columns.iter().cloned());
        entry.updated_at = Utc::now();
        self.state.updated_at = entry.updated_at;

        tracing::debug!(
            "Backfill committed for {}: columns={:?}, last_synced={}",
            key,
            entry.sensor_columns,
            entry.last_synced
        );
        self.save()
    }

    /// Move the watermark of a tracked table forward after an incremental batch.
    ///
    /// Returns `false` (and writes nothing) when `synced_until` is not newer than
    /// the stored watermark.
    pub fn advance_watermark(
        &mut self,
        key: &TableKey,
        synced_until: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(entry) = self.state.tables.get_mut(&key.qualified_name()) else {
            bail!("Cannot advance watermark of untracked table {}", key);
        };

        if synced_until <= entry.last_synced {
            return Ok(false);
        }

        entry.last_synced = synced_until;
        entry.updated_at = Utc::now();
        self.state.updated_at = entry.updated_at;
        self.save()?;
        Ok(true)
    }
}
