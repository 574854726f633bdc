// ABOUTME: SourceStructureScanner - discovers live/archive databases and their controller tables
// ABOUTME: Best effort: unreadable items are logged and skipped, partial results are valid

use serde::Deserialize;
use std::collections::BTreeSet;

use crate::source::{ScanResult, SourceAdapter, SourceTable};

/// Naming conventions of a source installation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceLayout {
    /// Live databases end with this marker
    pub live_suffix: String,
    /// Appended to a live database name to form its archive database.
    /// Empty disables archive discovery.
    pub history_suffix: String,
    pub info_table_suffix: String,
    pub data_table_suffix: String,
    /// Column of the info table holding the controller id
    pub controller_column: String,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            live_suffix: "_DATA".to_string(),
            history_suffix: "_ARCHIV".to_string(),
            info_table_suffix: "_Info".to_string(),
            data_table_suffix: "_Data".to_string(),
            controller_column: "ControllerId".to_string(),
        }
    }
}

impl SourceLayout {
    pub fn is_live_database(&self, name: &str) -> bool {
        name.ends_with(&self.live_suffix)
    }

    pub fn is_history_database(&self, name: &str) -> bool {
        !self.history_suffix.is_empty()
            && name
                .strip_suffix(&self.history_suffix)
                .is_some_and(|live| self.is_live_database(live))
    }

    /// Name of the archive database that belongs to `live`, if archives are enabled.
    pub fn history_database_for(&self, live: &str) -> Option<String> {
        if self.history_suffix.is_empty() {
            None
        } else {
            Some(format!("{}{}", live, self.history_suffix))
        }
    }

    /// Data table paired with an info table, if `info_table` follows the convention.
    pub fn data_table_for(&self, info_table: &str) -> Option<String> {
        info_table
            .strip_suffix(&self.info_table_suffix)
            .filter(|stem| !stem.is_empty())
            .map(|stem| format!("{}{}", stem, self.data_table_suffix))
    }
}

pub struct SourceStructureScanner<'a, S: SourceAdapter> {
    source: &'a S,
    layout: &'a SourceLayout,
}

impl<'a, S: SourceAdapter> SourceStructureScanner<'a, S> {
    pub fn new(source: &'a S, layout: &'a SourceLayout) -> Self {
        Self { source, layout }
    }

    /// Walk all qualifying databases and collect their controller tables.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();

        let databases = match self.source.list_databases() {
            Ok(databases) => databases,
            Err(e) => {
                tracing::warn!("Source discovery failed, nothing to scan: {}", e);
                return result;
            }
        };

        for database in databases.iter().filter(|d| {
            self.layout.is_live_database(d) || self.layout.is_history_database(d)
        }) {
            let tables = match self.source.list_tables(database) {
                Ok(tables) => tables,
                Err(e) => {
                    tracing::warn!("Skipping database {}: {}", database, e);
                    continue;
                }
            };
            result.databases.insert(database.clone());

            let names: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
            for info_table in &tables {
                let Some(data_table) = self.layout.data_table_for(info_table) else {
                    continue;
                };
                if !names.contains(data_table.as_str()) {
                    tracing::debug!(
                        "Info table {}.{} has no data table {}",
                        database,
                        info_table,
                        data_table
                    );
                    continue;
                }

                if let Some(table) = self.scan_table(database, info_table, &data_table) {
                    result.tables.push(table);
                }
            }
        }

        tracing::info!(
            "Scanned {} database(s), found {} controller table(s)",
            result.databases.len(),
            result.tables.len()
        );
        result
    }

    fn scan_table(
        &self,
        database: &str,
        info_table: &str,
        data_table: &str,
    ) -> Option<SourceTable> {
        let controller_id = match self.source.controller_id(
            database,
            info_table,
            &self.layout.controller_column,
        ) {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::warn!(
                    "Skipping {}.{}: info row has no {}",
                    database,
                    info_table,
                    self.layout.controller_column
                );
                return None;
            }
            Err(e) => {
                tracing::warn!("Skipping {}.{}: {}", database, info_table, e);
                return None;
            }
        };

        match self.source.table_columns(database, data_table) {
            Ok(all_columns) => Some(SourceTable {
                database_name: database.to_string(),
                table_name: data_table.to_string(),
                controller_id,
                all_columns,
            }),
            Err(e) => {
                tracing::warn!("Skipping {}.{}: {}", database, data_table, e);
                None
            }
        }
    }
}
