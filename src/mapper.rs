// ABOUTME: SourceDestinationMapper - joins discovered tables with destination labels and drivers
// ABOUTME: Produces a fresh list of AssetTableMapping per pass; nothing here is persisted

use std::collections::{BTreeMap, HashMap};

use crate::destination::LabelRegistry;
use crate::driver::{DriverSet, SensorBinding};
use crate::error::MappingError;
use crate::scanner::SourceLayout;
use crate::source::ScanResult;
use crate::state::TableKey;

/// A source table bound to one destination instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetTableMapping {
    pub destination_instance_id: String,
    pub destination_asset_id: String,
    pub destination_workspace_id: String,
    pub source_db_live: String,
    /// Archive database holding older rows of the same table, if present
    pub source_db_history: Option<String>,
    pub source_table: String,
    pub controller_id: String,
    /// Name of the driver that claimed the table
    pub driver: String,
    /// Bound sensors in driver order; never empty
    pub sensor_models: Vec<SensorBinding>,
}

impl AssetTableMapping {
    /// Sync state key. Archive rows are tracked under the live database.
    pub fn key(&self) -> TableKey {
        TableKey::new(&self.source_db_live, &self.source_table)
    }

    pub fn sensor_columns(&self) -> impl Iterator<Item = &str> {
        self.sensor_models.iter().map(|s| s.column.as_str())
    }
}

pub struct SourceDestinationMapper<'a> {
    /// Workspace id -> live source database name
    workspaces: &'a BTreeMap<String, String>,
    layout: &'a SourceLayout,
    drivers: &'a DriverSet,
}

impl<'a> SourceDestinationMapper<'a> {
    pub fn new(
        workspaces: &'a BTreeMap<String, String>,
        layout: &'a SourceLayout,
        drivers: &'a DriverSet,
    ) -> Self {
        Self {
            workspaces,
            layout,
            drivers,
        }
    }

    /// Build the mapping list.
    ///
    /// Labels whose workspace has no database, or whose database was not
    /// discovered, contribute nothing. Two instances claiming the same
    /// controller in the same database is a configuration error.
    pub fn mapping(
        &self,
        scan: &ScanResult,
        labels: &LabelRegistry,
    ) -> Result<Vec<AssetTableMapping>, MappingError> {
        let mut claims: HashMap<(&str, &str), &str> = HashMap::new();
        let mut mappings = Vec::new();

        for (label, controller_id) in labels.with_controller() {
            let Some(database) = self.workspaces.get(&label.workspace_id) else {
                tracing::debug!(
                    "Instance {}: workspace {} has no source database",
                    label.instance_id,
                    label.workspace_id
                );
                continue;
            };
            if !scan.has_database(database) {
                tracing::debug!(
                    "Instance {}: source database {} was not discovered",
                    label.instance_id,
                    database
                );
                continue;
            }

            let claim = (database.as_str(), controller_id);
            if let Some(first) = claims.insert(claim, &label.instance_id) {
                return Err(MappingError::AmbiguousController {
                    database: database.clone(),
                    controller_id: controller_id.to_string(),
                    first_instance: first.to_string(),
                    second_instance: label.instance_id.clone(),
                });
            }

            for table in scan
                .tables_in(database)
                .filter(|t| t.controller_id == controller_id)
            {
                let Some(driver) = self.drivers.first_match(&table.table_name) else {
                    tracing::debug!("No driver matches {}.{}", database, table.table_name);
                    continue;
                };

                let sensor_models = driver.bind(table, &label.sensors);
                if sensor_models.is_empty() {
                    tracing::info!(
                        "Driver {} claimed {}.{} but none of its points exist there",
                        driver.name(),
                        database,
                        table.table_name
                    );
                    continue;
                }

                let source_db_history = self
                    .layout
                    .history_database_for(database)
                    .filter(|history| scan.find_table(history, &table.table_name).is_some());

                mappings.push(AssetTableMapping {
                    destination_instance_id: label.instance_id.clone(),
                    destination_asset_id: label.asset_id.clone(),
                    destination_workspace_id: label.workspace_id.clone(),
                    source_db_live: database.clone(),
                    source_db_history,
                    source_table: table.table_name.clone(),
                    controller_id: controller_id.to_string(),
                    driver: driver.name().to_string(),
                    sensor_models,
                });
            }
        }

        tracing::info!("Mapped {} table(s) to destination instances", mappings.len());
        Ok(mappings)
    }
}
