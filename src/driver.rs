// ABOUTME: Declarative driver configurations - which source columns feed which destination sensors
// ABOUTME: Compiles table patterns, rejects duplicate claims and gates first activation of a column

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::error::MappingError;
use crate::source::SourceTable;

/// Plausibility bounds for a column that has not produced data yet.
///
/// The values are tuned per vendor and carried through as-is. A value is
/// plausible when it is below `lt`, above `gt`, and equal to neither of the
/// sentinel values `b1`/`b2`; unset bounds always pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<f64>,
}

impl Thresholds {
    pub fn accepts(&self, value: f64) -> bool {
        self.lt.map_or(true, |lt| value < lt)
            && self.gt.map_or(true, |gt| value > gt)
            && self.b1.map_or(true, |b| value != b)
            && self.b2.map_or(true, |b| value != b)
    }
}

/// A rule binding a source column to a destination sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverDataPoint {
    /// Source column name
    pub column: String,
    /// Required ordinal position of the column, if the vendor reuses names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Sensor key; resolved to a destination sensor id per instance
    pub sensor: String,
    #[serde(flatten)]
    pub thresholds: Thresholds,
}

/// One sensor-type driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    /// Regex matched against data table names
    pub table_pattern: String,
    #[serde(default)]
    pub points: Vec<DriverDataPoint>,
}

/// A data point instantiated for one table and one destination instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorBinding {
    pub column: String,
    pub sensor_id: String,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone)]
pub struct CompiledDriver {
    config: DriverConfig,
    pattern: Regex,
}

impl CompiledDriver {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn matches_table(&self, table_name: &str) -> bool {
        self.pattern.is_match(table_name)
    }

    /// Bind the points whose column exists in `table`, in driver order.
    ///
    /// `sensor_ids` maps sensor keys to destination ids for the target
    /// instance; keys without an entry are used verbatim.
    pub fn bind(
        &self,
        table: &SourceTable,
        sensor_ids: &BTreeMap<String, String>,
    ) -> Vec<SensorBinding> {
        self.config
            .points
            .iter()
            .filter(|point| {
                table.all_columns.iter().any(|column| {
                    column.name == point.column
                        && point.position.map_or(true, |p| p == column.position)
                })
            })
            .map(|point| SensorBinding {
                column: point.column.clone(),
                sensor_id: sensor_ids
                    .get(&point.sensor)
                    .cloned()
                    .unwrap_or_else(|| point.sensor.clone()),
                thresholds: point.thresholds,
            })
            .collect()
    }
}

/// All drivers of a connector in priority order.
#[derive(Debug, Clone, Default)]
pub struct DriverSet {
    drivers: Vec<CompiledDriver>,
}

impl DriverSet {
    pub fn new(configs: Vec<DriverConfig>) -> Result<Self, MappingError> {
        let mut names = HashSet::new();
        let mut drivers = Vec::with_capacity(configs.len());

        for config in configs {
            if !names.insert(config.name.clone()) {
                return Err(MappingError::DuplicateDriver(config.name));
            }
            validate_points(&config)?;
            let pattern =
                Regex::new(&config.table_pattern).map_err(|e| MappingError::InvalidPattern {
                    driver: config.name.clone(),
                    message: e.to_string(),
                })?;
            drivers.push(CompiledDriver { config, pattern });
        }

        Ok(Self { drivers })
    }

    /// The first driver (by priority) whose pattern matches, even if it would
    /// bind nothing.
    pub fn first_match(&self, table_name: &str) -> Option<&CompiledDriver> {
        self.drivers.iter().find(|d| d.matches_table(table_name))
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Returns a stable fingerprint of the driver configuration
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for driver in &self.drivers {
            hasher.update(driver.config.name.as_bytes());
            hasher.update(b"|");
            hasher.update(driver.config.table_pattern.as_bytes());
            for point in &driver.config.points {
                hasher.update(b"|");
                // Serialising a plain struct of strings and numbers cannot fail
                let encoded = serde_json::to_string(point).unwrap_or_default();
                hasher.update(encoded.as_bytes());
            }
            hasher.update(b"#");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A column name may only repeat when every point naming it pins a distinct
/// position; otherwise two points could bind the same column.
fn validate_points(config: &DriverConfig) -> Result<(), MappingError> {
    let mut columns: BTreeMap<&str, Vec<Option<usize>>> = BTreeMap::new();
    let mut sensors = HashSet::new();
    for point in &config.points {
        let claimed = columns.entry(point.column.as_str()).or_default();
        let clash = claimed.iter().any(|other| match (other, point.position) {
            (Some(a), Some(b)) => *a == b,
            _ => true,
        });
        claimed.push(point.position);
        if clash {
            return Err(MappingError::DuplicateClaim {
                driver: config.name.clone(),
                what: "column",
                value: point.column.clone(),
            });
        }
        if !sensors.insert(point.sensor.as_str()) {
            return Err(MappingError::DuplicateClaim {
                driver: config.name.clone(),
                what: "sensor",
                value: point.sensor.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceColumn;

    fn point(column: &str, position: Option<usize>, sensor: &str) -> DriverDataPoint {
        DriverDataPoint {
            column: column.to_string(),
            position,
            sensor: sensor.to_string(),
            thresholds: Thresholds::default(),
        }
    }

    fn driver(name: &str, pattern: &str, points: Vec<DriverDataPoint>) -> DriverConfig {
        DriverConfig {
            name: name.to_string(),
            table_pattern: pattern.to_string(),
            points,
        }
    }

    fn table(columns: &[(&str, usize)]) -> SourceTable {
        SourceTable {
            database_name: "SiteA_DATA".to_string(),
            table_name: "Ctrl_1_Data".to_string(),
            controller_id: "4711".to_string(),
            all_columns: columns.iter().map(|(n, p)| SourceColumn::new(n, *p)).collect(),
        }
    }

    #[test]
    fn test_thresholds() {
        let open = Thresholds::default();
        assert!(open.accepts(-1e9));

        let bounded = Thresholds {
            lt: Some(150.0),
            gt: Some(-50.0),
            b1: Some(0.0),
            b2: Some(-99.9),
        };
        assert!(bounded.accepts(21.5));
        assert!(!bounded.accepts(150.0));
        assert!(!bounded.accepts(-50.0));
        assert!(!bounded.accepts(0.0));
        assert!(!bounded.accepts(-99.9));
    }

    #[test]
    fn test_first_match_wins() {
        let set = DriverSet::new(vec![
            driver("substation", "^Ctrl_.*_Data$", vec![point("missing", None, "s")]),
            driver("generic", "_Data$", vec![point("dp0", None, "supply_temp")]),
        ])
        .unwrap();

        let chosen = set.first_match("Ctrl_1_Data").unwrap();
        assert_eq!(chosen.name(), "substation");
        assert!(chosen.bind(&table(&[("dp0", 1)]), &BTreeMap::new()).is_empty());
        assert_eq!(set.first_match("Boiler_Data").unwrap().name(), "generic");
        assert!(set.first_match("Ctrl_1_Info").is_none());
    }

    #[test]
    fn test_bind_respects_position_and_sensor_ids() {
        let compiled = DriverSet::new(vec![driver(
            "substation",
            ".*",
            vec![
                point("dp1", Some(2), "return_temp"),
                point("dp0", Some(1), "supply_temp"),
                point("dp2", Some(7), "flow"),
            ],
        )])
        .unwrap();
        let d = compiled.first_match("any").unwrap();

        let mut ids = BTreeMap::new();
        ids.insert("supply_temp".to_string(), "sensor-001".to_string());
        let bound = d.bind(&table(&[("dp0", 1), ("dp1", 2), ("dp2", 3)]), &ids);

        let pairs: Vec<(&str, &str)> = bound
            .iter()
            .map(|b| (b.column.as_str(), b.sensor_id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("dp1", "return_temp"), ("dp0", "sensor-001")]);
    }

    #[test]
    fn test_duplicate_claims_rejected() {
        let err = DriverSet::new(vec![driver(
            "d",
            ".*",
            vec![point("dp0", None, "a"), point("dp0", None, "b")],
        )])
        .unwrap_err();
        assert!(matches!(err, MappingError::DuplicateClaim { what: "column", .. }));

        let err = DriverSet::new(vec![driver(
            "d",
            ".*",
            vec![point("dp0", None, "a"), point("dp1", None, "a")],
        )])
        .unwrap_err();
        assert!(matches!(err, MappingError::DuplicateClaim { what: "sensor", .. }));

        let err = DriverSet::new(vec![driver("d", ".*", vec![]), driver("d", "x", vec![])])
            .unwrap_err();
        assert_eq!(err, MappingError::DuplicateDriver("d".to_string()));

        let err = DriverSet::new(vec![driver("d", "(", vec![])]).unwrap_err();
        assert!(matches!(err, MappingError::InvalidPattern { .. }));
    }

    #[test]
    fn test_repeated_column_needs_distinct_positions() {
        for points in [
            vec![point("dp0", None, "a"), point("dp0", Some(1), "b")],
            vec![point("dp0", Some(1), "a"), point("dp0", None, "b")],
            vec![point("dp0", Some(1), "a"), point("dp0", Some(1), "b")],
        ] {
            let err = DriverSet::new(vec![driver("d", ".*", points)]).unwrap_err();
            assert!(matches!(err, MappingError::DuplicateClaim { what: "column", .. }));
        }

        let set = DriverSet::new(vec![driver(
            "d",
            ".*",
            vec![point("dp0", Some(1), "a"), point("dp0", Some(4), "b")],
        )])
        .unwrap();
        let bound = set
            .first_match("any")
            .unwrap()
            .bind(&table(&[("dp0", 4)]), &BTreeMap::new());
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].sensor_id, "b");
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = DriverSet::new(vec![driver("d", ".*", vec![point("dp0", None, "a")])]).unwrap();
        let b = DriverSet::new(vec![driver("d", ".*", vec![point("dp0", None, "a")])]).unwrap();
        let c = DriverSet::new(vec![driver(
            "d",
            ".*",
            vec![point("dp0", None, "a"), point("dp1", None, "b")],
        )])
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
