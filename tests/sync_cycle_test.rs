// ABOUTME: End-to-end passes over SQLite export fixtures with an in-process recording sink
// ABOUTME: Covers archive + live backfill, incremental catch-up, new columns and mapping failures

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use telemetry_sync::config::ForwarderConfig;
use telemetry_sync::destination::{DestinationLabel, LabelRegistry, TelemetrySink};
use telemetry_sync::engine::SyncEngine;
use telemetry_sync::error::MappingError;
use telemetry_sync::planner::SyncPlanner;
use telemetry_sync::source::{SqliteSource, TimeEncoding};
use telemetry_sync::state::{SyncStateStore, TableKey};
use telemetry_sync::transfer::StopSignal;
use tempfile::{tempdir, TempDir};

const DESTINATION_URL: &str = "https://telemetry.example.com";

const CONFIG: &str = r#"
[source]
name = "site-a"
root = "/placeholder"

[destination]
base_url = "https://telemetry.example.com"
username = "forwarder"

[destination.workspaces]
ws-a = "SiteA_DATA"

[transfer]
min_records = 3
retry_backoff_secs = 0

[[drivers]]
name = "substation"
table_pattern = "^Ctrl_"

[[drivers.points]]
column = "dp0"
sensor = "supply_temp"

[[drivers.points]]
column = "dp1"
sensor = "return_temp"
"#;

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }
}

impl TelemetrySink for RecordingSink {
    async fn submit(&self, records: &[String]) -> Result<()> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    config: ForwarderConfig,
    source: SqliteSource,
    store: SyncStateStore,
}

impl Fixture {
    fn new(config_toml: &str) -> Self {
        let dir = tempdir().unwrap();
        let exports = dir.path().join("exports");
        std::fs::create_dir(&exports).unwrap();

        create_db(
            &exports,
            "SiteA_DATA",
            r#"
            CREATE TABLE "Ctrl_1_Info" (ControllerId TEXT);
            INSERT INTO "Ctrl_1_Info" VALUES ('4711');
            CREATE TABLE "Ctrl_1_Data" (Timestamp TEXT, dp0 REAL, dp1 REAL);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:00:00', 70.0, 40.0);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:01:00', 70.5, NULL);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:02:00', 71.0, 41.0);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:03:00', 71.5, 41.5);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:04:00', 72.0, 42.0);
            CREATE TABLE "Pump_2_Info" (ControllerId TEXT);
            INSERT INTO "Pump_2_Info" VALUES ('9999');
            CREATE TABLE "Pump_2_Data" (Timestamp TEXT, dp0 REAL);
            "#,
        );
        create_db(
            &exports,
            "SiteA_DATA_ARCHIV",
            r#"
            CREATE TABLE "Ctrl_1_Info" (ControllerId TEXT);
            INSERT INTO "Ctrl_1_Info" VALUES ('4711');
            CREATE TABLE "Ctrl_1_Data" (Timestamp TEXT, dp0 REAL, dp1 REAL);
            INSERT INTO "Ctrl_1_Data" VALUES ('2023-01-10 00:00:00', 65.0, 38.0);
            INSERT INTO "Ctrl_1_Data" VALUES ('2023-02-10 00:00:00', 66.0, 39.0);
            "#,
        );

        let mut config = ForwarderConfig::from_toml_str(config_toml).unwrap();
        config.source.root = exports.clone();
        let source = SqliteSource::new(&exports, "Timestamp", TimeEncoding::Text);
        let store =
            SyncStateStore::open(&dir.path().join("state.json"), DESTINATION_URL).unwrap();

        Self {
            dir,
            config,
            source,
            store,
        }
    }

    fn live_db(&self) -> Connection {
        Connection::open(self.config.source.root.join("SiteA_DATA.db")).unwrap()
    }

    fn reopen_store(&mut self) {
        self.store =
            SyncStateStore::open(&self.dir.path().join("state.json"), DESTINATION_URL).unwrap();
    }
}

fn create_db(root: &Path, name: &str, ddl: &str) {
    let conn = Connection::open(root.join(format!("{}.db", name))).unwrap();
    conn.execute_batch(ddl).unwrap();
}

fn labels() -> LabelRegistry {
    LabelRegistry::from_labels(vec![DestinationLabel {
        instance_id: "i-1".to_string(),
        asset_id: "substation".to_string(),
        workspace_id: "ws-a".to_string(),
        controller_id: Some("4711".to_string()),
        sensors: [("supply_temp".to_string(), "sid-supply".to_string())]
            .into_iter()
            .collect(),
    }])
}

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap()
}

fn key() -> TableKey {
    TableKey::new("SiteA_DATA", "Ctrl_1_Data")
}

#[tokio::test]
async fn test_first_pass_backfills_archive_and_live() {
    let mut fx = Fixture::new(CONFIG);
    let sink = RecordingSink::default();
    let labels = labels();
    let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();
    let mut planner = SyncPlanner::new(fx.config.transfer.far_past);

    let summary = engine
        .run_pass(&mut planner, &mut fx.store, &mut StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.mappings, 1);
    assert_eq!(summary.backfill.jobs_completed, 2);
    assert_eq!(summary.backfill.records, 7);
    // The watermark row is inclusive and delivered once more
    assert_eq!(summary.incremental.records, 1);

    let records = sink.take();
    assert_eq!(
        records[0],
        format!(
            "substation,instance=i-1 sid-supply=65,return_temp=38 {}",
            nanos(at(2023, 1, 10, 0, 0))
        )
    );
    assert!(records.contains(&format!(
        "substation,instance=i-1 sid-supply=70.5 {}",
        nanos(at(2024, 5, 1, 10, 1))
    )));

    let entry = fx.store.get(&key()).unwrap();
    assert_eq!(entry.last_synced, at(2024, 5, 1, 10, 4));
    assert_eq!(
        entry.sensor_columns.iter().cloned().collect::<Vec<_>>(),
        vec!["dp0".to_string(), "dp1".to_string()]
    );
    assert_eq!(fx.store.len(), 1);
}

#[tokio::test]
async fn test_next_pass_only_sends_new_rows() {
    let mut fx = Fixture::new(CONFIG);
    let sink = RecordingSink::default();
    let labels = labels();
    {
        let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();
        let mut planner = SyncPlanner::new(fx.config.transfer.far_past);
        engine
            .run_pass(&mut planner, &mut fx.store, &mut StopSignal::never())
            .await
            .unwrap();
    }
    sink.take();

    fx.live_db()
        .execute_batch(
            r#"
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:05:00', 72.5, 42.5);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:06:00', 73.0, NULL);
            "#,
        )
        .unwrap();
    fx.reopen_store();

    let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();
    let mut planner = SyncPlanner::new(fx.config.transfer.far_past);
    let summary = engine
        .run_pass(&mut planner, &mut fx.store, &mut StopSignal::never())
        .await
        .unwrap();

    assert_eq!(summary.backfill.jobs_completed, 0);
    assert_eq!(summary.incremental.records, 3);
    assert!(!summary.caught_up());

    let records = sink.take();
    assert!(records[0].ends_with(&nanos(at(2024, 5, 1, 10, 4)).to_string()));
    assert_eq!(
        records[2],
        format!("substation,instance=i-1 sid-supply=73 {}", nanos(at(2024, 5, 1, 10, 6)))
    );
    assert_eq!(fx.store.get(&key()).unwrap().last_synced, at(2024, 5, 1, 10, 6));
}

#[tokio::test]
async fn test_added_driver_point_backfills_only_the_new_column() {
    let single_point = CONFIG.replace(
        "\n[[drivers.points]]\ncolumn = \"dp1\"\nsensor = \"return_temp\"\n",
        "\n",
    );
    let mut fx = Fixture::new(&single_point);
    assert_eq!(fx.config.drivers[0].points.len(), 1);
    let sink = RecordingSink::default();
    let labels = labels();
    {
        let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();
        engine.run(&mut fx.store, None, true).await.unwrap();
    }
    let first_fingerprint = fx.store.driver_fingerprint().map(str::to_string);
    assert!(first_fingerprint.is_some());
    assert_eq!(fx.store.get(&key()).unwrap().sensor_columns.len(), 1);
    sink.take();

    fx.config = {
        let mut config = ForwarderConfig::from_toml_str(CONFIG).unwrap();
        config.source.root = fx.config.source.root.clone();
        config
    };
    let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();
    let planned = engine.plan(&fx.store).await.unwrap();
    assert_eq!(planned.unsynced.len(), 2);
    assert!(planned
        .unsynced
        .iter()
        .all(|job| job.sensor_columns() == vec!["dp1".to_string()] && !job.fresh_table));
    assert_eq!(planned.incremental.len(), 1);
    assert_eq!(planned.incremental[0].sensor_columns(), vec!["dp0".to_string()]);

    engine.run(&mut fx.store, None, true).await.unwrap();

    assert_ne!(fx.store.driver_fingerprint().map(str::to_string), first_fingerprint);
    let entry = fx.store.get(&key()).unwrap();
    assert_eq!(entry.sensor_columns.len(), 2);
    assert_eq!(entry.last_synced, at(2024, 5, 1, 10, 4));

    let records = sink.take();
    let expected = format!(
        "substation,instance=i-1 return_temp=38 {}",
        nanos(at(2023, 1, 10, 0, 0))
    );
    assert!(records.iter().any(|r| r == &expected));
}

#[tokio::test]
async fn test_dry_run_plan_on_empty_state() {
    let fx = Fixture::new(CONFIG);
    let sink = RecordingSink::default();
    let labels = labels();
    let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();

    let planned = engine.plan(&fx.store).await.unwrap();

    assert_eq!(planned.unsynced.len(), 2);
    assert_eq!(planned.unsynced[0].db_name, "SiteA_DATA_ARCHIV");
    assert_eq!(planned.unsynced[1].db_name, "SiteA_DATA");
    assert!(planned.incremental.is_empty());
    assert!(sink.take().is_empty());
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn test_ambiguous_controller_stops_the_run() {
    let mut fx = Fixture::new(CONFIG);
    let sink = RecordingSink::default();
    let mut duplicated = labels().labels().to_vec();
    let mut second = duplicated[0].clone();
    second.instance_id = "i-2".to_string();
    duplicated.push(second);
    let labels = LabelRegistry::from_labels(duplicated);
    let engine = SyncEngine::new(&fx.config, &fx.source, &sink, &labels).unwrap();

    let err = engine.run(&mut fx.store, None, false).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MappingError>(),
        Some(MappingError::AmbiguousController { .. })
    ));
    assert!(fx.store.is_empty());
    assert!(sink.take().is_empty());
}
