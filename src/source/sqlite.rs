// ABOUTME: SourceAdapter over a directory of SQLite export files (one file per database)
// ABOUTME: Lists tables and columns, reads controller ids and time-bounded column ranges

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{SourceAdapter, SourceColumn, SourceRow, TimeRange};
use crate::error::{SourceError, SourceResult};
use crate::utils::quote_ident;

const DATABASE_EXTENSIONS: [&str; 2] = ["db", "sqlite"];

/// How the time column is stored.
///
/// Text timestamps are compared as strings by SQLite. They must be stored as
/// `YYYY-MM-DD HH:MM:SS[.fff]` or the RFC 3339 form with a `T` separator;
/// range queries compare both with the separator folded to a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeEncoding {
    #[default]
    Text,
    UnixSeconds,
}

/// Reads SQLite exports below `root`. The database name is the file stem.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    root: PathBuf,
    time_column: String,
    time_encoding: TimeEncoding,
}

impl SqliteSource {
    pub fn new(root: &Path, time_column: &str, time_encoding: TimeEncoding) -> Self {
        Self {
            root: root.to_path_buf(),
            time_column: time_column.to_string(),
            time_encoding,
        }
    }

    fn database_path(&self, database: &str) -> SourceResult<PathBuf> {
        DATABASE_EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{}.{}", database, ext)))
            .find(|p| p.is_file())
            .ok_or_else(|| SourceError::not_found("database", database))
    }

    fn open(&self, database: &str) -> SourceResult<Connection> {
        let path = self.database_path(database)?;
        Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SourceError::query(format!("opening {:?}", path), e))
    }

    /// Open `database` and make sure `table` exists in it.
    fn open_table(&self, database: &str, table: &str) -> SourceResult<Connection> {
        let conn = self.open(database)?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SourceError::query(format!("looking up {}.{}", database, table), e))?;
        if exists.is_none() {
            return Err(SourceError::not_found("table", format!("{}.{}", database, table)));
        }
        Ok(conn)
    }

    /// Column names of `table`. Needed because SQLite reads a double-quoted
    /// unknown column as a string literal instead of failing.
    fn column_names(conn: &Connection, database: &str, table: &str) -> SourceResult<Vec<String>> {
        let query = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| SourceError::query(format!("describing {}.{}", database, table), e))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| SourceError::query(format!("describing {}.{}", database, table), e))?;
        Ok(names)
    }

    fn has_column(
        conn: &Connection,
        database: &str,
        table: &str,
        column: &str,
    ) -> SourceResult<bool> {
        Ok(Self::column_names(conn, database, table)?
            .iter()
            .any(|name| name.eq_ignore_ascii_case(column)))
    }

    fn encode_time(&self, time: DateTime<Utc>) -> Value {
        match self.time_encoding {
            TimeEncoding::Text => Value::Text(format_text_time(time)),
            TimeEncoding::UnixSeconds => Value::Integer(time.timestamp()),
        }
    }

    fn time_bound(
        &self,
        database: &str,
        table: &str,
        aggregate: &str,
    ) -> SourceResult<Option<DateTime<Utc>>> {
        let conn = self.open_table(database, table)?;
        if !Self::has_column(&conn, database, table, &self.time_column)? {
            return Err(SourceError::not_found(
                "time column",
                format!("{}.{}.{}", database, table, self.time_column),
            ));
        }
        let query = format!(
            "SELECT {}({}) FROM {}",
            aggregate,
            quote_ident(&self.time_column),
            quote_ident(table)
        );
        let value: Value = conn
            .query_row(&query, [], |row| row.get(0))
            .map_err(|e| {
                SourceError::query(format!("{} time of {}.{}", aggregate, database, table), e)
            })?;
        Ok(decode_time(value))
    }
}

impl SourceAdapter for SqliteSource {
    fn list_databases(&self) -> SourceResult<Vec<String>> {
        tracing::debug!("Listing SQLite databases under {:?}", self.root);

        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::not_found("source root", self.root.display().to_string())
            } else {
                SourceError::query(format!("reading {:?}", self.root), e)
            }
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| DATABASE_EXTENSIONS.contains(&e))
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn list_tables(&self, database: &str) -> SourceResult<Vec<String>> {
        let conn = self.open(database)?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type='table' \
                 AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .map_err(|e| SourceError::query(format!("listing tables of {}", database), e))?;

        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<Vec<String>, _>>())
            .map_err(|e| SourceError::query(format!("listing tables of {}", database), e))?;

        tracing::debug!("Found {} tables in {}", tables.len(), database);
        Ok(tables)
    }

    fn table_columns(&self, database: &str, table: &str) -> SourceResult<Vec<SourceColumn>> {
        let conn = self.open_table(database, table)?;
        Ok(Self::column_names(&conn, database, table)?
            .into_iter()
            .enumerate()
            .filter(|(_, name)| !name.eq_ignore_ascii_case(&self.time_column))
            .map(|(position, name)| SourceColumn { name, position })
            .collect())
    }

    fn controller_id(
        &self,
        database: &str,
        info_table: &str,
        column: &str,
    ) -> SourceResult<Option<String>> {
        let conn = self.open_table(database, info_table)?;
        if !Self::has_column(&conn, database, info_table, column)? {
            return Ok(None);
        }
        let query = format!(
            "SELECT {} FROM {} LIMIT 1",
            quote_ident(column),
            quote_ident(info_table)
        );
        let value: Option<Value> = conn
            .query_row(&query, [], |row| row.get(0))
            .optional()
            .map_err(|e| {
                let what = format!("reading info row of {}.{}", database, info_table);
                SourceError::query(what, e)
            })?;

        Ok(match value {
            Some(Value::Text(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Integer(i)) => Some(i.to_string()),
            _ => None,
        })
    }

    fn query_range(
        &self,
        database: &str,
        table: &str,
        columns: &[String],
        range: TimeRange,
    ) -> SourceResult<Vec<SourceRow>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open_table(database, table)?;

        let mut select = vec![quote_ident(&self.time_column)];
        select.extend(columns.iter().map(|c| quote_ident(c)));
        let time = quote_ident(&self.time_column);
        let compared = match self.time_encoding {
            TimeEncoding::Text => format!("replace({}, 'T', ' ')", time),
            TimeEncoding::UnixSeconds => time.clone(),
        };
        let query = format!(
            "SELECT {} FROM {} WHERE {} >= ?1 AND {} < ?2 ORDER BY {}",
            select.join(", "),
            quote_ident(table),
            compared,
            compared,
            time
        );

        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| {
                let what = format!("preparing range query on {}.{}", database, table);
                SourceError::query(what, e)
            })?;

        let raw = stmt
            .query_map(
                [self.encode_time(range.start), self.encode_time(range.end)],
                |row| {
                    let time: Value = row.get(0)?;
                    let mut values = Vec::with_capacity(columns.len());
                    for idx in 0..columns.len() {
                        values.push(numeric(row.get::<_, Value>(idx + 1)?));
                    }
                    Ok((time, values))
                },
            )
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| SourceError::query(format!("reading {}.{}", database, table), e))?;

        let mut rows = Vec::with_capacity(raw.len());
        for (time, values) in raw {
            match decode_time(time) {
                Some(time) => rows.push(SourceRow { time, values }),
                None => tracing::warn!(
                    "Skipping row with unreadable {} in {}.{}",
                    self.time_column,
                    database,
                    table
                ),
            }
        }
        Ok(rows)
    }

    fn first_time(&self, database: &str, table: &str) -> SourceResult<Option<DateTime<Utc>>> {
        self.time_bound(database, table, "MIN")
    }

    fn last_write_time(&self, database: &str, table: &str) -> SourceResult<Option<DateTime<Utc>>> {
        self.time_bound(database, table, "MAX")
    }
}

/// Widen a cell to `f64`. Numeric text is accepted; anything else reads as null.
fn numeric(value: Value) -> Option<f64> {
    match value {
        Value::Real(v) if v.is_finite() => Some(v),
        Value::Integer(v) => Some(v as f64),
        Value::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn decode_time(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(secs) => Utc.timestamp_opt(secs, 0).single(),
        Value::Real(secs) if secs.is_finite() => {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9) as u32;
            Utc.timestamp_opt(whole as i64, nanos).single()
        }
        Value::Text(s) => parse_text_time(&s),
        _ => None,
    }
}

fn parse_text_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Render a bound in the same shape exports use, so string comparison orders
/// correctly. Whole seconds omit the fraction.
fn format_text_time(time: DateTime<Utc>) -> String {
    if time.timestamp_subsec_nanos() == 0 {
        time.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        time.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_db(root: &Path, name: &str, ddl: &str) {
        let conn = Connection::open(root.join(format!("{}.db", name))).unwrap();
        conn.execute_batch(ddl).unwrap();
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn fixture() -> (tempfile::TempDir, SqliteSource) {
        let dir = tempdir().unwrap();
        create_db(
            dir.path(),
            "SiteA_DATA",
            r#"
            CREATE TABLE "Ctrl_1_Info" (ControllerId TEXT, Name TEXT);
            INSERT INTO "Ctrl_1_Info" VALUES ('4711', 'Substation North');
            CREATE TABLE "Ctrl_1_Data" (Time TEXT, dp0 REAL, dp1 REAL, dp2 TEXT);
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:00:00', 10.5, NULL, '3.2');
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:15:00', 11.0, 7, 'n/a');
            INSERT INTO "Ctrl_1_Data" VALUES ('2024-05-01 10:30:00', NULL, NULL, NULL);
            "#,
        );
        std::fs::write(dir.path().join("notes.txt"), "not a database").unwrap();
        let source = SqliteSource::new(dir.path(), "Time", TimeEncoding::Text);
        (dir, source)
    }

    #[test]
    fn test_list_databases_and_tables() {
        let (_dir, source) = fixture();
        assert_eq!(source.list_databases().unwrap(), vec!["SiteA_DATA"]);
        assert_eq!(
            source.list_tables("SiteA_DATA").unwrap(),
            vec!["Ctrl_1_Data", "Ctrl_1_Info"]
        );
    }

    #[test]
    fn test_missing_objects_are_not_found() {
        let (_dir, source) = fixture();
        assert!(source.list_tables("Nope_DATA").unwrap_err().is_not_found());
        assert!(source
            .table_columns("SiteA_DATA", "Ctrl_9_Data")
            .unwrap_err()
            .is_not_found());

        let missing_root =
            SqliteSource::new(Path::new("/nonexistent/exports"), "Time", TimeEncoding::Text);
        assert!(missing_root.list_databases().unwrap_err().is_not_found());
    }

    #[test]
    fn test_table_columns_skip_time() {
        let (_dir, source) = fixture();
        let columns = source.table_columns("SiteA_DATA", "Ctrl_1_Data").unwrap();
        assert_eq!(
            columns,
            vec![
                SourceColumn::new("dp0", 1),
                SourceColumn::new("dp1", 2),
                SourceColumn::new("dp2", 3),
            ]
        );
    }

    #[test]
    fn test_controller_id() {
        let (_dir, source) = fixture();
        assert_eq!(
            source
                .controller_id("SiteA_DATA", "Ctrl_1_Info", "ControllerId")
                .unwrap(),
            Some("4711".to_string())
        );
    }

    #[test]
    fn test_query_range_keeps_nulls_per_cell() {
        let (_dir, source) = fixture();
        let columns = vec!["dp0".to_string(), "dp1".to_string(), "dp2".to_string()];
        let rows = source
            .query_range(
                "SiteA_DATA",
                "Ctrl_1_Data",
                &columns,
                TimeRange::new(ts(10, 0), ts(10, 30)),
            )
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, ts(10, 0));
        assert_eq!(rows[0].values, vec![Some(10.5), None, Some(3.2)]);
        assert_eq!(rows[1].values, vec![Some(11.0), Some(7.0), None]);
    }

    #[test]
    fn test_time_bounds() {
        let (_dir, source) = fixture();
        assert_eq!(source.first_time("SiteA_DATA", "Ctrl_1_Data").unwrap(), Some(ts(10, 0)));
        assert_eq!(
            source.last_write_time("SiteA_DATA", "Ctrl_1_Data").unwrap(),
            Some(ts(10, 30))
        );
        assert!(source
            .last_write_time("SiteA_DATA", "Ctrl_9_Data")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_unix_seconds_encoding() {
        let dir = tempdir().unwrap();
        create_db(
            dir.path(),
            "Plant_DATA",
            r#"
            CREATE TABLE "Line_Data" (Time INTEGER, flow REAL);
            INSERT INTO "Line_Data" VALUES (1714557600, 1.5);
            INSERT INTO "Line_Data" VALUES (1714561200, 2.5);
            "#,
        );
        let source = SqliteSource::new(dir.path(), "Time", TimeEncoding::UnixSeconds);
        let rows = source
            .query_range(
                "Plant_DATA",
                "Line_Data",
                &["flow".to_string()],
                TimeRange::new(ts(10, 0), ts(11, 0)),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, ts(10, 0));
    }

    #[test]
    fn test_rfc3339_rows_fall_inside_their_range() {
        let dir = tempdir().unwrap();
        create_db(
            dir.path(),
            "Plant_DATA",
            r#"
            CREATE TABLE "Line_Data" (Time TEXT, flow REAL);
            INSERT INTO "Line_Data" VALUES ('2024-05-01T09:59:59Z', 0.5);
            INSERT INTO "Line_Data" VALUES ('2024-05-01T10:00:00Z', 1.5);
            INSERT INTO "Line_Data" VALUES ('2024-05-01T10:20:00Z', 2.5);
            INSERT INTO "Line_Data" VALUES ('2024-05-01T10:30:00Z', 3.5);
            "#,
        );
        let source = SqliteSource::new(dir.path(), "Time", TimeEncoding::Text);
        let rows = source
            .query_range(
                "Plant_DATA",
                "Line_Data",
                &["flow".to_string()],
                TimeRange::new(ts(10, 0), ts(10, 30)),
            )
            .unwrap();

        let times: Vec<DateTime<Utc>> = rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![ts(10, 0), ts(10, 20)]);
    }

    #[test]
    fn test_text_time_formats() {
        assert_eq!(parse_text_time("2024-05-01 10:00:00"), Some(ts(10, 0)));
        assert_eq!(parse_text_time("2024-05-01T10:00:00Z"), Some(ts(10, 0)));
        assert_eq!(parse_text_time("2024-05-01 10:00:00.000"), Some(ts(10, 0)));
        assert_eq!(parse_text_time("yesterday"), None);
        assert_eq!(format_text_time(ts(10, 0)), "2024-05-01 10:00:00");
    }
}
