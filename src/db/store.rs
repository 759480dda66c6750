//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("address already exists")]
    Conflict,
    #[error("not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// A single connection behind a mutex serializes writes; the mutex is held per
/// statement, never across a probe cycle.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

impl Store {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| DbError::Migration(format!("create db dir: {}", e)))?;
            }
        }

        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("migration failed: {}", e)))?;
        Ok(())
    }

    // --- Monitor records ---

    /// Atomically insert a record, assigning id and created_at.
    pub fn save_record(&self, record: &mut MonitorRecord) -> Result<(), DbError> {
        let created_at = record.created_at.unwrap_or_else(Utc::now);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitor_records (created_at, target, latency_ms, packet_loss, trace_json, speed_up, speed_down)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fmt_time(created_at),
                record.target,
                record.latency_ms,
                record.packet_loss,
                record.trace_json,
                record.speed_up,
                record.speed_down,
            ],
        )?;
        record.id = conn.last_insert_rowid();
        record.created_at = Some(created_at);
        Ok(())
    }

    /// Records for a target within a time range, ascending by created_at.
    ///
    /// The projection excludes `trace_json` to keep chart queries cheap.
    pub fn get_history(
        &self,
        target: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MonitorRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, target, latency_ms, packet_loss, speed_up, speed_down
             FROM monitor_records
             WHERE target = ?1 AND created_at BETWEEN ?2 AND ?3
             ORDER BY created_at ASC",
        )?;

        let records = stmt
            .query_map(params![target, fmt_time(start), fmt_time(end)], |row| {
                let time_str: String = row.get(1)?;
                Ok(MonitorRecord {
                    id: row.get(0)?,
                    created_at: parse_db_time(&time_str),
                    target: row.get(2)?,
                    latency_ms: row.get(3)?,
                    packet_loss: row.get(4)?,
                    trace_json: None,
                    speed_up: row.get(5)?,
                    speed_down: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Full record including the trace blob.
    pub fn get_record_detail(&self, id: i64) -> Result<MonitorRecord, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, target, latency_ms, packet_loss, trace_json, speed_up, speed_down
             FROM monitor_records WHERE id = ?1",
            params![id],
            row_to_record,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Most recent record for a target, regardless of flavor.
    pub fn get_latest_record(&self, target: &str) -> Result<MonitorRecord, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, target, latency_ms, packet_loss, trace_json, speed_up, speed_down
             FROM monitor_records WHERE target = ?1
             ORDER BY created_at DESC LIMIT 1",
            params![target],
            row_to_record,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Most recent record for a target that carries trace data.
    pub fn get_latest_trace(&self, target: &str) -> Result<MonitorRecord, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, target, latency_ms, packet_loss, trace_json, speed_up, speed_down
             FROM monitor_records
             WHERE target = ?1 AND trace_json IS NOT NULL AND length(trace_json) > 0
             ORDER BY created_at DESC LIMIT 1",
            params![target],
            row_to_record,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // --- Target CRUD ---

    /// Insert a new target. A duplicate address yields `DbError::Conflict`.
    pub fn create_target(&self, target: &mut Target) -> Result<(), DbError> {
        let now = Utc::now();
        target.created_at = now;
        target.updated_at = now;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO targets (created_at, updated_at, name, address, description, enabled, probe_type, probe_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fmt_time(now),
                fmt_time(now),
                target.name,
                target.address,
                target.description,
                target.enabled,
                target.probe_type,
                target.probe_config,
            ],
        )
        .map_err(map_constraint)?;
        target.id = conn.last_insert_rowid();
        Ok(())
    }

    /// Update an existing target by id. `created_at` is never touched.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE targets SET updated_at=?1, name=?2, address=?3, description=?4, enabled=?5, probe_type=?6, probe_config=?7
                 WHERE id=?8",
                params![
                    fmt_time(Utc::now()),
                    target.name,
                    target.address,
                    target.description,
                    target.enabled,
                    target.probe_type,
                    target.probe_config,
                    target.id,
                ],
            )
            .map_err(map_constraint)?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_TARGET),
            params![id],
            row_to_target,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All targets, optionally restricted to enabled ones.
    pub fn get_targets(&self, only_enabled: bool) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = if only_enabled {
            format!("{} WHERE enabled = 1 ORDER BY id", SELECT_TARGET)
        } else {
            format!("{} ORDER BY id", SELECT_TARGET)
        };
        let mut stmt = conn.prepare(&sql)?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Memoize the last probe failure on the target row.
    pub fn update_target_error(&self, address: &str, message: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE targets SET last_error = ?1, last_error_at = ?2 WHERE address = ?3",
            params![message, fmt_time(Utc::now()), address],
        )?;
        Ok(())
    }

    /// Clear the error memo after a successful probe.
    pub fn clear_target_error(&self, address: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE targets SET last_error = NULL, last_error_at = NULL WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    // --- Users ---

    pub fn get_user(&self, username: &str) -> Result<User, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, username, password FROM users WHERE username = ?1",
            params![username],
            row_to_user,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// First user in the database. Single-user system: this is the admin.
    pub fn get_first_user(&self) -> Result<User, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, created_at, username, password FROM users ORDER BY id LIMIT 1",
            [],
            row_to_user,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Whether any user exists; drives the setup gate.
    pub fn has_any_user(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    pub fn save_user(&self, user: &mut User) -> Result<(), DbError> {
        let now = Utc::now();
        user.created_at = now;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (created_at, username, password) VALUES (?1, ?2, ?3)",
            params![fmt_time(now), user.username, user.password],
        )
        .map_err(map_constraint)?;
        user.id = conn.last_insert_rowid();
        Ok(())
    }

    /// Targeted password update by id. Never an upsert: re-creating the row
    /// would collide with the unique username index.
    pub fn update_user_password(&self, id: i64, hashed: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE users SET password = ?1 WHERE id = ?2",
            params![hashed, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Database management ---

    /// Delete records older than `days` days; returns the affected row count.
    pub fn clean_old_records(&self, days: i64) -> Result<usize, DbError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM monitor_records WHERE created_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Reclaim space.
    pub fn vacuum(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn database_stats(&self, db_path: &str, retention_days: i64) -> Result<DatabaseStats, DbError> {
        let size_bytes = std::fs::metadata(db_path).map(|m| m.len() as i64).unwrap_or(0);

        let conn = self.conn.lock().unwrap();
        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM monitor_records", [], |r| r.get(0))?;
        let target_count: i64 = conn.query_row("SELECT COUNT(*) FROM targets", [], |r| r.get(0))?;

        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(created_at) FROM monitor_records",
            [],
            |r| r.get(0),
        )?;
        let newest: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM monitor_records",
            [],
            |r| r.get(0),
        )?;

        Ok(DatabaseStats {
            size_bytes,
            size_human: format_bytes(size_bytes),
            record_count,
            target_count,
            oldest_record: oldest
                .and_then(|s| parse_db_time(&s))
                .map(|t| t.to_rfc3339()),
            newest_record: newest
                .and_then(|s| parse_db_time(&s))
                .map(|t| t.to_rfc3339()),
            retention_days,
        })
    }
}

const SELECT_TARGET: &str = "SELECT id, created_at, updated_at, name, address, description, enabled, probe_type, probe_config, last_error, last_error_at FROM targets";

fn row_to_target(row: &rusqlite::Row<'_>) -> SqlResult<Target> {
    let created: String = row.get(1)?;
    let updated: String = row.get(2)?;
    let error_at: Option<String> = row.get(10)?;
    Ok(Target {
        id: row.get(0)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated).unwrap_or_else(Utc::now),
        name: row.get(3)?,
        address: row.get(4)?,
        description: row.get(5)?,
        enabled: row.get(6)?,
        probe_type: row.get(7)?,
        probe_config: row.get(8)?,
        last_error: row.get(9)?,
        last_error_at: error_at.and_then(|s| parse_db_time(&s)),
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> SqlResult<MonitorRecord> {
    let time_str: String = row.get(1)?;
    Ok(MonitorRecord {
        id: row.get(0)?,
        created_at: parse_db_time(&time_str),
        target: row.get(2)?,
        latency_ms: row.get(3)?,
        packet_loss: row.get(4)?,
        trace_json: row.get(5)?,
        speed_up: row.get(6)?,
        speed_down: row.get(7)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> SqlResult<User> {
    let created: String = row.get(1)?;
    Ok(User {
        id: row.get(0)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
        username: row.get(2)?,
        password: row.get(3)?,
    })
}

/// Map unique-index violations onto the conflict error kind.
fn map_constraint(e: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return DbError::Conflict;
        }
    }
    DbError::Sqlite(e)
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target(address: &str) -> Target {
        Target {
            name: "Test".to_string(),
            address: address.to_string(),
            probe_type: PROBE_MODE_ICMP.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_crud() {
        let store = Store::open_in_memory().unwrap();

        let mut target = sample_target("example.com");
        store.create_target(&mut target).unwrap();
        assert!(target.id > 0);

        let fetched = store.get_target(target.id).unwrap();
        assert_eq!(fetched.name, "Test");
        assert!(fetched.enabled);

        let mut updated = fetched.clone();
        updated.name = "Updated".to_string();
        store.update_target(&updated).unwrap();

        let fetched2 = store.get_target(target.id).unwrap();
        assert_eq!(fetched2.name, "Updated");
        // created_at survives updates
        assert_eq!(
            fetched2.created_at.timestamp(),
            fetched.created_at.timestamp()
        );

        store.delete_target(target.id).unwrap();
        assert!(matches!(
            store.get_target(target.id),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_duplicate_address_conflicts() {
        let store = Store::open_in_memory().unwrap();

        let mut a = sample_target("8.8.8.8");
        store.create_target(&mut a).unwrap();

        let mut b = sample_target("8.8.8.8");
        assert!(matches!(
            store.create_target(&mut b),
            Err(DbError::Conflict)
        ));
    }

    #[test]
    fn test_history_excludes_trace_blob() {
        let store = Store::open_in_memory().unwrap();

        let mut rec = MonitorRecord {
            target: "8.8.8.8".to_string(),
            latency_ms: 12.5,
            packet_loss: 0.0,
            trace_json: Some(br#"{"target":"8.8.8.8","hops":[]}"#.to_vec()),
            ..Default::default()
        };
        store.save_record(&mut rec).unwrap();
        assert!(rec.id > 0);

        let start = Utc::now() - ChronoDuration::hours(1);
        let end = Utc::now() + ChronoDuration::hours(1);
        let history = store.get_history("8.8.8.8", start, end).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].trace_json.is_none());

        let detail = store.get_record_detail(rec.id).unwrap();
        assert!(detail.trace_json.is_some());
    }

    #[test]
    fn test_latest_trace_skips_speed_samples() {
        let store = Store::open_in_memory().unwrap();

        let mut with_trace = MonitorRecord {
            target: "t".to_string(),
            latency_ms: 5.0,
            trace_json: Some(b"{}".to_vec()),
            ..Default::default()
        };
        store.save_record(&mut with_trace).unwrap();

        let mut speed_only = MonitorRecord {
            target: "t".to_string(),
            created_at: Some(Utc::now() + ChronoDuration::seconds(5)),
            speed_down: 95.0,
            speed_up: 40.0,
            ..Default::default()
        };
        store.save_record(&mut speed_only).unwrap();

        let latest = store.get_latest_record("t").unwrap();
        assert_eq!(latest.id, speed_only.id);

        let latest_trace = store.get_latest_trace("t").unwrap();
        assert_eq!(latest_trace.id, with_trace.id);
    }

    #[test]
    fn test_user_lifecycle_and_setup_gate() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.has_any_user());

        let mut user = User {
            id: 0,
            created_at: Utc::now(),
            username: "admin".to_string(),
            password: "$2b$12$hash".to_string(),
        };
        store.save_user(&mut user).unwrap();
        assert!(store.has_any_user());

        store.update_user_password(user.id, "$2b$12$other").unwrap();
        let fetched = store.get_user("admin").unwrap();
        assert_eq!(fetched.password, "$2b$12$other");
        assert_eq!(fetched.id, user.id);

        // duplicate usernames rejected
        let mut dup = User {
            id: 0,
            created_at: Utc::now(),
            username: "admin".to_string(),
            password: "x".to_string(),
        };
        assert!(matches!(store.save_user(&mut dup), Err(DbError::Conflict)));
    }

    #[test]
    fn test_clean_old_records() {
        let store = Store::open_in_memory().unwrap();

        let mut old = MonitorRecord {
            target: "t".to_string(),
            created_at: Some(Utc::now() - ChronoDuration::days(10)),
            latency_ms: 1.0,
            ..Default::default()
        };
        store.save_record(&mut old).unwrap();

        let mut fresh = MonitorRecord {
            target: "t".to_string(),
            latency_ms: 2.0,
            ..Default::default()
        };
        store.save_record(&mut fresh).unwrap();

        let deleted = store.clean_old_records(7).unwrap();
        assert_eq!(deleted, 1);

        // days=0 wipes everything that is in the past
        let deleted = store.clean_old_records(0).unwrap();
        assert_eq!(deleted, 1);

        let start = Utc::now() - ChronoDuration::days(30);
        let end = Utc::now() + ChronoDuration::days(1);
        assert!(store.get_history("t", start, end).unwrap().is_empty());
    }

    #[test]
    fn test_error_memo_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut target = sample_target("10.0.0.1");
        store.create_target(&mut target).unwrap();

        store
            .update_target_error("10.0.0.1", "SSH: Connection refused - check host/port")
            .unwrap();
        let t = store.get_target(target.id).unwrap();
        assert!(t.last_error.as_deref().unwrap().contains("refused"));
        assert!(t.last_error_at.is_some());

        store.clear_target_error("10.0.0.1").unwrap();
        let t = store.get_target(target.id).unwrap();
        assert!(t.last_error.is_none());
        assert!(t.last_error_at.is_none());
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2025-06-01 10:20:30.123456789").is_some());
        assert!(parse_db_time("2025-06-01 10:20:30").is_some());
        assert!(parse_db_time("2025-06-01T10:20:30Z").is_some());
        assert!(parse_db_time("not a time").is_none());
    }
}
