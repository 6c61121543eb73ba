use std::ops::Bound;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use medbox_core::{
    DoseRecord, DoseStatus, RecordFilter, RecordId, RecordStore, RecurrenceRule, Reminder,
    ReminderId, ReminderStore, SortOrder, StatusTransition, StoreError,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reminders (
  reminder_id TEXT PRIMARY KEY,
  medicine_box_id TEXT NOT NULL,
  device_id TEXT NOT NULL,
  box_number INTEGER NOT NULL CHECK (box_number >= 1),
  user_id TEXT,
  medicine_name TEXT,
  recurrence_json TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dose_records (
  record_id TEXT PRIMARY KEY,
  reminder_id TEXT NOT NULL,
  medicine_box_id TEXT NOT NULL,
  box_number INTEGER NOT NULL CHECK (box_number >= 1),
  device_id TEXT NOT NULL,
  user_id TEXT,
  scheduled_time INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('upcoming','completed','missed')),
  taken_time TEXT,
  CHECK ((status = 'completed') = (taken_time IS NOT NULL)),
  UNIQUE(reminder_id, scheduled_time)
);

CREATE INDEX IF NOT EXISTS idx_reminders_box ON reminders(medicine_box_id);
CREATE INDEX IF NOT EXISTS idx_dose_records_scheduled ON dose_records(scheduled_time);
CREATE INDEX IF NOT EXISTS idx_dose_records_device_status
  ON dose_records(device_id, box_number, status, scheduled_time);
CREATE INDEX IF NOT EXISTS idx_dose_records_status_scheduled
  ON dose_records(status, scheduled_time);
";

const RECORD_COLUMNS: &str = "record_id, reminder_id, medicine_box_id, box_number, device_id, \
                              user_id, scheduled_time, status, taken_time";

const REMINDER_COLUMNS: &str = "reminder_id, medicine_box_id, device_id, box_number, user_id, \
                                medicine_name, recurrence_json, active";

/// `SQLite` binding of both store contracts. One connection per instance;
/// open one store per thread or request.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_existing_tables: bool,
}

impl SqliteStore {
    /// Open a SQLite-backed dose store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_existing_tables) =
            detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_existing_tables,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to begin migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
            tracing::info!(version = 1, "applied dose store migration");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or replace one reminder definition.
    ///
    /// # Errors
    /// Returns an error when the recurrence rule cannot be encoded or the write fails.
    pub fn upsert_reminder(&self, reminder: &Reminder) -> Result<()> {
        let recurrence_json = serde_json::to_string(&reminder.recurrence)
            .context("failed to encode recurrence rule")?;
        self.conn
            .execute(
                "INSERT INTO reminders(
                   reminder_id, medicine_box_id, device_id, box_number, user_id,
                   medicine_name, recurrence_json, active, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(reminder_id) DO UPDATE SET
                   medicine_box_id = excluded.medicine_box_id,
                   device_id = excluded.device_id,
                   box_number = excluded.box_number,
                   user_id = excluded.user_id,
                   medicine_name = excluded.medicine_name,
                   recurrence_json = excluded.recurrence_json,
                   active = excluded.active,
                   updated_at = excluded.updated_at",
                params![
                    reminder.reminder_id.to_string(),
                    reminder.medicine_box_id,
                    reminder.device_id,
                    reminder.box_number,
                    reminder.user_id,
                    reminder.medicine_name,
                    recurrence_json,
                    reminder.active,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to upsert reminder {}", reminder.reminder_id))?;
        Ok(())
    }

    /// Delete one reminder and return the definition that was removed.
    ///
    /// # Errors
    /// Returns an error when the reminder cannot be read or deleted.
    pub fn delete_reminder(&mut self, reminder_id: ReminderId) -> Result<Option<Reminder>> {
        let tx = self.conn.transaction().context("failed to begin reminder delete")?;
        let existing = load_reminder(&tx, reminder_id)?;
        if existing.is_some() {
            tx.execute("DELETE FROM reminders WHERE reminder_id = ?1", params![reminder_id.to_string()])
                .with_context(|| format!("failed to delete reminder {reminder_id}"))?;
        }
        tx.commit().context("failed to commit reminder delete")?;
        Ok(existing)
    }

    fn find_records(
        &self,
        filter: &RecordFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<DoseRecord>> {
        let (where_sql, mut values) = where_clause(filter)?;
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM dose_records{where_sql} \
             ORDER BY scheduled_time {direction}, record_id {direction}"
        );
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare dose record query")?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_record(row)?);
        }
        Ok(records)
    }

    fn insert_record(&self, record: &DoseRecord) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO dose_records(
                   record_id, reminder_id, medicine_box_id, box_number, device_id,
                   user_id, scheduled_time, status, taken_time
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT DO NOTHING",
                params![
                    record.record_id.to_string(),
                    record.reminder_id.to_string(),
                    record.medicine_box_id,
                    record.box_number,
                    record.device_id,
                    record.user_id,
                    unix_nanos(record.scheduled_time)?,
                    record.status.as_str(),
                    record.taken_time.map(rfc3339).transpose()?,
                ],
            )
            .with_context(|| format!("failed to insert dose record {}", record.record_id))?;
        Ok(changed == 1)
    }

    fn update_status(
        &self,
        record_id: RecordId,
        expected: DoseStatus,
        transition: &StatusTransition,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE dose_records SET status = ?1, taken_time = ?2
                 WHERE record_id = ?3 AND status = ?4",
                params![
                    transition.to().as_str(),
                    transition.taken_time().map(rfc3339).transpose()?,
                    record_id.to_string(),
                    expected.as_str(),
                ],
            )
            .with_context(|| format!("failed to update status of dose record {record_id}"))?;
        Ok(changed == 1)
    }

    fn delete_records(&self, filter: &RecordFilter) -> Result<usize> {
        let (where_sql, values) = where_clause(filter)?;
        self.conn
            .execute(&format!("DELETE FROM dose_records{where_sql}"), params_from_iter(values.iter()))
            .with_context(|| format!("failed to delete dose records [{filter}]"))
    }

    fn query_reminders(&self, where_sql: &str, value: Option<&str>) -> Result<Vec<Reminder>> {
        let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders{where_sql} ORDER BY reminder_id");
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare reminder query")?;
        let mut rows = match value {
            Some(value) => stmt.query(params![value])?,
            None => stmt.query([])?,
        };
        let mut reminders = Vec::new();
        while let Some(row) = rows.next()? {
            reminders.push(decode_reminder(row)?);
        }
        Ok(reminders)
    }
}

impl RecordStore for SqliteStore {
    fn find(
        &self,
        filter: &RecordFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<DoseRecord>, StoreError> {
        self.find_records(filter, order, limit).map_err(store_error)
    }

    fn insert_if_absent(&self, record: &DoseRecord) -> std::result::Result<bool, StoreError> {
        self.insert_record(record).map_err(store_error)
    }

    fn conditional_update(
        &self,
        record_id: RecordId,
        expected: DoseStatus,
        transition: &StatusTransition,
    ) -> std::result::Result<bool, StoreError> {
        self.update_status(record_id, expected, transition).map_err(store_error)
    }

    fn delete_many(&self, filter: &RecordFilter) -> std::result::Result<usize, StoreError> {
        self.delete_records(filter).map_err(store_error)
    }
}

impl ReminderStore for SqliteStore {
    fn get(&self, reminder_id: ReminderId) -> std::result::Result<Option<Reminder>, StoreError> {
        load_reminder(&self.conn, reminder_id).map_err(store_error)
    }

    fn list(&self, medicine_box_id: &str) -> std::result::Result<Vec<Reminder>, StoreError> {
        self.query_reminders(" WHERE medicine_box_id = ?1", Some(medicine_box_id))
            .map_err(store_error)
    }

    fn list_active(&self) -> std::result::Result<Vec<Reminder>, StoreError> {
        self.query_reminders(" WHERE active = 1", None).map_err(store_error)
    }
}

/// Rows that fail to decode surface as [`StoreError::Decode`]; everything else
/// is a backend failure.
fn store_error(err: anyhow::Error) -> StoreError {
    if err.is::<DecodeFailure>() {
        StoreError::Decode(format!("{err:#}"))
    } else {
        StoreError::Backend(format!("{err:#}"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DecodeFailure(String);

fn where_clause(filter: &RecordFilter) -> Result<(String, Vec<Value>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(id) = filter.record_id {
        clauses.push("record_id = ?");
        values.push(Value::Text(id.to_string()));
    }
    if let Some(id) = filter.reminder_id {
        clauses.push("reminder_id = ?");
        values.push(Value::Text(id.to_string()));
    }
    if let Some(id) = &filter.medicine_box_id {
        clauses.push("medicine_box_id = ?");
        values.push(Value::Text(id.clone()));
    }
    if let Some(id) = &filter.device_id {
        clauses.push("device_id = ?");
        values.push(Value::Text(id.clone()));
    }
    if let Some(number) = filter.box_number {
        clauses.push("box_number = ?");
        values.push(Value::Integer(i64::from(number)));
    }
    if let Some(id) = &filter.user_id {
        clauses.push("user_id = ?");
        values.push(Value::Text(id.clone()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    match filter.scheduled_start {
        Bound::Included(at) => {
            clauses.push("scheduled_time >= ?");
            values.push(Value::Integer(unix_nanos(at)?));
        }
        Bound::Excluded(at) => {
            clauses.push("scheduled_time > ?");
            values.push(Value::Integer(unix_nanos(at)?));
        }
        Bound::Unbounded => {}
    }
    match filter.scheduled_end {
        Bound::Included(at) => {
            clauses.push("scheduled_time <= ?");
            values.push(Value::Integer(unix_nanos(at)?));
        }
        Bound::Excluded(at) => {
            clauses.push("scheduled_time < ?");
            values.push(Value::Integer(unix_nanos(at)?));
        }
        Bound::Unbounded => {}
    }

    if clauses.is_empty() {
        Ok((String::new(), values))
    } else {
        Ok((format!(" WHERE {}", clauses.join(" AND ")), values))
    }
}

fn decode_record(row: &Row<'_>) -> Result<DoseRecord> {
    let record_id: String = row.get(0)?;
    let reminder_id: String = row.get(1)?;
    let status: String = row.get(7)?;
    let taken_time: Option<String> = row.get(8)?;

    Ok(DoseRecord {
        record_id: parse_id(&record_id)?,
        reminder_id: parse_id(&reminder_id)?,
        medicine_box_id: row.get(2)?,
        box_number: row.get(3)?,
        device_id: row.get(4)?,
        user_id: row.get(5)?,
        scheduled_time: from_unix_nanos(row.get(6)?)?,
        status: DoseStatus::parse(&status)
            .ok_or_else(|| DecodeFailure(format!("unknown dose status: {status}")))?,
        taken_time: taken_time.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn decode_reminder(row: &Row<'_>) -> Result<Reminder> {
    let reminder_id: String = row.get(0)?;
    let recurrence_json: String = row.get(6)?;
    let recurrence: RecurrenceRule = serde_json::from_str(&recurrence_json).map_err(|err| {
        DecodeFailure(format!("invalid recurrence rule for reminder {reminder_id}: {err}"))
    })?;

    Ok(Reminder {
        reminder_id: parse_id(&reminder_id)?,
        medicine_box_id: row.get(1)?,
        device_id: row.get(2)?,
        box_number: row.get(3)?,
        user_id: row.get(4)?,
        medicine_name: row.get(5)?,
        recurrence,
        active: row.get(7)?,
    })
}

fn load_reminder(conn: &Connection, reminder_id: ReminderId) -> Result<Option<Reminder>> {
    conn.query_row(
        &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE reminder_id = ?1"),
        params![reminder_id.to_string()],
        |row| Ok(decode_reminder(row)),
    )
    .optional()
    .with_context(|| format!("failed to load reminder {reminder_id}"))?
    .transpose()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let has_records = table_exists(conn, "dose_records")?;
    let has_reminders = table_exists(conn, "reminders")?;
    match (has_records, has_reminders) {
        (false, false) => Ok((0, false)),
        (true, true) => Ok((1, true)),
        _ => Err(anyhow!(
            "database schema is invalid: dose_records and reminders must exist together"
        )),
    }
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| DecodeFailure(format!("invalid stored timestamp {value}: {err}")).into())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(time::UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DecodeFailure(format!("invalid RFC3339 timestamp {value}: {err}")).into())
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = ulid::DecodeError>,
{
    raw.parse().map_err(|err| DecodeFailure(format!("invalid ULID {raw}: {err}")).into())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use medbox_core::{
        DeviceCompletion, EngineConfig, EngineError, LifecycleEngine, ManualClock, TimeOfDay,
    };
    use time::macros::{date, datetime};
    use time::Duration;
    use ulid::Ulid;

    fn open_memory() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_reminder(hour: u8) -> Result<Reminder> {
        Ok(Reminder {
            reminder_id: ReminderId::new(),
            medicine_box_id: "box-1".to_string(),
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
            user_id: Some("user-1".to_string()),
            medicine_name: Some("metformin".to_string()),
            recurrence: RecurrenceRule {
                times_of_day: vec![TimeOfDay::new(hour, 0)?],
                start_date: date!(2024 - 01 - 01),
                end_date: None,
                days_of_week: vec![],
            },
            active: true,
        })
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("medbox-store-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_existing_tables);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn schema_checks_reject_inconsistent_taken_time() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        let record = DoseRecord::upcoming(&reminder, datetime!(2024-01-02 08:00 UTC));

        let inconsistent = store.conn.execute(
            "INSERT INTO dose_records(
               record_id, reminder_id, medicine_box_id, box_number, device_id,
               user_id, scheduled_time, status, taken_time
             ) VALUES (?1, ?2, 'box-1', 3, 'dev', NULL, 0, 'completed', NULL)",
            params![record.record_id.to_string(), record.reminder_id.to_string()],
        );
        assert!(inconsistent.is_err());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn insert_if_absent_keeps_one_record_per_slot() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        let first = DoseRecord::upcoming(&reminder, datetime!(2024-01-02 08:00 UTC));
        let duplicate = DoseRecord::upcoming(&reminder, datetime!(2024-01-02 08:00 UTC));

        assert_eq!(store.insert_if_absent(&first), Ok(true));
        assert_eq!(store.insert_if_absent(&duplicate), Ok(false));
        assert_eq!(store.insert_if_absent(&first), Ok(false));
        assert_eq!(store.find(&RecordFilter::all(), SortOrder::Ascending, None), Ok(vec![first]));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn filters_order_and_limit_match_memory_semantics() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        let mut inserted = Vec::new();
        for hour in [20, 8, 12] {
            let record =
                DoseRecord::upcoming(&reminder, datetime!(2024-01-02 00:00 UTC) + Duration::hours(hour));
            store.insert_if_absent(&record).map_err(|err| anyhow!(err))?;
            inserted.push(record);
        }

        let day = RecordFilter::all()
            .device("esp32-kitchen", 3)
            .status(DoseStatus::Upcoming)
            .scheduled(datetime!(2024-01-02 08:00 UTC)..datetime!(2024-01-02 20:00 UTC));
        let found = store.find(&day, SortOrder::Ascending, None).map_err(|err| anyhow!(err))?;
        let times = found.iter().map(|record| record.scheduled_time).collect::<Vec<_>>();
        assert_eq!(times, vec![datetime!(2024-01-02 08:00 UTC), datetime!(2024-01-02 12:00 UTC)]);

        let latest = store
            .find(&RecordFilter::all().user("user-1"), SortOrder::Descending, Some(1))
            .map_err(|err| anyhow!(err))?;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].scheduled_time, datetime!(2024-01-02 20:00 UTC));

        assert_eq!(
            store.find(&RecordFilter::all().user("nobody"), SortOrder::Ascending, None),
            Ok(Vec::new())
        );
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn conditional_update_applies_exactly_once() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        let record = DoseRecord::upcoming(&reminder, datetime!(2024-01-02 08:00 UTC));
        store.insert_if_absent(&record).map_err(|err| anyhow!(err))?;

        let completed = StatusTransition::completed(datetime!(2024-01-02 08:05 UTC));
        assert_eq!(store.conditional_update(record.record_id, DoseStatus::Upcoming, &completed), Ok(true));
        assert_eq!(
            store.conditional_update(record.record_id, DoseStatus::Upcoming, &StatusTransition::missed()),
            Ok(false)
        );

        let stored = store
            .find(&RecordFilter::all().record(record.record_id), SortOrder::Ascending, None)
            .map_err(|err| anyhow!(err))?;
        assert_eq!(stored[0].status, DoseStatus::Completed);
        assert_eq!(stored[0].taken_time, Some(datetime!(2024-01-02 08:05 UTC)));
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn delete_many_honours_exclusive_lower_bound() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        let now = datetime!(2024-01-02 08:00 UTC);
        let current = DoseRecord::upcoming(&reminder, now);
        let next = DoseRecord::upcoming(&reminder, now + Duration::DAY);
        store.insert_if_absent(&current).map_err(|err| anyhow!(err))?;
        store.insert_if_absent(&next).map_err(|err| anyhow!(err))?;

        let future = RecordFilter::all()
            .reminder(reminder.reminder_id)
            .scheduled((Bound::Excluded(now), Bound::Unbounded));
        assert_eq!(store.delete_many(&future), Ok(1));
        assert_eq!(store.find(&RecordFilter::all(), SortOrder::Ascending, None), Ok(vec![current]));
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn reminders_upsert_list_and_delete() -> Result<()> {
        let mut store = open_memory()?;
        let mut reminder = mk_reminder(8)?;
        let mut paused = mk_reminder(9)?;
        paused.active = false;
        paused.medicine_box_id = "box-2".to_string();

        store.upsert_reminder(&reminder)?;
        store.upsert_reminder(&paused)?;
        reminder.recurrence.days_of_week = vec![medbox_core::DayOfWeek::Monday];
        store.upsert_reminder(&reminder)?;

        assert_eq!(store.get(reminder.reminder_id), Ok(Some(reminder.clone())));
        assert_eq!(store.list("box-1"), Ok(vec![reminder.clone()]));
        assert_eq!(store.list_active(), Ok(vec![reminder.clone()]));

        assert_eq!(store.delete_reminder(reminder.reminder_id)?, Some(reminder.clone()));
        assert_eq!(store.delete_reminder(reminder.reminder_id)?, None);
        assert_eq!(store.get(reminder.reminder_id), Ok(None));
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn corrupt_rows_surface_as_decode_errors() -> Result<()> {
        let store = open_memory()?;
        store.conn.execute(
            "INSERT INTO dose_records(
               record_id, reminder_id, medicine_box_id, box_number, device_id,
               user_id, scheduled_time, status, taken_time
             ) VALUES ('not-a-ulid', ?1, 'box-1', 3, 'dev', NULL, 0, 'upcoming', NULL)",
            params![ReminderId::new().to_string()],
        )?;

        match store.find(&RecordFilter::all(), SortOrder::Ascending, None) {
            Err(StoreError::Decode(message)) => assert!(message.contains("not-a-ulid")),
            other => panic!("expected decode error, got {other:?}"),
        }
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn engine_runs_lifecycle_against_sqlite() -> Result<()> {
        let store = open_memory()?;
        let reminder = mk_reminder(8)?;
        store.upsert_reminder(&reminder)?;
        let clock = ManualClock::new(datetime!(2024-01-01 07:00 UTC));
        let engine = LifecycleEngine::new(&store, &store, &clock, EngineConfig::default());

        let report = engine.materialize_all(Duration::hours(48))?;
        assert_eq!(report.created_count, 2);
        assert_eq!(engine.materialize_all(Duration::hours(48))?.created_count, 0);

        clock.set(datetime!(2024-01-02 08:05 UTC));
        assert!(matches!(engine.complete_from_device("esp32-kitchen", 3)?, DeviceCompletion::Completed { .. }));
        assert_eq!(engine.complete_from_device("esp32-kitchen", 3)?, DeviceCompletion::NoPendingRecord);
        assert_eq!(engine.sweep_missed()?, 1);

        let statuses = engine
            .query_range(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-03 00:00 UTC), None)?
            .into_iter()
            .map(|record| record.status)
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec![DoseStatus::Missed, DoseStatus::Completed]);
        assert!(matches!(
            engine.query_range(datetime!(2024-01-01 00:00 UTC), datetime!(2023-12-31 00:00 UTC), None),
            Err(EngineError::InvalidRange { .. })
        ));
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_sweep_and_device_completion_resolve_once() -> Result<()> {
        let db_path = unique_temp_db_path();
        let reminder = mk_reminder(8)?;
        let scheduled = [
            datetime!(2024-01-02 08:00 UTC),
            datetime!(2024-01-02 09:00 UTC),
            datetime!(2024-01-02 10:00 UTC),
        ];
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            for at in scheduled {
                init.insert_if_absent(&DoseRecord::upcoming(&reminder, at)).map_err(|err| anyhow!(err))?;
            }
        }

        let now = datetime!(2024-01-02 10:30 UTC);
        let mut handles = Vec::new();
        for worker in 0..6 {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<usize> {
                let store = SqliteStore::open(&path)?;
                let clock = ManualClock::new(now);
                let engine = LifecycleEngine::new(&store, &store, &clock, EngineConfig::default());
                if worker % 2 == 0 {
                    Ok(engine.sweep_missed()?)
                } else {
                    let outcome = engine.complete_from_device("esp32-kitchen", 3)?;
                    Ok(usize::from(matches!(outcome, DeviceCompletion::Completed { .. })))
                }
            }));
        }

        let mut applied = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            applied += thread_result?;
        }
        assert_eq!(applied, scheduled.len());

        let store = SqliteStore::open(&db_path)?;
        let records = store
            .find(&RecordFilter::all(), SortOrder::Ascending, None)
            .map_err(|err| anyhow!(err))?;
        assert_eq!(records.len(), scheduled.len());
        assert!(records.iter().all(|record| record.status.is_terminal() && record.is_consistent()));

        drop(store);
        cleanup(&db_path)
    }
}
