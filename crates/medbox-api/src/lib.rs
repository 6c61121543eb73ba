use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use medbox_core::{
    horizon_from_hours, Clock, DeviceCompletion, DoseRecord, DoseStatus, EngineConfig, EngineError,
    LifecycleEngine, ManualCompletion, MaterializeReport, RecordId, RecurrenceRule, Reminder,
    ReminderId, ReminderStore, SystemClock, TickReport,
};
use medbox_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

pub const API_CONTRACT_VERSION: &str = "api.v1";

time::serde::format_description!(calendar_date, Date, "[year]-[month]-[day]");

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_existing_tables: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetDayRequest {
    #[serde(with = "calendar_date")]
    pub date: Date,
}

/// One end of a range query: an RFC3339 instant or a `YYYY-MM-DD` calendar
/// date. A date as the start covers that whole day from midnight; as the end,
/// through its last instant. Days are read in the configured offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    Instant(OffsetDateTime),
    Date(Date),
}

impl RangeBound {
    fn start_at(self, offset: UtcOffset) -> OffsetDateTime {
        match self {
            Self::Instant(instant) => instant,
            Self::Date(date) => date.midnight().assume_offset(offset),
        }
    }

    fn end_at(self, offset: UtcOffset) -> Result<OffsetDateTime, EngineError> {
        match self {
            Self::Instant(instant) => Ok(instant),
            Self::Date(date) => date
                .midnight()
                .assume_offset(offset)
                .checked_add(Duration::DAY - Duration::NANOSECOND)
                .ok_or_else(|| EngineError::Validation(format!("endDate {date} is out of range"))),
        }
    }
}

impl From<OffsetDateTime> for RangeBound {
    fn from(value: OffsetDateTime) -> Self {
        Self::Instant(value)
    }
}

impl From<Date> for RangeBound {
    fn from(value: Date) -> Self {
        Self::Date(value)
    }
}

impl FromStr for RangeBound {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(instant) = OffsetDateTime::parse(trimmed, &Rfc3339) {
            return Ok(Self::Instant(instant));
        }
        Date::parse(trimmed, format_description!("[year]-[month]-[day]"))
            .map(Self::Date)
            .map_err(|_| {
                EngineError::Validation(format!(
                    "range bound MUST be an RFC3339 instant or YYYY-MM-DD, got `{raw}`"
                ))
            })
    }
}

impl Serialize for RangeBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = match self {
            Self::Instant(instant) => instant.format(&Rfc3339),
            Self::Date(date) => date.format(format_description!("[year]-[month]-[day]")),
        };
        serializer.serialize_str(&formatted.map_err(serde::ser::Error::custom)?)
    }
}

impl<'de> Deserialize<'de> for RangeBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    pub start_date: RangeBound,
    pub end_date: RangeBound,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Both ids are optional on the wire so a missing one reports which parameter
/// is absent instead of failing to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFutureRequest {
    #[serde(default)]
    pub medicine_box_id: Option<String>,
    #[serde(default)]
    pub reminder_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFutureResult {
    pub deleted_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteFromDeviceRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub box_number: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CompleteFromDeviceResult {
    #[serde(rename_all = "camelCase")]
    Completed {
        record_id: RecordId,
        #[serde(with = "time::serde::rfc3339")]
        taken_time: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    NoneFound { none_found: bool },
}

impl From<DeviceCompletion> for CompleteFromDeviceResult {
    fn from(value: DeviceCompletion) -> Self {
        match value {
            DeviceCompletion::Completed { record_id, taken_time } => {
                Self::Completed { record_id, taken_time }
            }
            DeviceCompletion::NoPendingRecord => Self::NoneFound { none_found: true },
        }
    }
}

/// Payload published by the dispenser. `timestamp` is informational; the
/// completion time always comes from the server clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub box_number: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub taken: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DeviceEventResult {
    Ignored { ignored: bool },
    Handled(CompleteFromDeviceResult),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub updated_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkTakenRequest {
    pub record_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkTakenResult {
    Completed { record: DoseRecord },
    NotDue,
    AlreadyResolved { status: DoseStatus },
}

impl From<ManualCompletion> for MarkTakenResult {
    fn from(value: ManualCompletion) -> Self {
        match value {
            ManualCompletion::Completed(record) => Self::Completed { record },
            ManualCompletion::NotDue => Self::NotDue,
            ManualCompletion::AlreadyResolved(status) => Self::AlreadyResolved { status },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PutReminderRequest {
    #[serde(default)]
    pub reminder_id: Option<ReminderId>,
    pub medicine_box_id: String,
    pub device_id: String,
    pub box_number: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub medicine_name: Option<String>,
    pub recurrence: RecurrenceRule,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PutReminderResult {
    pub reminder: Reminder,
    pub deleted_count: usize,
    pub created_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReminderResult {
    pub reminder_id: ReminderId,
    pub deleted_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeRequest {
    #[serde(default)]
    pub reminder_id: Option<String>,
    #[serde(default)]
    pub horizon_hours: Option<i64>,
}

/// Typed query surface. HTTP routes and CLI subcommands map onto these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "input", rename_all = "snake_case")]
pub enum Operation {
    Today,
    GetDay(GetDayRequest),
    GetRange(RangeRequest),
    ReconcileFuture(ReconcileFutureRequest),
    CompleteFromDevice(CompleteFromDeviceRequest),
    MarkTaken(MarkTakenRequest),
    SweepMissed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "op", content = "output", rename_all = "snake_case")]
pub enum OperationOutcome {
    Today(Vec<DoseRecord>),
    GetDay(Vec<DoseRecord>),
    GetRange(Vec<DoseRecord>),
    ReconcileFuture(ReconcileFutureResult),
    CompleteFromDevice(CompleteFromDeviceResult),
    MarkTaken(MarkTakenResult),
    SweepMissed(SweepResult),
}

#[derive(Debug, Clone)]
pub struct MedboxApi {
    db_path: PathBuf,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl MedboxApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: EngineConfig::default(), clock: Arc::new(SystemClock) }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn run<T>(
        &self,
        op: impl FnOnce(&LifecycleEngine<'_>) -> Result<T, EngineError>,
    ) -> ApiResult<T> {
        let store = self.open_store()?;
        let engine = LifecycleEngine::new(&store, &store, self.clock.as_ref(), self.config);
        Ok(op(&engine)?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_existing_tables: before.inferred_from_existing_tables,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_existing_tables: before.inferred_from_existing_tables,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Persist a reminder, then drop its future pending records and
    /// rematerialize the default horizon.
    ///
    /// # Errors
    /// Returns validation errors before anything is written, and store errors
    /// from either step. A failed reconciliation leaves the reminder saved;
    /// repeating the call converges.
    pub fn put_reminder(&self, input: PutReminderRequest) -> ApiResult<PutReminderResult> {
        let reminder = build_reminder(input);
        reminder.validate()?;

        let store = self.open_store()?;
        let previous = store
            .get(reminder.reminder_id)
            .with_context(|| format!("failed to load reminder {}", reminder.reminder_id))?;
        store.upsert_reminder(&reminder)?;
        tracing::info!(reminder_id = %reminder.reminder_id, active = reminder.active, "reminder saved");

        let engine = LifecycleEngine::new(&store, &store, self.clock.as_ref(), self.config);
        let outcome = engine.apply_reminder_change(
            previous.as_ref(),
            &reminder,
            self.config.default_horizon,
        )?;
        Ok(PutReminderResult {
            reminder,
            deleted_count: outcome.deleted_count,
            created_count: outcome.created_count,
        })
    }

    /// Delete a reminder and its future pending records. Past and terminal
    /// records stay as history.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownReminder`] when no such reminder exists.
    pub fn delete_reminder(&self, reminder_id: &str) -> ApiResult<DeleteReminderResult> {
        let reminder_id = parse_reminder_id(reminder_id)?;
        let mut store = self.open_store()?;
        let Some(reminder) = store.delete_reminder(reminder_id)? else {
            return Err(EngineError::UnknownReminder(reminder_id).into());
        };
        tracing::info!(%reminder_id, "reminder deleted");

        let engine = LifecycleEngine::new(&store, &store, self.clock.as_ref(), self.config);
        let deleted_count = engine.remove_reminder(&reminder)?;
        Ok(DeleteReminderResult { reminder_id, deleted_count })
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_reminders(&self, medicine_box_id: &str) -> ApiResult<Vec<Reminder>> {
        if medicine_box_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("medicineBoxId").into());
        }
        let store = self.open_store()?;
        Ok(store.list(medicine_box_id).context("failed to list reminders")?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn today(&self) -> ApiResult<Vec<DoseRecord>> {
        self.run(|engine| engine.today())
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_day(&self, input: &GetDayRequest) -> ApiResult<Vec<DoseRecord>> {
        self.run(|engine| engine.query_day(input.date))
    }

    /// # Errors
    /// Returns [`EngineError::InvalidRange`] when `endDate < startDate`.
    pub fn get_range(&self, input: &RangeRequest) -> ApiResult<Vec<DoseRecord>> {
        let start = input.start_date.start_at(self.config.utc_offset);
        let end = input.end_date.end_at(self.config.utc_offset)?;
        if end < start {
            return Err(EngineError::InvalidRange { start, end }.into());
        }
        self.run(|engine| engine.query_range(start, end, input.user_id.as_deref()))
    }

    /// # Errors
    /// Returns [`EngineError::MissingParameter`] for a missing id and store
    /// errors from the delete.
    pub fn reconcile_future(&self, input: &ReconcileFutureRequest) -> ApiResult<ReconcileFutureResult> {
        let medicine_box_id = input.medicine_box_id.as_deref().unwrap_or_default();
        if medicine_box_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("medicineBoxId").into());
        }
        let Some(reminder_id) = input.reminder_id.as_deref().filter(|id| !id.trim().is_empty())
        else {
            return Err(EngineError::MissingParameter("reminderId").into());
        };
        let reminder_id = parse_reminder_id(reminder_id)?;

        let deleted_count =
            self.run(|engine| engine.reconcile_future_records(medicine_box_id, reminder_id))?;
        Ok(ReconcileFutureResult { deleted_count })
    }

    /// # Errors
    /// Returns [`EngineError::MissingParameter`] for a blank device id or zero box number.
    pub fn complete_from_device(
        &self,
        input: &CompleteFromDeviceRequest,
    ) -> ApiResult<CompleteFromDeviceResult> {
        if input.device_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("deviceId").into());
        }
        if input.box_number == 0 {
            return Err(EngineError::MissingParameter("boxNumber").into());
        }
        let outcome =
            self.run(|engine| engine.complete_from_device(&input.device_id, input.box_number))?;
        Ok(outcome.into())
    }

    /// Acknowledge a dispenser event. Events reporting `taken: false` are ignored.
    ///
    /// # Errors
    /// As [`Self::complete_from_device`].
    pub fn handle_device_event(&self, event: &DeviceEvent) -> ApiResult<DeviceEventResult> {
        if event.taken == Some(false) {
            tracing::debug!(device_id = %event.device_id, box_number = event.box_number, "ignoring untaken device event");
            return Ok(DeviceEventResult::Ignored { ignored: true });
        }
        if let Some(timestamp) = event.timestamp {
            let skew = self.clock.now() - timestamp;
            if skew.abs() > Duration::minutes(5) {
                tracing::warn!(device_id = %event.device_id, %timestamp, "device clock skew exceeds five minutes");
            }
        }

        let completion = self.complete_from_device(&CompleteFromDeviceRequest {
            device_id: event.device_id.clone(),
            box_number: event.box_number,
        })?;
        Ok(DeviceEventResult::Handled(completion))
    }

    /// # Errors
    /// Returns [`EngineError::UnknownRecord`] when the record does not exist.
    pub fn mark_taken(&self, input: &MarkTakenRequest) -> ApiResult<MarkTakenResult> {
        let record_id = input.record_id.trim().parse::<RecordId>().map_err(|err| {
            EngineError::Validation(format!("invalid recordId `{}`: {err}", input.record_id))
        })?;
        let outcome = self.run(|engine| engine.mark_taken(record_id))?;
        Ok(outcome.into())
    }

    /// # Errors
    /// Returns store errors; updates applied before a failure stay applied.
    pub fn sweep_missed(&self) -> ApiResult<SweepResult> {
        let updated_count = self.run(|engine| engine.sweep_missed())?;
        Ok(SweepResult { updated_count })
    }

    /// Materialize one reminder, or every active reminder when no id is given.
    ///
    /// # Errors
    /// Returns validation errors for a non-positive horizon or malformed id, and
    /// [`EngineError::UnknownReminder`] for an unknown id.
    pub fn materialize(&self, input: &MaterializeRequest) -> ApiResult<MaterializeReport> {
        let horizon = match input.horizon_hours {
            Some(hours) => horizon_from_hours(hours)?,
            None => self.config.default_horizon,
        };
        match input.reminder_id.as_deref() {
            Some(reminder_id) => {
                let reminder_id = parse_reminder_id(reminder_id)?;
                self.run(|engine| engine.materialize_reminder(reminder_id, horizon))
            }
            None => self.run(|engine| engine.materialize_all(horizon)),
        }
    }

    /// One scheduler pass against the database.
    ///
    /// # Errors
    /// Returns the first error from materialization or the sweep.
    pub fn tick(&self) -> ApiResult<TickReport> {
        self.run(|engine| engine.tick())
    }

    /// # Errors
    /// Returns the error of the dispatched operation.
    pub fn dispatch(&self, operation: &Operation) -> ApiResult<OperationOutcome> {
        match operation {
            Operation::Today => self.today().map(OperationOutcome::Today),
            Operation::GetDay(input) => self.get_day(input).map(OperationOutcome::GetDay),
            Operation::GetRange(input) => self.get_range(input).map(OperationOutcome::GetRange),
            Operation::ReconcileFuture(input) => {
                self.reconcile_future(input).map(OperationOutcome::ReconcileFuture)
            }
            Operation::CompleteFromDevice(input) => {
                self.complete_from_device(input).map(OperationOutcome::CompleteFromDevice)
            }
            Operation::MarkTaken(input) => self.mark_taken(input).map(OperationOutcome::MarkTaken),
            Operation::SweepMissed => self.sweep_missed().map(OperationOutcome::SweepMissed),
        }
    }
}

/// Parse a fixed offset such as `+02:00`, `-05:30`, `Z` or `UTC`.
///
/// # Errors
/// Returns [`EngineError::Validation`] for anything else.
pub fn parse_utc_offset(raw: &str) -> Result<UtcOffset, EngineError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(trimmed, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .map_err(|err| {
            EngineError::Validation(format!("utc offset MUST look like +HH:MM, got `{raw}`: {err}"))
        })
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`EngineError::Validation`] for malformed input.
pub fn parse_calendar_date(raw: &str) -> Result<Date, EngineError> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| EngineError::Validation(format!("date MUST be YYYY-MM-DD, got `{raw}`: {err}")))
}

fn build_reminder(input: PutReminderRequest) -> Reminder {
    Reminder {
        reminder_id: input.reminder_id.unwrap_or_default(),
        medicine_box_id: input.medicine_box_id,
        device_id: input.device_id,
        box_number: input.box_number,
        user_id: input.user_id,
        medicine_name: input.medicine_name,
        recurrence: input.recurrence,
        active: input.active,
    }
}

fn parse_reminder_id(raw: &str) -> Result<ReminderId, EngineError> {
    raw.trim()
        .parse()
        .map_err(|err| EngineError::Validation(format!("invalid reminderId `{raw}`: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use medbox_core::{ManualClock, TimeOfDay, MAX_HORIZON_HOURS};
    use time::macros::{date, datetime};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("medbox-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    panic!("failed to cleanup sqlite file {}: {err}", path.display());
                }
            }
        }
    }

    fn pinned_api(now: OffsetDateTime) -> (MedboxApi, Arc<ManualClock>, PathBuf) {
        let db_path = unique_temp_db_path();
        let clock = Arc::new(ManualClock::new(now));
        let api = MedboxApi::new(db_path.clone()).with_clock(clock.clone());
        (api, clock, db_path)
    }

    fn morning_reminder() -> Result<PutReminderRequest, ApiError> {
        Ok(PutReminderRequest {
            reminder_id: None,
            medicine_box_id: "box-1".to_string(),
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
            user_id: Some("user-1".to_string()),
            medicine_name: Some("metformin".to_string()),
            recurrence: RecurrenceRule {
                times_of_day: vec![TimeOfDay::new(8, 0)?],
                start_date: date!(2024 - 01 - 01),
                end_date: None,
                days_of_week: vec![],
            },
            active: true,
        })
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_reminder_device_and_sweep_flow() -> Result<(), ApiError> {
        let (api, clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));

        let saved = api.put_reminder(morning_reminder()?)?;
        assert_eq!(saved.created_count, 2);
        assert_eq!(saved.deleted_count, 0);

        clock.set(datetime!(2024-01-02 08:05 UTC));
        let completed = api.complete_from_device(&CompleteFromDeviceRequest {
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
        })?;
        assert!(matches!(
            completed,
            CompleteFromDeviceResult::Completed { taken_time, .. }
                if taken_time == datetime!(2024-01-02 08:05 UTC)
        ));

        let today = api.today()?;
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].status, DoseStatus::Completed);

        clock.set(datetime!(2024-01-03 09:00 UTC));
        assert_eq!(api.sweep_missed()?, SweepResult { updated_count: 1 });
        assert_eq!(api.sweep_missed()?, SweepResult { updated_count: 0 });

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_reconcile_requires_both_ids() {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));

        let missing_box = api.reconcile_future(&ReconcileFutureRequest {
            medicine_box_id: None,
            reminder_id: Some(ReminderId::new().to_string()),
        });
        assert!(matches!(
            missing_box,
            Err(ApiError::Engine(EngineError::MissingParameter("medicineBoxId")))
        ));

        let missing_reminder = api.reconcile_future(&ReconcileFutureRequest {
            medicine_box_id: Some("box-1".to_string()),
            reminder_id: None,
        });
        assert!(matches!(
            missing_reminder,
            Err(ApiError::Engine(EngineError::MissingParameter("reminderId")))
        ));

        let malformed = api.reconcile_future(&ReconcileFutureRequest {
            medicine_box_id: Some("box-1".to_string()),
            reminder_id: Some("nope".to_string()),
        });
        assert!(matches!(malformed, Err(ApiError::Engine(EngineError::Validation(_)))));

        cleanup(&db_path);
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_edit_and_delete_reconcile_future_records() -> Result<(), ApiError> {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        let saved = api.put_reminder(morning_reminder()?)?;

        let mut edit = morning_reminder()?;
        edit.reminder_id = Some(saved.reminder.reminder_id);
        edit.recurrence.times_of_day = vec![TimeOfDay::new(9, 30)?];
        let edited = api.put_reminder(edit)?;
        assert_eq!(edited.deleted_count, 2);
        assert_eq!(edited.created_count, 2);

        let listed = api.list_reminders("box-1")?;
        assert_eq!(listed, vec![edited.reminder.clone()]);

        let deleted = api.delete_reminder(&saved.reminder.reminder_id.to_string())?;
        assert_eq!(deleted.deleted_count, 2);
        assert!(api.today()?.is_empty());
        assert!(matches!(
            api.delete_reminder(&saved.reminder.reminder_id.to_string()),
            Err(ApiError::Engine(EngineError::UnknownReminder(_)))
        ));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_rejects_invalid_reminder_before_writing() -> Result<(), ApiError> {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        let mut invalid = morning_reminder()?;
        invalid.recurrence.times_of_day.clear();

        assert!(matches!(api.put_reminder(invalid), Err(ApiError::Engine(EngineError::Validation(_)))));
        assert!(api.list_reminders("box-1")?.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn api_dispatch_routes_typed_operations() -> Result<(), ApiError> {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        api.put_reminder(morning_reminder()?)?;

        let day = api.dispatch(&Operation::GetDay(GetDayRequest { date: date!(2024 - 01 - 02) }))?;
        let OperationOutcome::GetDay(records) = day else {
            panic!("expected get_day outcome, got {day:?}");
        };
        assert_eq!(records.len(), 1);

        let inverted = api.dispatch(&Operation::GetRange(RangeRequest {
            start_date: datetime!(2024-01-01 00:00 UTC).into(),
            end_date: datetime!(2023-12-31 00:00 UTC).into(),
            user_id: None,
        }));
        assert!(matches!(inverted, Err(ApiError::Engine(EngineError::InvalidRange { .. }))));

        let device = api.dispatch(&Operation::CompleteFromDevice(CompleteFromDeviceRequest {
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
        }))?;
        assert_eq!(
            device,
            OperationOutcome::CompleteFromDevice(CompleteFromDeviceResult::NoneFound { none_found: true })
        );

        let parsed: Operation = match serde_json::from_value(serde_json::json!({ "op": "sweep_missed" })) {
            Ok(operation) => operation,
            Err(err) => panic!("failed to parse operation: {err}"),
        };
        assert_eq!(
            api.dispatch(&parsed)?,
            OperationOutcome::SweepMissed(SweepResult { updated_count: 0 })
        );

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn api_device_event_with_taken_false_is_ignored() -> Result<(), ApiError> {
        let (api, clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        api.put_reminder(morning_reminder()?)?;
        clock.set(datetime!(2024-01-02 08:05 UTC));

        let untaken = DeviceEvent {
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
            timestamp: Some(datetime!(2024-01-02 08:04 UTC)),
            taken: Some(false),
        };
        assert_eq!(api.handle_device_event(&untaken)?, DeviceEventResult::Ignored { ignored: true });

        let taken = DeviceEvent { taken: None, ..untaken };
        assert!(matches!(
            api.handle_device_event(&taken)?,
            DeviceEventResult::Handled(CompleteFromDeviceResult::Completed { .. })
        ));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn api_mark_taken_outcomes_serialize_with_tag() -> Result<(), ApiError> {
        let (api, clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        api.put_reminder(morning_reminder()?)?;
        let records = api.get_day(&GetDayRequest { date: date!(2024 - 01 - 03) })?;
        let request = MarkTakenRequest { record_id: records[0].record_id.to_string() };

        let not_due = api.mark_taken(&request)?;
        assert_eq!(not_due, MarkTakenResult::NotDue);
        let value = match serde_json::to_value(&not_due) {
            Ok(value) => value,
            Err(err) => panic!("failed to serialize outcome: {err}"),
        };
        assert_eq!(value, serde_json::json!({ "outcome": "not_due" }));

        clock.set(datetime!(2024-01-03 08:10 UTC));
        assert!(matches!(api.mark_taken(&request)?, MarkTakenResult::Completed { .. }));
        assert_eq!(
            api.mark_taken(&request)?,
            MarkTakenResult::AlreadyResolved { status: DoseStatus::Completed }
        );

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn api_migrate_dry_run_then_apply() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = MedboxApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn api_edit_moving_box_reissues_pending_records() -> Result<(), ApiError> {
        let (api, clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        let saved = api.put_reminder(morning_reminder()?)?;
        assert_eq!(saved.created_count, 2);

        let mut moved = morning_reminder()?;
        moved.reminder_id = Some(saved.reminder.reminder_id);
        moved.medicine_box_id = "box-2".to_string();
        moved.device_id = "esp32-bedroom".to_string();
        moved.box_number = 1;
        let edited = api.put_reminder(moved)?;
        assert_eq!(edited.deleted_count, 2);
        assert_eq!(edited.created_count, 2);

        let records = api.get_range(&RangeRequest {
            start_date: date!(2024 - 01 - 01).into(),
            end_date: date!(2024 - 01 - 05).into(),
            user_id: None,
        })?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.medicine_box_id == "box-2"
            && record.device_id == "esp32-bedroom"
            && record.box_number == 1));

        clock.set(datetime!(2024-01-02 08:05 UTC));
        let stale = api.complete_from_device(&CompleteFromDeviceRequest {
            device_id: "esp32-kitchen".to_string(),
            box_number: 3,
        })?;
        assert_eq!(stale, CompleteFromDeviceResult::NoneFound { none_found: true });
        let current = api.complete_from_device(&CompleteFromDeviceRequest {
            device_id: "esp32-bedroom".to_string(),
            box_number: 1,
        })?;
        assert!(matches!(current, CompleteFromDeviceResult::Completed { .. }));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn api_range_accepts_calendar_dates() -> Result<(), ApiError> {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        api.put_reminder(morning_reminder()?)?;

        let inverted: RangeRequest = match serde_json::from_value(serde_json::json!({
            "startDate": "2024-01-01",
            "endDate": "2023-12-31"
        })) {
            Ok(request) => request,
            Err(err) => panic!("date-only range failed to parse: {err}"),
        };
        assert!(matches!(
            api.get_range(&inverted),
            Err(ApiError::Engine(EngineError::InvalidRange { .. }))
        ));

        let single_day = RangeRequest {
            start_date: date!(2024 - 01 - 03).into(),
            end_date: date!(2024 - 01 - 03).into(),
            user_id: None,
        };
        let records = api.get_range(&single_day)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scheduled_time, datetime!(2024-01-03 08:00 UTC));

        let mixed: RangeRequest = match serde_json::from_value(serde_json::json!({
            "startDate": "2024-01-02T08:00:00Z",
            "endDate": "2024-01-02"
        })) {
            Ok(request) => request,
            Err(err) => panic!("mixed range failed to parse: {err}"),
        };
        assert_eq!(api.get_range(&mixed)?.len(), 1);
        assert!("yesterday".parse::<RangeBound>().is_err());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-011
    #[test]
    fn api_materialize_rejects_out_of_range_horizon() -> Result<(), ApiError> {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));
        api.put_reminder(morning_reminder()?)?;

        for hours in [i64::MAX, MAX_HORIZON_HOURS + 1, 0, -4] {
            let outcome =
                api.materialize(&MaterializeRequest { reminder_id: None, horizon_hours: Some(hours) });
            assert!(
                matches!(outcome, Err(ApiError::Engine(EngineError::Validation(_)))),
                "horizon {hours} gave {outcome:?}"
            );
        }
        let widened = api.materialize(&MaterializeRequest { reminder_id: None, horizon_hours: Some(72) })?;
        assert_eq!(widened.created_count, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-012
    #[test]
    fn api_device_validation_precedes_store_access() {
        let (api, _clock, db_path) = pinned_api(datetime!(2024-01-02 07:00 UTC));

        let blank = api.complete_from_device(&CompleteFromDeviceRequest {
            device_id: "  ".to_string(),
            box_number: 3,
        });
        assert!(matches!(blank, Err(ApiError::Engine(EngineError::MissingParameter("deviceId")))));

        let zero = api.complete_from_device(&CompleteFromDeviceRequest {
            device_id: "esp32-kitchen".to_string(),
            box_number: 0,
        });
        assert!(matches!(zero, Err(ApiError::Engine(EngineError::MissingParameter("boxNumber")))));

        let malformed = api.mark_taken(&MarkTakenRequest { record_id: String::new() });
        assert!(matches!(malformed, Err(ApiError::Engine(EngineError::Validation(_)))));

        assert!(!db_path.exists());
    }

    #[test]
    fn offsets_and_dates_parse_from_flags() {
        assert_eq!(parse_utc_offset("UTC"), Ok(UtcOffset::UTC));
        assert_eq!(parse_utc_offset("Z"), Ok(UtcOffset::UTC));
        assert_eq!(parse_utc_offset("+02:00").map(|offset| offset.whole_hours()), Ok(2));
        assert_eq!(parse_utc_offset("-05:30").map(|offset| offset.whole_minutes()), Ok(-330));
        assert!(matches!(parse_utc_offset("2h"), Err(EngineError::Validation(_))));

        assert_eq!(parse_calendar_date("2024-01-02"), Ok(date!(2024 - 01 - 02)));
        assert!(matches!(parse_calendar_date("01/02/2024"), Err(EngineError::Validation(_))));
    }

    #[test]
    fn complete_from_device_result_matches_wire_shape() {
        let none = CompleteFromDeviceResult::NoneFound { none_found: true };
        let value = match serde_json::to_value(none) {
            Ok(value) => value,
            Err(err) => panic!("failed to serialize result: {err}"),
        };
        assert_eq!(value, serde_json::json!({ "noneFound": true }));

        let record_id = RecordId::new();
        let completed = CompleteFromDeviceResult::Completed {
            record_id,
            taken_time: datetime!(2024-01-02 08:05 UTC),
        };
        let value = match serde_json::to_value(completed) {
            Ok(value) => value,
            Err(err) => panic!("failed to serialize result: {err}"),
        };
        assert_eq!(
            value,
            serde_json::json!({ "recordId": record_id.to_string(), "takenTime": "2024-01-02T08:05:00Z" })
        );
    }
}
