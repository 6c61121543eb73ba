use std::ops::Bound;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};

use crate::occurrence::occurrences;
use crate::{
    Clock, DoseRecord, DoseStatus, EngineError, RecordFilter, RecordId, RecordStore, Reminder,
    ReminderId, ReminderStore, SortOrder, StatusTransition,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EngineConfig {
    /// Fixed offset used for times of day and day boundaries.
    pub utc_offset: UtcOffset,
    /// How long past `scheduledTime` a record stays upcoming before a sweep may mark it missed.
    pub missed_grace: Duration,
    pub default_horizon: Duration,
}

/// Longest materialization horizon accepted, in hours.
pub const MAX_HORIZON_HOURS: i64 = 24 * 366;

/// Convert a caller-supplied hour count into a horizon.
///
/// # Errors
/// Returns [`EngineError::Validation`] outside `1..=MAX_HORIZON_HOURS`.
pub fn horizon_from_hours(hours: i64) -> Result<Duration, EngineError> {
    if !(1..=MAX_HORIZON_HOURS).contains(&hours) {
        return Err(EngineError::Validation(format!(
            "horizon MUST be between 1 and {MAX_HORIZON_HOURS} hours, got {hours}"
        )));
    }
    Ok(Duration::hours(hours))
}

/// Longest missed grace accepted, in minutes.
pub const MAX_GRACE_MINUTES: i64 = 24 * 60;

/// Convert a caller-supplied minute count into a missed grace period.
///
/// # Errors
/// Returns [`EngineError::Validation`] outside `0..=MAX_GRACE_MINUTES`.
pub fn grace_from_minutes(minutes: i64) -> Result<Duration, EngineError> {
    if !(0..=MAX_GRACE_MINUTES).contains(&minutes) {
        return Err(EngineError::Validation(format!(
            "missed grace MUST be between 0 and {MAX_GRACE_MINUTES} minutes, got {minutes}"
        )));
    }
    Ok(Duration::minutes(minutes))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset: UtcOffset::UTC,
            missed_grace: Duration::ZERO,
            default_horizon: Duration::hours(48),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeReport {
    pub created_count: usize,
    pub existing_count: usize,
}

impl MaterializeReport {
    fn merge(&mut self, other: Self) {
        self.created_count += other.created_count;
        self.existing_count += other.existing_count;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReminderReconciliation {
    pub deleted_count: usize,
    pub created_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub created_count: usize,
    pub updated_count: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceCompletion {
    Completed { record_id: RecordId, taken_time: OffsetDateTime },
    NoPendingRecord,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ManualCompletion {
    Completed(DoseRecord),
    NotDue,
    AlreadyResolved(DoseStatus),
}

/// Owns every dose-record status change. Each operation reads the clock once.
pub struct LifecycleEngine<'a> {
    records: &'a dyn RecordStore,
    reminders: &'a dyn ReminderStore,
    clock: &'a dyn Clock,
    config: EngineConfig,
}

impl<'a> LifecycleEngine<'a> {
    /// A negative `missed_grace` is clamped to zero so a sweep never reaches
    /// records that are not yet due.
    #[must_use]
    pub fn new(
        records: &'a dyn RecordStore,
        reminders: &'a dyn ReminderStore,
        clock: &'a dyn Clock,
        mut config: EngineConfig,
    ) -> Self {
        if config.missed_grace.is_negative() {
            tracing::warn!(missed_grace = %config.missed_grace, "negative missed grace clamped to zero");
            config.missed_grace = Duration::ZERO;
        }
        Self { records, reminders, clock, config }
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Create `upcoming` records for every occurrence of `reminder` in
    /// `[now, now + horizon)` whose slot is still empty.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an invalid reminder or a
    /// non-positive horizon, and [`EngineError::StoreUnavailable`] when an
    /// insert fails. Records inserted before the failure stay; rerunning is safe.
    pub fn materialize_records(
        &self,
        reminder: &Reminder,
        horizon: Duration,
    ) -> Result<MaterializeReport, EngineError> {
        reminder.validate()?;
        validate_horizon(horizon)?;
        self.materialize_at(reminder, self.clock.now(), horizon)
    }

    /// # Errors
    /// Returns [`EngineError::UnknownReminder`] when the reminder does not exist,
    /// otherwise as [`Self::materialize_records`].
    pub fn materialize_reminder(
        &self,
        reminder_id: ReminderId,
        horizon: Duration,
    ) -> Result<MaterializeReport, EngineError> {
        validate_horizon(horizon)?;
        let reminder = self
            .reminders
            .get(reminder_id)
            .map_err(|source| {
                EngineError::store("materialize_reminder", format!("reminderId={reminder_id}"), source)
            })?
            .ok_or(EngineError::UnknownReminder(reminder_id))?;
        reminder.validate()?;
        self.materialize_at(&reminder, self.clock.now(), horizon)
    }

    /// Materialize the horizon for every active reminder.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when reminders cannot be listed
    /// or a record insert fails.
    pub fn materialize_all(&self, horizon: Duration) -> Result<MaterializeReport, EngineError> {
        validate_horizon(horizon)?;
        self.materialize_all_at(self.clock.now(), horizon)
    }

    /// Records scheduled on `date` (local to the configured offset), ascending.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when the store cannot be read.
    pub fn query_day(&self, date: Date) -> Result<Vec<DoseRecord>, EngineError> {
        let start = date.midnight().assume_offset(self.config.utc_offset);
        let filter = RecordFilter::all().scheduled(start..start + Duration::DAY);
        self.records
            .find(&filter, SortOrder::Ascending, None)
            .map_err(|source| EngineError::store("query_day", &filter, source))
    }

    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when the store cannot be read.
    pub fn today(&self) -> Result<Vec<DoseRecord>, EngineError> {
        self.query_day(self.clock.now().to_offset(self.config.utc_offset).date())
    }

    /// Records scheduled in `[start, end]`, ascending, optionally for one user.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidRange`] when `end < start` (before touching
    /// the store) and [`EngineError::StoreUnavailable`] when the read fails.
    pub fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        user_id: Option<&str>,
    ) -> Result<Vec<DoseRecord>, EngineError> {
        if end < start {
            return Err(EngineError::InvalidRange { start, end });
        }

        let mut filter = RecordFilter::all().scheduled(start..=end);
        if let Some(user_id) = user_id.map(str::trim).filter(|user_id| !user_id.is_empty()) {
            filter = filter.user(user_id);
        }
        self.records
            .find(&filter, SortOrder::Ascending, None)
            .map_err(|source| EngineError::store("query_range", &filter, source))
    }

    /// Delete the reminder's records that are still upcoming and scheduled after
    /// now. Past and terminal records are kept as adherence history.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingParameter`] for a blank `medicine_box_id`
    /// and [`EngineError::StoreUnavailable`] when the delete fails.
    pub fn reconcile_future_records(
        &self,
        medicine_box_id: &str,
        reminder_id: ReminderId,
    ) -> Result<usize, EngineError> {
        if medicine_box_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("medicineBoxId"));
        }
        self.reconcile_at(medicine_box_id, reminder_id, self.clock.now())
    }

    /// Bring records in line with an edited reminder: drop its future pending
    /// records, then rematerialize the horizon if it is still active.
    ///
    /// `previous` is the stored version before the edit. When the edit moved
    /// the reminder to another box, pending records under the old box are
    /// dropped too.
    ///
    /// # Errors
    /// Returns validation errors for an invalid reminder or horizon and
    /// [`EngineError::StoreUnavailable`] when a store call fails.
    pub fn apply_reminder_change(
        &self,
        previous: Option<&Reminder>,
        reminder: &Reminder,
        horizon: Duration,
    ) -> Result<ReminderReconciliation, EngineError> {
        reminder.validate()?;
        validate_horizon(horizon)?;

        let now = self.clock.now();
        let mut deleted_count = 0;
        if let Some(previous) =
            previous.filter(|previous| previous.medicine_box_id != reminder.medicine_box_id)
        {
            deleted_count += self.reconcile_at(&previous.medicine_box_id, reminder.reminder_id, now)?;
        }
        deleted_count += self.reconcile_at(&reminder.medicine_box_id, reminder.reminder_id, now)?;
        let created_count = self.materialize_at(reminder, now, horizon)?.created_count;
        Ok(ReminderReconciliation { deleted_count, created_count })
    }

    /// Reconciliation for a reminder that has been deleted.
    ///
    /// # Errors
    /// As [`Self::reconcile_future_records`].
    pub fn remove_reminder(&self, reminder: &Reminder) -> Result<usize, EngineError> {
        self.reconcile_future_records(&reminder.medicine_box_id, reminder.reminder_id)
    }

    /// Resolve a dispenser press against the most recently due, still-upcoming
    /// dose of today for that compartment.
    ///
    /// A repeated event finds nothing left to complete and reports
    /// [`DeviceCompletion::NoPendingRecord`], as does losing a race against a
    /// concurrent writer.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingParameter`] for a blank device id or a zero
    /// box number and [`EngineError::StoreUnavailable`] when a store call fails.
    pub fn complete_from_device(
        &self,
        device_id: &str,
        box_number: u32,
    ) -> Result<DeviceCompletion, EngineError> {
        if device_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("deviceId"));
        }
        if box_number == 0 {
            return Err(EngineError::MissingParameter("boxNumber"));
        }

        let now = self.clock.now();
        let filter = RecordFilter::all()
            .device(device_id, box_number)
            .status(DoseStatus::Upcoming)
            .scheduled(self.start_of_day(now)..=now);
        let candidate = self
            .records
            .find(&filter, SortOrder::Descending, Some(1))
            .map_err(|source| EngineError::store("complete_from_device", &filter, source))?
            .into_iter()
            .next();

        let Some(record) = candidate else {
            tracing::debug!(device_id, box_number, "no pending dose record for device event");
            return Ok(DeviceCompletion::NoPendingRecord);
        };

        let applied = self
            .records
            .conditional_update(
                record.record_id,
                DoseStatus::Upcoming,
                &StatusTransition::completed(now),
            )
            .map_err(|source| {
                EngineError::store(
                    "complete_from_device",
                    format!("recordId={} status=upcoming", record.record_id),
                    source,
                )
            })?;

        if applied {
            tracing::info!(
                record_id = %record.record_id,
                device_id,
                box_number,
                "dose record completed from device"
            );
            Ok(DeviceCompletion::Completed { record_id: record.record_id, taken_time: now })
        } else {
            tracing::debug!(
                record_id = %record.record_id,
                "dose record resolved concurrently; device event is a no-op"
            );
            Ok(DeviceCompletion::NoPendingRecord)
        }
    }

    /// Mark one record taken by hand. Mirrors the device path for a known record.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownRecord`] when the record does not exist and
    /// [`EngineError::StoreUnavailable`] when a store call fails.
    pub fn mark_taken(&self, record_id: RecordId) -> Result<ManualCompletion, EngineError> {
        let now = self.clock.now();
        let record = self.load_record(record_id, "mark_taken")?;

        if record.status.is_terminal() {
            return Ok(ManualCompletion::AlreadyResolved(record.status));
        }
        if record.scheduled_time > now {
            return Ok(ManualCompletion::NotDue);
        }

        let transition = StatusTransition::completed(now);
        let applied = self
            .records
            .conditional_update(record_id, DoseStatus::Upcoming, &transition)
            .map_err(|source| {
                EngineError::store("mark_taken", format!("recordId={record_id} status=upcoming"), source)
            })?;

        if applied {
            let mut record = record;
            transition.apply(&mut record);
            tracing::info!(record_id = %record_id, "dose record marked taken");
            return Ok(ManualCompletion::Completed(record));
        }

        let current = self.load_record(record_id, "mark_taken")?;
        Ok(ManualCompletion::AlreadyResolved(current.status))
    }

    /// Mark every overdue upcoming record missed, one conditional update each.
    /// Returns how many updates applied.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when a store call fails. Updates
    /// applied before the failure stay; the next sweep picks up the rest.
    pub fn sweep_missed(&self) -> Result<usize, EngineError> {
        self.sweep_at(self.clock.now())
    }

    /// One scheduler pass: materialize the default horizon for active
    /// reminders, then sweep, both against the same instant.
    ///
    /// # Errors
    /// Returns the first [`EngineError`] from either step.
    pub fn tick(&self) -> Result<TickReport, EngineError> {
        validate_horizon(self.config.default_horizon)?;
        let now = self.clock.now();
        let created_count = self.materialize_all_at(now, self.config.default_horizon)?.created_count;
        let updated_count = self.sweep_at(now)?;
        Ok(TickReport { created_count, updated_count })
    }

    fn start_of_day(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.to_offset(self.config.utc_offset).replace_time(Time::MIDNIGHT)
    }

    fn load_record(
        &self,
        record_id: RecordId,
        operation: &'static str,
    ) -> Result<DoseRecord, EngineError> {
        let filter = RecordFilter::all().record(record_id);
        self.records
            .find(&filter, SortOrder::Ascending, Some(1))
            .map_err(|source| EngineError::store(operation, &filter, source))?
            .into_iter()
            .next()
            .ok_or(EngineError::UnknownRecord(record_id))
    }

    fn materialize_at(
        &self,
        reminder: &Reminder,
        now: OffsetDateTime,
        horizon: Duration,
    ) -> Result<MaterializeReport, EngineError> {
        let mut report = MaterializeReport::default();
        if !reminder.active {
            return Ok(report);
        }
        let until = now.checked_add(horizon).ok_or_else(|| {
            EngineError::Validation(format!("materialization horizon {horizon} overflows from {now}"))
        })?;

        for scheduled_time in occurrences(&reminder.recurrence, self.config.utc_offset, now, until) {
            let record = DoseRecord::upcoming(reminder, scheduled_time);
            let inserted = self.records.insert_if_absent(&record).map_err(|source| {
                EngineError::store(
                    "materialize_records",
                    format!("reminderId={} scheduledTime={scheduled_time}", reminder.reminder_id),
                    source,
                )
            })?;
            if inserted {
                report.created_count += 1;
            } else {
                report.existing_count += 1;
            }
        }

        tracing::debug!(
            reminder_id = %reminder.reminder_id,
            created = report.created_count,
            existing = report.existing_count,
            "materialized dose records"
        );
        Ok(report)
    }

    fn materialize_all_at(
        &self,
        now: OffsetDateTime,
        horizon: Duration,
    ) -> Result<MaterializeReport, EngineError> {
        let reminders = self
            .reminders
            .list_active()
            .map_err(|source| EngineError::store("materialize_all", "active=true", source))?;

        let mut report = MaterializeReport::default();
        for reminder in &reminders {
            if let Err(err) = reminder.validate() {
                tracing::warn!(reminder_id = %reminder.reminder_id, error = %err, "skipping invalid reminder");
                continue;
            }
            report.merge(self.materialize_at(reminder, now, horizon)?);
        }

        if report.created_count > 0 {
            tracing::info!(
                reminders = reminders.len(),
                created = report.created_count,
                "materialized upcoming dose records"
            );
        }
        Ok(report)
    }

    fn reconcile_at(
        &self,
        medicine_box_id: &str,
        reminder_id: ReminderId,
        now: OffsetDateTime,
    ) -> Result<usize, EngineError> {
        let filter = RecordFilter::all()
            .medicine_box(medicine_box_id)
            .reminder(reminder_id)
            .status(DoseStatus::Upcoming)
            .scheduled((Bound::Excluded(now), Bound::Unbounded));
        let deleted = self
            .records
            .delete_many(&filter)
            .map_err(|source| EngineError::store("reconcile_future_records", &filter, source))?;

        tracing::info!(%reminder_id, medicine_box_id, deleted, "reconciled future dose records");
        Ok(deleted)
    }

    fn sweep_at(&self, now: OffsetDateTime) -> Result<usize, EngineError> {
        let cutoff = now - self.config.missed_grace;
        let filter = RecordFilter::all().status(DoseStatus::Upcoming).scheduled(..cutoff);
        let overdue = self
            .records
            .find(&filter, SortOrder::Ascending, None)
            .map_err(|source| EngineError::store("sweep_missed", &filter, source))?;

        let missed = StatusTransition::missed();
        let mut updated = 0_usize;
        for record in &overdue {
            let applied = self
                .records
                .conditional_update(record.record_id, DoseStatus::Upcoming, &missed)
                .map_err(|source| {
                    EngineError::store(
                        "sweep_missed",
                        format!("recordId={} status=upcoming", record.record_id),
                        source,
                    )
                })?;
            if applied {
                updated += 1;
            }
        }

        if updated > 0 {
            tracing::info!(updated, candidates = overdue.len(), "swept overdue dose records to missed");
        }
        Ok(updated)
    }
}

fn validate_horizon(horizon: Duration) -> Result<(), EngineError> {
    if horizon <= Duration::ZERO {
        return Err(EngineError::Validation("materialization horizon MUST be positive".to_string()));
    }
    if horizon > Duration::hours(MAX_HORIZON_HOURS) {
        return Err(EngineError::Validation(format!(
            "materialization horizon MUST NOT exceed {MAX_HORIZON_HOURS} hours"
        )));
    }
    Ok(())
}
