use std::fmt::{Display, Formatter};
use std::ops::{Bound, RangeBounds};

use time::OffsetDateTime;

use crate::{
    DoseRecord, DoseStatus, RecordId, Reminder, ReminderId, StatusTransition, StoreError,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Conjunction of equality and `scheduledTime` range predicates over dose records.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordFilter {
    pub record_id: Option<RecordId>,
    pub reminder_id: Option<ReminderId>,
    pub medicine_box_id: Option<String>,
    pub device_id: Option<String>,
    pub box_number: Option<u32>,
    pub user_id: Option<String>,
    pub status: Option<DoseStatus>,
    pub scheduled_start: Bound<OffsetDateTime>,
    pub scheduled_end: Bound<OffsetDateTime>,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl RecordFilter {
    #[must_use]
    pub fn all() -> Self {
        Self {
            record_id: None,
            reminder_id: None,
            medicine_box_id: None,
            device_id: None,
            box_number: None,
            user_id: None,
            status: None,
            scheduled_start: Bound::Unbounded,
            scheduled_end: Bound::Unbounded,
        }
    }

    #[must_use]
    pub fn record(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    #[must_use]
    pub fn reminder(mut self, reminder_id: ReminderId) -> Self {
        self.reminder_id = Some(reminder_id);
        self
    }

    #[must_use]
    pub fn medicine_box(mut self, medicine_box_id: impl Into<String>) -> Self {
        self.medicine_box_id = Some(medicine_box_id.into());
        self
    }

    #[must_use]
    pub fn device(mut self, device_id: impl Into<String>, box_number: u32) -> Self {
        self.device_id = Some(device_id.into());
        self.box_number = Some(box_number);
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: DoseStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn scheduled(mut self, range: impl RangeBounds<OffsetDateTime>) -> Self {
        self.scheduled_start = range.start_bound().cloned();
        self.scheduled_end = range.end_bound().cloned();
        self
    }

    #[must_use]
    pub fn matches(&self, record: &DoseRecord) -> bool {
        if self.record_id.is_some_and(|id| id != record.record_id) {
            return false;
        }
        if self.reminder_id.is_some_and(|id| id != record.reminder_id) {
            return false;
        }
        if self.medicine_box_id.as_deref().is_some_and(|id| id != record.medicine_box_id) {
            return false;
        }
        if self.device_id.as_deref().is_some_and(|id| id != record.device_id) {
            return false;
        }
        if self.box_number.is_some_and(|number| number != record.box_number) {
            return false;
        }
        if let Some(user_id) = self.user_id.as_deref() {
            if record.user_id.as_deref() != Some(user_id) {
                return false;
            }
        }
        if self.status.is_some_and(|status| status != record.status) {
            return false;
        }
        (self.scheduled_start, self.scheduled_end).contains(&record.scheduled_time)
    }
}

impl Display for RecordFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut clauses = Vec::new();
        if let Some(id) = self.record_id {
            clauses.push(format!("recordId={id}"));
        }
        if let Some(id) = self.reminder_id {
            clauses.push(format!("reminderId={id}"));
        }
        if let Some(id) = &self.medicine_box_id {
            clauses.push(format!("medicineBoxId={id}"));
        }
        if let Some(id) = &self.device_id {
            clauses.push(format!("deviceId={id}"));
        }
        if let Some(number) = self.box_number {
            clauses.push(format!("boxNumber={number}"));
        }
        if let Some(id) = &self.user_id {
            clauses.push(format!("userId={id}"));
        }
        if let Some(status) = self.status {
            clauses.push(format!("status={status}"));
        }
        match self.scheduled_start {
            Bound::Included(at) => clauses.push(format!("scheduledTime>={at}")),
            Bound::Excluded(at) => clauses.push(format!("scheduledTime>{at}")),
            Bound::Unbounded => {}
        }
        match self.scheduled_end {
            Bound::Included(at) => clauses.push(format!("scheduledTime<={at}")),
            Bound::Excluded(at) => clauses.push(format!("scheduledTime<{at}")),
            Bound::Unbounded => {}
        }

        if clauses.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&clauses.join(" AND "))
        }
    }
}

pub(crate) fn sort_records(records: &mut [DoseRecord], order: SortOrder) {
    records.sort_by(|lhs, rhs| {
        lhs.scheduled_time
            .cmp(&rhs.scheduled_time)
            .then_with(|| lhs.record_id.cmp(&rhs.record_id))
    });
    if order == SortOrder::Descending {
        records.reverse();
    }
}

/// Persisted dose records. Implementations must make `conditional_update`
/// atomic with respect to every other writer.
pub trait RecordStore {
    /// Records matching `filter`, ordered by `scheduledTime` then `recordId`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn find(
        &self,
        filter: &RecordFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<DoseRecord>, StoreError>;

    /// Insert unless the (reminderId, scheduledTime) slot already has a record.
    /// Returns whether the record was inserted.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend rejects the write.
    fn insert_if_absent(&self, record: &DoseRecord) -> Result<bool, StoreError>;

    /// Apply `transition` only if the record's current status is `expected`.
    /// Returns whether it applied.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend rejects the write.
    fn conditional_update(
        &self,
        record_id: RecordId,
        expected: DoseStatus,
        transition: &StatusTransition,
    ) -> Result<bool, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend rejects the delete.
    fn delete_many(&self, filter: &RecordFilter) -> Result<usize, StoreError>;
}

pub trait ReminderStore {
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get(&self, reminder_id: ReminderId) -> Result<Option<Reminder>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn list(&self, medicine_box_id: &str) -> Result<Vec<Reminder>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn list_active(&self) -> Result<Vec<Reminder>, StoreError>;
}
