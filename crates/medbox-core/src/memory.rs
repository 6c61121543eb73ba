use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::sort_records;
use crate::{
    DoseRecord, DoseStatus, RecordFilter, RecordId, RecordStore, Reminder, ReminderId,
    ReminderStore, SortOrder, StatusTransition, StoreError,
};

#[derive(Debug, Default)]
struct RecordTable {
    by_id: BTreeMap<RecordId, DoseRecord>,
    slots: BTreeMap<(ReminderId, i128), RecordId>,
}

/// In-process reference [`RecordStore`]. Every write runs under one write lock,
/// which is what makes `conditional_update` a check-and-set.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    table: RwLock<RecordTable>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RecordTable>, StoreError> {
        self.table.read().map_err(|_| StoreError::Backend("record table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RecordTable>, StoreError> {
        self.table.write().map_err(|_| StoreError::Backend("record table lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryRecordStore {
    fn find(
        &self,
        filter: &RecordFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<DoseRecord>, StoreError> {
        let table = self.read()?;
        let mut records =
            table.by_id.values().filter(|record| filter.matches(record)).cloned().collect::<Vec<_>>();
        drop(table);

        sort_records(&mut records, order);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn insert_if_absent(&self, record: &DoseRecord) -> Result<bool, StoreError> {
        let slot = (record.reminder_id, record.scheduled_time.unix_timestamp_nanos());
        let mut table = self.write()?;
        if table.slots.contains_key(&slot) || table.by_id.contains_key(&record.record_id) {
            return Ok(false);
        }
        table.slots.insert(slot, record.record_id);
        table.by_id.insert(record.record_id, record.clone());
        Ok(true)
    }

    fn conditional_update(
        &self,
        record_id: RecordId,
        expected: DoseStatus,
        transition: &StatusTransition,
    ) -> Result<bool, StoreError> {
        let mut table = self.write()?;
        let Some(record) = table.by_id.get_mut(&record_id) else {
            return Ok(false);
        };
        if record.status != expected {
            return Ok(false);
        }
        transition.apply(record);
        Ok(true)
    }

    fn delete_many(&self, filter: &RecordFilter) -> Result<usize, StoreError> {
        let mut table = self.write()?;
        let doomed = table
            .by_id
            .values()
            .filter(|record| filter.matches(record))
            .map(|record| {
                (record.record_id, (record.reminder_id, record.scheduled_time.unix_timestamp_nanos()))
            })
            .collect::<Vec<_>>();

        for (record_id, slot) in &doomed {
            table.by_id.remove(record_id);
            table.slots.remove(slot);
        }
        Ok(doomed.len())
    }
}

/// In-process reference [`ReminderStore`] with the write side the API layer needs.
#[derive(Debug, Default)]
pub struct MemoryReminderStore {
    reminders: RwLock<BTreeMap<ReminderId, Reminder>>,
}

impl MemoryReminderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the lock is poisoned.
    pub fn upsert(&self, reminder: Reminder) -> Result<(), StoreError> {
        self.reminders
            .write()
            .map_err(|_| StoreError::Backend("reminder table lock poisoned".to_string()))?
            .insert(reminder.reminder_id, reminder);
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::Backend`] when the lock is poisoned.
    pub fn remove(&self, reminder_id: ReminderId) -> Result<Option<Reminder>, StoreError> {
        Ok(self
            .reminders
            .write()
            .map_err(|_| StoreError::Backend("reminder table lock poisoned".to_string()))?
            .remove(&reminder_id))
    }

    fn snapshot(&self) -> Result<Vec<Reminder>, StoreError> {
        Ok(self
            .reminders
            .read()
            .map_err(|_| StoreError::Backend("reminder table lock poisoned".to_string()))?
            .values()
            .cloned()
            .collect())
    }
}

impl ReminderStore for MemoryReminderStore {
    fn get(&self, reminder_id: ReminderId) -> Result<Option<Reminder>, StoreError> {
        Ok(self
            .reminders
            .read()
            .map_err(|_| StoreError::Backend("reminder table lock poisoned".to_string()))?
            .get(&reminder_id)
            .cloned())
    }

    fn list(&self, medicine_box_id: &str) -> Result<Vec<Reminder>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|reminder| reminder.medicine_box_id == medicine_box_id)
            .collect())
    }

    fn list_active(&self) -> Result<Vec<Reminder>, StoreError> {
        Ok(self.snapshot()?.into_iter().filter(|reminder| reminder.active).collect())
    }
}
