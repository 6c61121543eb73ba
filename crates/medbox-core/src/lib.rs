use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Date, OffsetDateTime, Time, Weekday};
use ulid::Ulid;

mod clock;
mod engine;
mod memory;
mod occurrence;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    grace_from_minutes, horizon_from_hours, DeviceCompletion, EngineConfig, LifecycleEngine,
    ManualCompletion, MaterializeReport, ReminderReconciliation, TickReport, MAX_GRACE_MINUTES,
    MAX_HORIZON_HOURS,
};
pub use memory::{MemoryRecordStore, MemoryReminderStore};
pub use occurrence::{occurrences, Occurrences};
pub use store::{RecordFilter, RecordStore, ReminderStore, SortOrder};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored data could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid range: end {end} precedes start {start}")]
    InvalidRange { start: OffsetDateTime, end: OffsetDateTime },
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown reminder: {0}")]
    UnknownReminder(ReminderId),
    #[error("unknown record: {0}")]
    UnknownRecord(RecordId),
    #[error("store unavailable during {operation} [{predicate}]: {source}")]
    StoreUnavailable {
        operation: &'static str,
        predicate: String,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    pub(crate) fn store(
        operation: &'static str,
        predicate: impl Display,
        source: StoreError,
    ) -> Self {
        Self::StoreUnavailable { operation, predicate: predicate.to_string(), source }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReminderId(pub Ulid);

impl ReminderId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReminderId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReminderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReminderId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

/// Lifecycle state of one dose record. `Completed` and `Missed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DoseStatus {
    Upcoming,
    Completed,
    Missed,
}

impl DoseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Completed => "completed",
            Self::Missed => "missed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upcoming" => Some(Self::Upcoming),
            "completed" => Some(Self::Completed),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Missed)
    }
}

impl Display for DoseStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "monday" | "mon" => Some(Self::Monday),
            "tuesday" | "tue" => Some(Self::Tuesday),
            "wednesday" | "wed" => Some(Self::Wednesday),
            "thursday" | "thu" => Some(Self::Thursday),
            "friday" | "fri" => Some(Self::Friday),
            "saturday" | "sat" => Some(Self::Saturday),
            "sunday" | "sun" => Some(Self::Sunday),
            _ => None,
        }
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(value: Weekday) -> Self {
        match value {
            Weekday::Monday => Self::Monday,
            Weekday::Tuesday => Self::Tuesday,
            Weekday::Wednesday => Self::Wednesday,
            Weekday::Thursday => Self::Thursday,
            Weekday::Friday => Self::Friday,
            Weekday::Saturday => Self::Saturday,
            Weekday::Sunday => Self::Sunday,
        }
    }
}

/// Wall-clock time of day at minute precision, serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeOfDay(Time);

impl TimeOfDay {
    /// # Errors
    /// Returns [`EngineError::Validation`] when hour or minute is out of range.
    pub fn new(hour: u8, minute: u8) -> Result<Self, EngineError> {
        Time::from_hms(hour, minute, 0)
            .map(Self)
            .map_err(|err| EngineError::Validation(format!("invalid time of day: {err}")))
    }

    #[must_use]
    pub fn time(self) -> Time {
        self.0
    }
}

impl Display for TimeOfDay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::Validation(format!("time of day MUST be HH:MM, got `{value}`"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// When a reminder fires: times of day, an inclusive active date range, and
/// the days of week it applies to (empty means every day).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    pub times_of_day: Vec<TimeOfDay>,
    #[serde(with = "iso_date")]
    pub start_date: Date,
    #[serde(default, with = "iso_date::option")]
    pub end_date: Option<Date>,
    #[serde(default)]
    pub days_of_week: Vec<DayOfWeek>,
}

impl RecurrenceRule {
    /// # Errors
    /// Returns [`EngineError::Validation`] when no time of day is given or the
    /// active range ends before it starts.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.times_of_day.is_empty() {
            return Err(EngineError::Validation(
                "recurrence rule MUST list at least one time of day".to_string(),
            ));
        }

        if let Some(end_date) = self.end_date {
            if end_date < self.start_date {
                return Err(EngineError::Validation(format!(
                    "recurrence endDate {end_date} precedes startDate {}",
                    self.start_date
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn applies_on(&self, date: Date) -> bool {
        if date < self.start_date {
            return false;
        }
        if self.end_date.is_some_and(|end_date| date > end_date) {
            return false;
        }
        self.days_of_week.is_empty() || self.days_of_week.contains(&DayOfWeek::from(date.weekday()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub reminder_id: ReminderId,
    pub medicine_box_id: String,
    pub device_id: String,
    pub box_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medicine_name: Option<String>,
    pub recurrence: RecurrenceRule,
    pub active: bool,
}

impl Reminder {
    /// Check the fields record materialization and device matching depend on.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingParameter`] for blank identifiers or a zero
    /// box number, and [`EngineError::Validation`] for an invalid recurrence rule.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.medicine_box_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("medicineBoxId"));
        }
        if self.device_id.trim().is_empty() {
            return Err(EngineError::MissingParameter("deviceId"));
        }
        if self.box_number == 0 {
            return Err(EngineError::MissingParameter("boxNumber"));
        }
        self.recurrence.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoseRecord {
    pub record_id: RecordId,
    pub reminder_id: ReminderId,
    pub medicine_box_id: String,
    pub box_number: u32,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    pub status: DoseStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub taken_time: Option<OffsetDateTime>,
}

impl DoseRecord {
    /// A fresh `upcoming` record for one occurrence of `reminder`.
    #[must_use]
    pub fn upcoming(reminder: &Reminder, scheduled_time: OffsetDateTime) -> Self {
        Self {
            record_id: RecordId::new(),
            reminder_id: reminder.reminder_id,
            medicine_box_id: reminder.medicine_box_id.clone(),
            box_number: reminder.box_number,
            device_id: reminder.device_id.clone(),
            user_id: reminder.user_id.clone(),
            scheduled_time,
            status: DoseStatus::Upcoming,
            taken_time: None,
        }
    }

    /// `takenTime` is present exactly when the record is completed.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.taken_time.is_some() == (self.status == DoseStatus::Completed)
    }
}

/// The only ways a record leaves `upcoming`. Construction keeps `takenTime`
/// paired with `completed`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusTransition {
    to: DoseStatus,
    taken_time: Option<OffsetDateTime>,
}

impl StatusTransition {
    #[must_use]
    pub fn completed(taken_time: OffsetDateTime) -> Self {
        Self { to: DoseStatus::Completed, taken_time: Some(taken_time) }
    }

    #[must_use]
    pub fn missed() -> Self {
        Self { to: DoseStatus::Missed, taken_time: None }
    }

    #[must_use]
    pub fn to(&self) -> DoseStatus {
        self.to
    }

    #[must_use]
    pub fn taken_time(&self) -> Option<OffsetDateTime> {
        self.taken_time
    }

    pub fn apply(&self, record: &mut DoseRecord) {
        record.status = self.to;
        record.taken_time = self.taken_time;
    }
}
