use std::{fmt::Display, ops::Deref, str::FromStr, sync::Arc};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::StoreError;

/// Identifier assigned by the store when a record is added. Unique for the lifetime of the
/// store, including records merged from other devices.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of the installation that created a record. Best effort only: a reinstall
/// produces a new one.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Clone)]
#[serde(transparent)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of a practice session in minutes. Never negative, never NaN.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct DurationMinutes(f64);

impl DurationMinutes {
    pub const DEFAULT: DurationMinutes = DurationMinutes(5.0);

    pub fn new_opt(value: f64) -> Option<DurationMinutes> {
        if value.is_finite() && value >= 0. {
            Some(DurationMinutes(value))
        } else {
            None
        }
    }
}

impl TryFrom<f64> for DurationMinutes {
    type Error = StoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        DurationMinutes::new_opt(value).ok_or(StoreError::InvalidDuration(value))
    }
}

impl From<DurationMinutes> for f64 {
    fn from(value: DurationMinutes) -> Self {
        value.0
    }
}

impl FromStr for DurationMinutes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s.trim().parse::<f64>()?;
        Ok(DurationMinutes::try_from(v)?)
    }
}

impl Deref for DurationMinutes {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DurationMinutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single logged practice session.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct PracticeRecordEntity {
    pub id: RecordId,
    /// Legacy records may have no timestamp. Such records are treated as happening "now".
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_minutes: DurationMinutes,
    #[serde(default)]
    pub creator_id: Option<DeviceId>,
}

impl PracticeRecordEntity {
    /// Timestamp used for ordering and filtering, substituting `now` for missing values.
    pub fn effective_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.unwrap_or(now)
    }

    /// The journal keeps whole seconds, so the in-memory copy does too.
    pub fn with_whole_seconds(mut self) -> Self {
        self.timestamp = self.timestamp.map(|timestamp| timestamp.trunc_subsecs(0));
        self
    }

    pub fn is_created_by(&self, device: &DeviceId) -> bool {
        self.creator_id.as_ref() == Some(device)
    }
}

/// Fields of a record before the store assigns an id.
#[derive(PartialEq, Debug, Clone)]
pub struct NewPracticeRecord {
    pub timestamp: DateTime<Utc>,
    pub duration_minutes: DurationMinutes,
    pub creator_id: Option<DeviceId>,
}

impl NewPracticeRecord {
    pub fn into_entity(self, id: RecordId) -> PracticeRecordEntity {
        PracticeRecordEntity {
            id,
            timestamp: Some(self.timestamp.trunc_subsecs(0)),
            duration_minutes: self.duration_minutes,
            creator_id: self.creator_id,
        }
    }
}

/// Explicit field replacement for an existing record. `None` keeps the current value.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct RecordUpdate {
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_minutes: Option<DurationMinutes>,
}

impl RecordUpdate {
    pub fn duration(duration_minutes: DurationMinutes) -> Self {
        Self {
            duration_minutes: Some(duration_minutes),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, record: &mut PracticeRecordEntity) {
        if let Some(timestamp) = self.timestamp {
            record.timestamp = Some(timestamp.trunc_subsecs(0));
        }
        if let Some(duration) = self.duration_minutes {
            record.duration_minutes = duration;
        }
    }
}

/// A single line of the store journal.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Put { record: PracticeRecordEntity },
    Delete { id: RecordId },
}
