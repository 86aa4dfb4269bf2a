//! The durable store is the single source of truth for practice records.
//! The basic idea is:
//!  - [RecordStore] is the contract: CRUD, window queries, a store-side sum aggregate, remote
//!    merges and a broadcast of every change.
//!  - [file_store::FileRecordStore] keeps records in an append-only JSON-lines journal.
//!  - Everything above the store (repository, widget) only ever holds read-through copies.

pub mod entities;
pub mod error;
pub mod file_store;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entities::{NewPracticeRecord, PracticeRecordEntity, RecordId, RecordUpdate};
use error::StoreError;
use tokio::sync::broadcast;

/// Where a change to the store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification emitted after every successful save, whatever its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub origin: ChangeOrigin,
    pub records: Vec<RecordId>,
}

/// A change replicated from another device.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert(PracticeRecordEntity),
    Delete(RecordId),
}

/// Predicate over record timestamps: `start <= timestamp < end`. A missing bound is open.
/// Records without a timestamp are evaluated as if they happened at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn matches(&self, record: &PracticeRecordEntity, now: DateTime<Utc>) -> bool {
        let timestamp = record.effective_timestamp(now);
        self.start.map_or(true, |start| start <= timestamp)
            && self.end.map_or(true, |end| timestamp < end)
    }
}

/// Numeric record fields the store can aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SumField {
    DurationMinutes,
}

impl SumField {
    pub fn name(&self) -> &'static str {
        match self {
            SumField::DurationMinutes => "duration_minutes",
        }
    }
}

/// Untyped row returned by aggregate queries, e.g. `{"sum": 12.5}`. Callers decode the
/// fields they expect with [AggregateRow::decode_f64].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateRow(pub HashMap<String, serde_json::Value>);

impl AggregateRow {
    pub const SUM: &'static str = "sum";

    pub fn sum(value: f64) -> Self {
        Self(HashMap::from([(Self::SUM.to_string(), value.into())]))
    }

    /// A missing or null field decodes to `0.0`, anything that isn't a number is an error.
    pub fn decode_f64(&self, field: &str) -> Result<f64, StoreError> {
        match self.0.get(field) {
            None | Some(serde_json::Value::Null) => Ok(0.),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| StoreError::MalformedAggregate {
                    field: field.to_string(),
                    value: value.clone(),
                }),
        }
    }
}

/// Interface of the durable store. Every successful mutation is followed by exactly one
/// [StoreChange] on the channel returned by [RecordStore::subscribe].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn add(&self, record: NewPracticeRecord) -> Result<RecordId, StoreError>;

    /// Deletes all records in one batch. Nothing is deleted if any id is unknown.
    async fn delete(&self, ids: Vec<RecordId>) -> Result<(), StoreError>;

    async fn update(&self, id: RecordId, update: RecordUpdate) -> Result<(), StoreError>;

    /// Returns matching records ordered ascending by timestamp.
    async fn query(&self, query: RecordQuery) -> Result<Vec<PracticeRecordEntity>, StoreError>;

    /// Sums `field` over matching records inside the store, independently of [Self::query].
    async fn aggregate_sum(
        &self,
        field: SumField,
        query: RecordQuery,
    ) -> Result<AggregateRow, StoreError>;

    /// Applies changes that were made on another device.
    async fn merge_remote(&self, changes: Vec<RemoteChange>) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
