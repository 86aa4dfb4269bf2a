//! Live, window-scoped view over the [RecordStore].
//!
//! The repository never mutates its cache directly. Commands go to the store, the store
//! broadcasts a [StoreChange], and [ItemRepository::refresh] replaces the cache and both totals
//! wholesale. Until that refresh the previous state stays visible.

pub mod aggregate;
pub mod days;
pub mod module;

use std::sync::Arc;

use aggregate::{client_total, Reconciliation};
use anyhow::{bail, Result};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use days::{group_by_day, DayBucket};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, instrument, warn};

use crate::{
    store::{
        entities::{
            DeviceId, DurationMinutes, NewPracticeRecord, PracticeRecordEntity, RecordId,
            RecordUpdate,
        },
        AggregateRow, RecordQuery, RecordStore, StoreChange, SumField,
    },
    utils::{
        clock::Clock,
        time::{next_day_start, start_of_day_before},
    },
    widget::WidgetNotifier,
};

/// The live query covers this many days before today, plus today.
pub const WINDOW_DAYS_BACK: u64 = 30;

/// Number of day buckets shown, today included.
pub const BUCKET_DAYS: u64 = 7;

/// Upper bound of [ItemRepository::adjust_duration].
pub const MAX_ADJUSTABLE_DURATION: f64 = 40.;

/// Days covered by the "recent" total of a snapshot.
pub const RECENT_DAYS: u64 = 2;

/// Everything the repository needs besides the store.
pub struct RepositoryEnvironment<Tz: TimeZone> {
    pub clock: Box<dyn Clock>,
    /// Calendar used for window bounds and day buckets.
    pub timezone: Tz,
    pub device_id: DeviceId,
    pub notifier: Box<dyn WidgetNotifier>,
}

/// Immutable copy of the repository state handed to readers.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositorySnapshot {
    pub taken_at: DateTime<Utc>,
    pub device_id: DeviceId,
    pub items: Vec<PracticeRecordEntity>,
    pub days: Vec<DayBucket>,
    pub device_days: Vec<DayBucket>,
    pub total_duration: f64,
    pub total_duration_sum: f64,
    pub recent_duration: f64,
}

pub struct ItemRepository<S: RecordStore, Tz: TimeZone> {
    store: Arc<S>,
    changes: broadcast::Receiver<StoreChange>,
    clock: Box<dyn Clock>,
    timezone: Tz,
    device_id: DeviceId,
    notifier: Box<dyn WidgetNotifier>,
    current_items: Vec<PracticeRecordEntity>,
    total_duration_sum: f64,
}

impl<S: RecordStore, Tz: TimeZone> ItemRepository<S, Tz> {
    /// Subscribes to store changes and performs the initial fetch. An error here means the
    /// local state can't be read and is not retried.
    pub async fn initialize(store: Arc<S>, environment: RepositoryEnvironment<Tz>) -> Result<Self> {
        let RepositoryEnvironment {
            clock,
            timezone,
            device_id,
            notifier,
        } = environment;

        // Subscribe before fetching so no change can slip in between.
        let changes = store.subscribe();
        let mut repository = Self {
            store,
            changes,
            clock,
            timezone,
            device_id,
            notifier,
            current_items: vec![],
            total_duration_sum: 0.,
        };
        repository.refresh().await?;
        info!(
            "Repository initialized with {} records",
            repository.current_items.len()
        );
        Ok(repository)
    }

    fn now(&self) -> DateTime<Tz> {
        self.clock.time().with_timezone(&self.timezone)
    }

    /// `[start of today - 30 days, start of tomorrow)`
    pub fn window(&self) -> RecordQuery {
        let now = self.now();
        RecordQuery::between(
            start_of_day_before(&now, WINDOW_DAYS_BACK).with_timezone(&Utc),
            next_day_start(&now).with_timezone(&Utc),
        )
    }

    /// Re-runs the live query and the store aggregate, replacing the cached state. This is the
    /// only place either total is recomputed.
    #[instrument(skip(self))]
    pub async fn refresh(&mut self) -> Result<()> {
        let window = self.window();
        let items = self.store.query(window).await?;
        let sum = self
            .store
            .aggregate_sum(SumField::DurationMinutes, window)
            .await?
            .decode_f64(AggregateRow::SUM)?;

        self.current_items = items;
        self.total_duration_sum = sum;
        debug!(
            "Refreshed {} records, store total {sum}",
            self.current_items.len()
        );
        self.reconciliation().report();
        Ok(())
    }

    /// Waits for the next store notification. Returns `false` once the store is gone.
    pub async fn wait_for_change(&mut self) -> bool {
        match self.changes.recv().await {
            Ok(change) => {
                debug!("Store changed {change:?}");
                true
            }
            Err(RecvError::Lagged(skipped)) => {
                // The refresh is wholesale, so missed notifications lose nothing.
                warn!("Skipped {skipped} store notifications");
                true
            }
            Err(RecvError::Closed) => false,
        }
    }

    /// Consumes every notification that already arrived and refreshes once if there was any.
    pub async fn process_pending_changes(&mut self) -> Result<bool> {
        let mut changed = false;
        loop {
            match self.changes.try_recv() {
                Ok(_) => changed = true,
                Err(TryRecvError::Lagged(_)) => changed = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if changed {
            self.refresh().await?;
        }
        Ok(changed)
    }

    /// Adds a record for now with the default duration.
    pub async fn add_item(&mut self) -> Result<RecordId> {
        let now = self.clock.time();
        self.add_item_at(now, DurationMinutes::DEFAULT).await
    }

    /// Adds a record at an arbitrary moment, e.g. a session logged after the fact.
    pub async fn add_item_at(
        &mut self,
        timestamp: DateTime<Utc>,
        duration_minutes: DurationMinutes,
    ) -> Result<RecordId> {
        let record = NewPracticeRecord {
            timestamp: timestamp.trunc_subsecs(0),
            duration_minutes,
            creator_id: Some(self.device_id.clone()),
        };
        let id = self.store.add(record).await?;
        info!("Added record {id} at {timestamp} for {duration_minutes} minutes");
        self.notifier.request_refresh();
        Ok(id)
    }

    /// Deletes records by their position in [Self::current_items] in a single batch.
    pub async fn delete_items(&mut self, positions: &[usize]) -> Result<()> {
        let mut ids = Vec::with_capacity(positions.len());
        for &position in positions {
            let Some(item) = self.current_items.get(position) else {
                bail!(
                    "No record at position {position}, there are {} records",
                    self.current_items.len()
                );
            };
            if !ids.contains(&item.id) {
                ids.push(item.id);
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        self.store.delete(ids.clone()).await?;
        info!("Deleted records {ids:?}");
        self.notifier.request_refresh();
        Ok(())
    }

    /// Replaces the duration of a record. Accepts `0..=40` minutes.
    pub async fn adjust_duration(&mut self, id: RecordId, minutes: f64) -> Result<()> {
        let Some(duration) =
            DurationMinutes::new_opt(minutes).filter(|d| **d <= MAX_ADJUSTABLE_DURATION)
        else {
            bail!("Duration must be between 0 and {MAX_ADJUSTABLE_DURATION} minutes, got {minutes}");
        };

        self.store
            .update(id, RecordUpdate::duration(duration))
            .await?;
        info!("Adjusted record {id} to {duration} minutes");
        self.notifier.request_refresh();
        Ok(())
    }

    /// Records of the window in ascending timestamp order.
    pub fn current_items(&self) -> &[PracticeRecordEntity] {
        &self.current_items
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn filtered_items(&self, only_this_device: bool) -> Vec<&PracticeRecordEntity> {
        self.current_items
            .iter()
            .filter(|item| !only_this_device || item.is_created_by(&self.device_id))
            .collect()
    }

    /// Today and the six days before it, oldest first.
    pub fn items_by_day(&self, only_this_device: bool) -> Vec<DayBucket> {
        group_by_day(
            &self.filtered_items(only_this_device),
            &self.now(),
            BUCKET_DAYS,
        )
    }

    /// Sum of the cached records, computed on the client.
    pub fn total_duration(&self) -> f64 {
        client_total(&self.current_items)
    }

    /// Sum computed by the store during the last refresh.
    pub fn total_duration_sum(&self) -> f64 {
        self.total_duration_sum
    }

    /// Client-side sum over today and the `days - 1` days before it.
    pub fn total_duration_in_last_days(&self, days: u64) -> f64 {
        if days == 0 {
            return 0.;
        }
        let now = self.now();
        let start = start_of_day_before(&now, days - 1).with_timezone(&Utc);
        let now = now.with_timezone(&Utc);
        client_total(
            self.current_items
                .iter()
                .filter(|item| item.effective_timestamp(now) >= start),
        )
    }

    pub fn reconciliation(&self) -> Reconciliation {
        Reconciliation {
            client_total: self.total_duration(),
            store_total: self.total_duration_sum,
        }
    }

    pub fn snapshot(&self) -> RepositorySnapshot {
        RepositorySnapshot {
            taken_at: self.clock.time(),
            device_id: self.device_id.clone(),
            items: self.current_items.clone(),
            days: self.items_by_day(false),
            device_days: self.items_by_day(true),
            total_duration: self.total_duration(),
            total_duration_sum: self.total_duration_sum,
            recent_duration: self.total_duration_in_last_days(RECENT_DAYS),
        }
    }
}
