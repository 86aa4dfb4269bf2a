//! Read-only summary that is refreshed independently of the repository. It never reads the
//! repository's cache: every refresh queries the store directly.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    store::{error::StoreError, AggregateRow, RecordQuery, RecordStore, SumField},
    utils::clock::Clock,
};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// One-way "please refresh" signal sent after every successful mutation.
pub trait WidgetNotifier: Send + Sync {
    fn request_refresh(&self);
}

/// [WidgetNotifier] backed by a channel with room for a single pending signal.
#[derive(Clone)]
pub struct ChannelWidgetNotifier {
    sender: mpsc::Sender<()>,
}

impl WidgetNotifier for ChannelWidgetNotifier {
    fn request_refresh(&self) {
        match self.sender.try_send(()) {
            Ok(()) => debug!("Requested widget refresh"),
            // A refresh is already pending.
            Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => debug!("Widget is not running"),
        }
    }
}

pub fn widget_channel() -> (ChannelWidgetNotifier, mpsc::Receiver<()>) {
    let (sender, receiver) = mpsc::channel(1);
    (ChannelWidgetNotifier { sender }, receiver)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WidgetEntry {
    pub date: DateTime<Utc>,
    pub sum: f64,
}

impl WidgetEntry {
    /// Shown before the first successful refresh.
    pub fn placeholder(date: DateTime<Utc>) -> Self {
        Self { date, sum: -1. }
    }

    pub fn is_placeholder(&self) -> bool {
        self.sum < 0.
    }
}

/// Total practice minutes over every record in the store.
pub async fn widget_data(store: &impl RecordStore) -> Result<f64, StoreError> {
    store
        .aggregate_sum(SumField::DurationMinutes, RecordQuery::all())
        .await?
        .decode_f64(AggregateRow::SUM)
}

pub struct WidgetModule<S: RecordStore> {
    store: Arc<S>,
    signals: mpsc::Receiver<()>,
    entries: watch::Sender<WidgetEntry>,
    clock: Box<dyn Clock>,
    refresh_interval: Duration,
    shutdown: CancellationToken,
}

impl<S: RecordStore> WidgetModule<S> {
    pub fn new(
        store: Arc<S>,
        signals: mpsc::Receiver<()>,
        clock: Box<dyn Clock>,
        refresh_interval: Duration,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<WidgetEntry>) {
        let (entries, receiver) = watch::channel(WidgetEntry::placeholder(clock.time()));
        (
            Self {
                store,
                signals,
                entries,
                clock,
                refresh_interval,
                shutdown,
            },
            receiver,
        )
    }

    async fn refresh(&self) -> Result<()> {
        let sum = widget_data(self.store.as_ref()).await?;
        let entry = WidgetEntry {
            date: self.clock.time(),
            sum,
        };
        info!("Widget refreshed with sum {sum}");
        self.entries.send_replace(entry);
        Ok(())
    }

    /// Refreshes on every signal and every `refresh_interval` until shutdown.
    pub async fn run(mut self) -> Result<()> {
        self.refresh().await?;
        let mut signals_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                signal = self.signals.recv(), if signals_open => {
                    match signal {
                        Some(()) => self.refresh().await?,
                        None => signals_open = false,
                    }
                }
                _ = self.clock.sleep(self.refresh_interval) => {
                    self.refresh().await?
                }
            }
        }
    }
}
