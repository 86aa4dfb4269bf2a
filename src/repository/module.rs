use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::{
    entities::{DurationMinutes, RecordId},
    RecordStore,
};

use super::{ItemRepository, RepositorySnapshot};

const COMMAND_CHANNEL_CAPACITY: usize = 10;

/// Mutations requested by readers. Every command carries a reply channel for its result.
#[derive(Debug)]
pub enum RepositoryCommand {
    Add {
        at: Option<DateTime<Utc>>,
        minutes: DurationMinutes,
        reply: oneshot::Sender<Result<RecordId>>,
    },
    Delete {
        positions: Vec<usize>,
        reply: oneshot::Sender<Result<()>>,
    },
    AdjustDuration {
        position: usize,
        minutes: f64,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable access to a running [RepositoryModule].
#[derive(Clone)]
pub struct RepositoryHandle {
    commands: mpsc::Sender<RepositoryCommand>,
    snapshots: watch::Receiver<RepositorySnapshot>,
}

impl RepositoryHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> RepositoryCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| anyhow!("Repository is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("Repository stopped before replying"))?
    }

    pub async fn add(
        &self,
        at: Option<DateTime<Utc>>,
        minutes: DurationMinutes,
    ) -> Result<RecordId> {
        self.request(|reply| RepositoryCommand::Add { at, minutes, reply })
            .await
    }

    pub async fn delete(&self, positions: Vec<usize>) -> Result<()> {
        self.request(|reply| RepositoryCommand::Delete { positions, reply })
            .await
    }

    pub async fn adjust_duration(&self, position: usize, minutes: f64) -> Result<()> {
        self.request(|reply| RepositoryCommand::AdjustDuration {
            position,
            minutes,
            reply,
        })
        .await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> RepositorySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<RepositorySnapshot> {
        self.snapshots.clone()
    }
}

/// Owns the [ItemRepository]. Commands and store notifications are handled one at a time, so
/// the cached state is only ever touched from this loop.
pub struct RepositoryModule<S: RecordStore, Tz: TimeZone> {
    repository: ItemRepository<S, Tz>,
    commands: mpsc::Receiver<RepositoryCommand>,
    snapshots: watch::Sender<RepositorySnapshot>,
    shutdown: CancellationToken,
}

impl<S: RecordStore, Tz: TimeZone> RepositoryModule<S, Tz> {
    pub fn new(
        repository: ItemRepository<S, Tz>,
        shutdown: CancellationToken,
    ) -> (Self, RepositoryHandle) {
        let (command_sender, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshots, snapshot_receiver) = watch::channel(repository.snapshot());
        (
            Self {
                repository,
                commands,
                snapshots,
                shutdown,
            },
            RepositoryHandle {
                commands: command_sender,
                snapshots: snapshot_receiver,
            },
        )
    }

    fn resolve(&self, position: usize) -> Result<RecordId> {
        self.repository
            .current_items()
            .get(position)
            .map(|item| item.id)
            .ok_or_else(|| anyhow!("No record at position {position}"))
    }

    async fn execute(&mut self, command: RepositoryCommand) {
        debug!("Executing {command:?}");
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            RepositoryCommand::Add { at, minutes, reply } => {
                let at = at.unwrap_or_else(|| self.repository.clock.time());
                let result = self.repository.add_item_at(at, minutes).await;
                let _ = reply.send(result);
            }
            RepositoryCommand::Delete { positions, reply } => {
                let result = self.repository.delete_items(&positions).await;
                let _ = reply.send(result);
            }
            RepositoryCommand::AdjustDuration {
                position,
                minutes,
                reply,
            } => {
                let result = match self.resolve(position) {
                    Ok(id) => self.repository.adjust_duration(id, minutes).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Executes the repository event loop. A failed refresh stops the loop with an error.
    pub async fn run(mut self) -> Result<()> {
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Repository is shutting down");
                    return Ok(());
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.execute(command).await,
                        // Keep following the store for snapshot readers.
                        None => commands_open = false,
                    }
                }
                changed = self.repository.wait_for_change() => {
                    if !changed {
                        info!("Store closed its change channel");
                        return Ok(());
                    }
                    self.repository
                        .refresh()
                        .await
                        .inspect_err(|e| error!("Failed to refresh repository {e:?}"))?;
                    self.snapshots.send_replace(self.repository.snapshot());
                }
            }
        }
    }
}
