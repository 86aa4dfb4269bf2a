use anyhow::{bail, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cli::output::{render_days, render_widget},
    repository::module::RepositoryHandle,
    store::entities::DurationMinutes,
    widget::WidgetEntry,
};

pub const CONSOLE_HELP: &str =
    "Commands: add [MINUTES] | delete POSITION... | adjust POSITION MINUTES | help";

/// Line commands accepted while watching.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Add(DurationMinutes),
    Delete(Vec<usize>),
    Adjust { position: usize, minutes: f64 },
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            bail!("Empty command");
        };
        match command {
            "add" | "a" => match words.next() {
                Some(minutes) => Ok(Self::Add(minutes.parse()?)),
                None => Ok(Self::Add(DurationMinutes::DEFAULT)),
            },
            "delete" | "d" => {
                let positions = words
                    .map(|word| {
                        word.parse::<usize>()
                            .with_context(|| format!("Invalid position {word}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                if positions.is_empty() {
                    bail!("Nothing to delete");
                }
                Ok(Self::Delete(positions))
            }
            "adjust" | "j" => {
                let (Some(position), Some(minutes)) = (words.next(), words.next()) else {
                    bail!("Usage: adjust POSITION MINUTES");
                };
                Ok(Self::Adjust {
                    position: position.parse()?,
                    minutes: minutes.parse()?,
                })
            }
            "help" | "h" => Ok(Self::Help),
            other => bail!("Unknown command {other}"),
        }
    }
}

async fn execute(handle: &RepositoryHandle, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Add(minutes) => {
            handle.add(None, minutes).await?;
        }
        ConsoleCommand::Delete(positions) => handle.delete(positions).await?,
        ConsoleCommand::Adjust { position, minutes } => {
            handle.adjust_duration(position, minutes).await?
        }
        ConsoleCommand::Help => println!("{CONSOLE_HELP}"),
    }
    Ok(())
}

/// Re-renders on every snapshot and widget entry, and forwards stdin commands to the
/// repository.
pub async fn run_console(
    handle: RepositoryHandle,
    entries: watch::Receiver<WidgetEntry>,
    only_this_device: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut snapshots = WatchStream::new(handle.snapshots());
    let mut entries = WatchStream::new(entries);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    println!("{CONSOLE_HELP}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Console is shutting down");
                return Ok(());
            }
            Some(snapshot) = snapshots.next() => {
                println!("\n{}", render_days(&snapshot, only_this_device));
            }
            Some(entry) = entries.next() => {
                println!("{}", render_widget(&entry));
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let result = match ConsoleCommand::parse(&line) {
                            Ok(command) => execute(&handle, command).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            error!("Command {line:?} failed {e:?}");
                            println!("{e}");
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }
}
