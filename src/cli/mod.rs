pub mod add;
pub mod output;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use add::AddCommand;
use anyhow::{bail, Result};
use chrono::{Days, Local};
use clap::{Parser, Subcommand};
use output::{render_days, render_items, render_widget};
use tokio::sync::mpsc;
use tracing::{info, level_filters::LevelFilter};

use crate::{
    config::load_or_create_device_id,
    repository::{ItemRepository, RepositoryEnvironment},
    service::{open_store, start_service},
    store::{
        entities::{DeviceId, DurationMinutes},
        file_store::{read_remote_changes, FileRecordStore},
        RecordStore,
    },
    utils::{
        clock::{Clock, DefaultClock},
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX},
    },
    widget::{widget_channel, widget_data, WidgetEntry},
};

#[derive(Parser, Debug)]
#[command(name = "practicelog", version, long_about = None)]
#[command(about = "Log metronome practice sessions grouped by day", long_about = None)]
pub(crate) struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Show the last 7 days of practice and the totals")]
    List {
        #[arg(long, help = "Only show sessions logged on this device")]
        this_device: bool,
    },
    #[command(about = "Show every session of the last 30 days with its position")]
    Items {
        #[arg(long, help = "Only show sessions logged on this device")]
        this_device: bool,
    },
    #[command(about = "Log a practice session")]
    Add {
        #[command(flatten)]
        command: AddCommand,
    },
    #[command(about = "Delete sessions by the positions shown by `items`")]
    Delete {
        #[arg(required = true)]
        positions: Vec<usize>,
    },
    #[command(about = "Change the length of a session, between 0 and 40 minutes")]
    Adjust { position: usize, minutes: f64 },
    #[command(about = "Add a couple of sample sessions")]
    Seed {},
    #[command(about = "Merge the record journal of another device")]
    Sync {
        #[arg(long)]
        from: PathBuf,
    },
    #[command(about = "Print the widget summary")]
    Widget {},
    #[command(about = "Keep the summary on screen and accept commands until Ctrl-C")]
    Watch {
        #[arg(long, help = "Only show sessions logged on this device")]
        this_device: bool,
    },
    #[command(about = "Print the id of this device")]
    Device {},
}

/// Sample sessions as (days ago, minutes).
const SEED_RECORDS: [(u64, f64); 2] = [(1, 7.), (7, 22.)];

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            dir
        }
        None => create_application_default_path()?,
    };

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(CLI_PREFIX, &dir, logging_level, args.log)?;

    let device_id = load_or_create_device_id(&dir)?;

    match args.commands {
        Commands::Device {} => {
            println!("{device_id}");
            Ok(())
        }
        Commands::Watch { this_device } => start_service(&dir, device_id, this_device).await,
        Commands::Widget {} => {
            let store = open_store(&dir, DefaultClock).await?;
            let entry = WidgetEntry {
                date: DefaultClock.time(),
                sum: widget_data(&store).await?,
            };
            println!("{}", render_widget(&entry));
            Ok(())
        }
        Commands::Sync { from } => {
            let store = open_store(&dir, DefaultClock).await?;
            let changes = read_remote_changes(&from).await?;
            let count = changes.len();
            store.merge_remote(changes).await?;
            info!("Merged {count} changes from {from:?}");
            println!("Merged {count} changes");
            Ok(())
        }
        Commands::List { this_device } => {
            let (repository, _signals) = open_repository(&dir, device_id).await?;
            println!("{}", render_days(&repository.snapshot(), this_device));
            Ok(())
        }
        Commands::Items { this_device } => {
            let (repository, _signals) = open_repository(&dir, device_id).await?;
            println!("{}", render_items(&repository.snapshot(), this_device));
            Ok(())
        }
        Commands::Add { command } => {
            let params = command.parse_values(Local::now())?;
            let (mut repository, _signals) = open_repository(&dir, device_id).await?;
            let at = params.at.unwrap_or_else(|| DefaultClock.time());
            repository.add_item_at(at, params.minutes).await?;
            print_after_change(repository).await
        }
        Commands::Delete { positions } => {
            let (mut repository, _signals) = open_repository(&dir, device_id).await?;
            repository.delete_items(&positions).await?;
            print_after_change(repository).await
        }
        Commands::Adjust { position, minutes } => {
            let (mut repository, _signals) = open_repository(&dir, device_id).await?;
            let Some(id) = repository.current_items().get(position).map(|item| item.id) else {
                bail!("No record at position {position}");
            };
            repository.adjust_duration(id, minutes).await?;
            print_after_change(repository).await
        }
        Commands::Seed {} => {
            let (mut repository, _signals) = open_repository(&dir, device_id).await?;
            let now = DefaultClock.time();
            for (days, minutes) in SEED_RECORDS {
                let at = now.checked_sub_days(Days::new(days)).unwrap_or(now);
                repository
                    .add_item_at(at, DurationMinutes::try_from(minutes)?)
                    .await?;
            }
            print_after_change(repository).await
        }
    }
}

type CliRepository = ItemRepository<FileRecordStore, Local>;

/// Opens a short-lived repository. The returned receiver stands in for the widget, which
/// doesn't run during one-shot commands.
async fn open_repository(
    dir: &Path,
    device_id: DeviceId,
) -> Result<(CliRepository, mpsc::Receiver<()>)> {
    let store = Arc::new(open_store(dir, DefaultClock).await?);
    let (notifier, signals) = widget_channel();
    let repository = ItemRepository::initialize(
        store,
        RepositoryEnvironment {
            clock: Box::new(DefaultClock),
            timezone: Local,
            device_id,
            notifier: Box::new(notifier),
        },
    )
    .await?;
    Ok((repository, signals))
}

async fn print_after_change(mut repository: CliRepository) -> Result<()> {
    repository.process_pending_changes().await?;
    println!("{}", render_days(&repository.snapshot(), false));
    Ok(())
}
