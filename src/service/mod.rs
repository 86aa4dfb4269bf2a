use std::{future::Future, path::Path, sync::Arc};

use anyhow::Result;
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    repository::{module::RepositoryModule, ItemRepository, RepositoryEnvironment},
    store::{entities::DeviceId, file_store::FileRecordStore},
    utils::clock::{Clock, DefaultClock},
    widget::{widget_channel, WidgetModule, DEFAULT_REFRESH_INTERVAL},
};

pub mod console;
pub mod shutdown;

/// Whichever module stops first takes the others down with it.
async fn stop_others_on_exit(
    module: impl Future<Output = Result<()>>,
    shutdown_token: &CancellationToken,
) -> Result<()> {
    let result = module.await;
    shutdown_token.cancel();
    result
}

pub async fn open_store(dir: &Path, clock: impl Clock) -> Result<FileRecordStore> {
    Ok(FileRecordStore::open(dir.join("records"), Box::new(clock)).await?)
}

/// Runs the repository, the widget and the console until Ctrl-C or until one of them fails.
pub async fn start_service(dir: &Path, device_id: DeviceId, only_this_device: bool) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    let store = Arc::new(open_store(dir, DefaultClock).await?);
    let (notifier, signals) = widget_channel();
    let repository = ItemRepository::initialize(
        store.clone(),
        RepositoryEnvironment {
            clock: Box::new(DefaultClock),
            timezone: Local,
            device_id,
            notifier: Box::new(notifier),
        },
    )
    .await?;

    let (repository_module, handle) = RepositoryModule::new(repository, shutdown_token.clone());
    let (widget_module, entries) = WidgetModule::new(
        store,
        signals,
        Box::new(DefaultClock),
        DEFAULT_REFRESH_INTERVAL,
        shutdown_token.clone(),
    );

    let (_, repository_result, widget_result, console_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        stop_others_on_exit(repository_module.run(), &shutdown_token),
        stop_others_on_exit(widget_module.run(), &shutdown_token),
        stop_others_on_exit(
            console::run_console(handle, entries, only_this_device, shutdown_token.clone()),
            &shutdown_token
        ),
    );

    if let Err(e) = &widget_result {
        error!("Widget module got an error {e:?}");
    }

    if let Err(e) = &console_result {
        error!("Console got an error {e:?}");
    }

    repository_result
        .inspect_err(|e| error!("Repository module got an error {e:?}"))
        .and(widget_result)
        .and(console_result)
}
