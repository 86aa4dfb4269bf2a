use anyhow::Result;

/// The repository confines every mutation to one task, so the application runs on a single
/// thread.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
