//! Process-wide key-value settings stored next to the record journal.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::entities::DeviceId;

pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Identifies this installation as the creator of records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_creator_id: Option<DeviceId>,
}

impl Settings {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(SETTINGS_FILE_NAME)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Malformed settings file {path:?}")),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read settings file {path:?}")),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write settings file {path:?}"))
    }
}

/// Reads this installation's device id, generating and persisting one on first use.
pub fn load_or_create_device_id(dir: &Path) -> Result<DeviceId> {
    let mut settings = Settings::load(dir)?;
    if let Some(id) = settings.item_creator_id.clone() {
        info!("Retrieved device id {id}");
        return Ok(id);
    }

    let id = DeviceId::generate();
    settings.item_creator_id = Some(id.clone());
    settings.save(dir)?;
    info!("Stored new device id {id}");
    Ok(id)
}
