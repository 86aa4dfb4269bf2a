use std::{env, io, path::PathBuf};

use anyhow::Result;

/// Returns the directory holding the record journal, settings and logs. Created if missing.
pub fn create_application_default_path() -> Result<PathBuf> {
    let path = {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let mut path = PathBuf::from(
                    env::var("APPDATA").map_err(|_| anyhow::anyhow!("APPDATA is not set"))?,
                );
                path.push("practicelog");
                path
            } else {
                let mut path = env::var("XDG_STATE_HOME")
                    .map(PathBuf::from)
                    .or_else(|_| {
                        env::var("HOME").map(|home| {
                            let mut path = PathBuf::from(home);
                            path.push(".local/state");
                            path
                        })
                    })
                    .map_err(|_| anyhow::anyhow!("Couldn't find neither XDG_STATE_HOME nor HOME"))?;
                path.push("practicelog");
                path
            }
        }
    };

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}
