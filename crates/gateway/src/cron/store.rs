//! Cron store persistence.
//!
//! Writes are atomic: the current file is first copied to `<path>.bak`,
//! the new content goes to `<path>.<pid>.<rand>.tmp`, and a rename moves
//! it into place. A crash mid-write leaves either the old or the new
//! content at the primary path, with `.bak` holding the previous state.

use std::path::{Path, PathBuf};

use sb_domain::{Error, Result};

use super::model::CronStoreFile;

pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("cron").join("jobs.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<CronStoreFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let file: CronStoreFile = serde_json::from_str(&raw)
                    .map_err(|e| Error::Store(format!("corrupt cron store: {e}")))?;
                Ok(file)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CronStoreFile::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn save(&self, file: &CronStoreFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Keep the previous content reachable while the new write lands.
        if self.path.exists() {
            let backup = backup_path(&self.path);
            if let Err(e) = std::fs::copy(&self.path, &backup) {
                tracing::warn!(error = %e, "failed to write cron store backup");
            }
        }

        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..6];
    s.push(format!(".{}.{}.tmp", std::process::id(), rand));
    PathBuf::from(s)
}
