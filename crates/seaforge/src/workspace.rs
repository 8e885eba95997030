//! Ephemeral per-call working directory.

use crate::constants::{BLOB_FILE_NAME, CONFIG_FILE_NAME, INPUT_FILE_NAME, WORKSPACE_PREFIX};
use crate::logger::Logger;
use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A uniquely named temporary directory that is removed when released or dropped.
///
/// Removal never fails the caller; problems are reported as warnings.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    logger: Logger,
}

impl Workspace {
    /// Create a fresh directory under the system temp dir.
    pub fn acquire(logger: Logger) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{WORKSPACE_PREFIX}-"))
            .tempdir()?;
        let path = dir.path().to_path_buf();
        logger.debug(format_args!("created workspace {}", path.display()));
        Ok(Self {
            dir: Some(dir),
            path,
            logger,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the script source is written.
    pub fn input_path(&self) -> PathBuf {
        self.path.join(INPUT_FILE_NAME)
    }

    /// Where the generator must leave the blob.
    pub fn blob_path(&self) -> PathBuf {
        self.path.join(BLOB_FILE_NAME)
    }

    /// Where the build-config document is written.
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE_NAME)
    }

    /// Remove the directory and everything in it.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => self
                .logger
                .debug(format_args!("removed workspace {}", self.path.display())),
            Err(e) => self.logger.warn(format_args!(
                "failed to remove workspace {}: {}",
                self.path.display(),
                e
            )),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
