use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tempfile::TempDir;

pub const DEFAULT_RETENTION: usize = 32;

const IMAGE_PREFIX: &str = "plot-";
const IMAGE_SUFFIX: &str = ".png";

pub struct ArtifactStore {
    dir: TempDir,
    retention: usize,
    retained: Mutex<VecDeque<PathBuf>>,
}

impl ArtifactStore {
    pub fn new(retention: usize) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("codebox-plots-")
            .tempdir()
            .context("failed to create plot artifact directory")?;
        Ok(Self::with_dir(dir, retention))
    }

    pub fn with_dir(dir: TempDir, retention: usize) -> Self {
        Self {
            dir,
            retention: retention.max(1),
            retained: Mutex::new(VecDeque::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Creates an empty, uniquely named image file for a plot to be written to.
    pub fn allocate(&self) -> io::Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(IMAGE_PREFIX)
            .suffix(IMAGE_SUFFIX)
            .tempfile_in(self.dir.path())?;
        file.into_temp_path().keep().map_err(|err| err.error)
    }

    pub fn commit(&self, path: PathBuf) {
        let evicted: Vec<PathBuf> = {
            let Ok(mut retained) = self.retained.lock() else {
                tracing::warn!("artifact index poisoned; image not tracked");
                return;
            };
            retained.push_back(path);
            let excess = retained.len().saturating_sub(self.retention);
            retained.drain(..excess).collect()
        };
        for path in evicted {
            remove_quietly(&path);
        }
    }

    /// Deletes an allocated image that never became a result.
    pub fn discard(&self, path: &Path) {
        remove_quietly(path);
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let retained = self.retained.lock().ok()?;
        retained
            .iter()
            .find(|path| path.file_name().is_some_and(|file| file == name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.retained.lock().map(|retained| retained.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed plot image"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove plot image"),
    }
}
