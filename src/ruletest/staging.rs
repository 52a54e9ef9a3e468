//! Staging of untrusted rule bodies on disk.
//!
//! Each test run writes its rule to `~<random>.temp` under the staging
//! directory and gets back a [`StagedRule`]. Releasing the staged rule
//! deletes the file; if the owner is dropped mid-run the file is still
//! deleted, exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, warn};

use super::fs::FileStore;
use super::TestError;

const NAME_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
    files: Arc<dyn FileStore>,
}

impl StagingStore {
    /// Open the store, creating `dir` if needed.
    ///
    /// A directory that cannot be created is logged; staging will then fail
    /// per run rather than here.
    pub async fn open(dir: PathBuf, files: Arc<dyn FileStore>) -> Self {
        if let Err(e) = files.create_dir_if_not_exists(&dir).await {
            error!(
                dir = %dir.display(),
                error = %e,
                "failed to create the test staging directory"
            );
        }
        Self { dir, files }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` to a fresh, unpredictably named file.
    pub async fn stage(&self, content: &str) -> Result<StagedRule, TestError> {
        let name = staging_file_name();
        let path = self.dir.join(&name);

        if let Err(e) = self.files.write_file(&path, content.as_bytes()).await {
            error!(
                file = %name,
                dir = %self.dir.display(),
                error = %e,
                "failed to write staged rule"
            );
            return Err(TestError::Staging(e));
        }

        debug!(path = %path.display(), bytes = content.len(), "rule staged");
        Ok(StagedRule {
            path,
            files: Some(self.files.clone()),
        })
    }
}

fn staging_file_name() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_LEN)
        .map(char::from)
        .collect();
    format!("~{token}.temp")
}

/// A rule body on disk, owned by exactly one run.
#[derive(Debug)]
pub struct StagedRule {
    path: PathBuf,
    // `None` once released.
    files: Option<Arc<dyn FileStore>>,
}

impl StagedRule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the staged file. Failures are logged and swallowed.
    pub async fn release(mut self) {
        if let Some(files) = self.files.take() {
            unstage(files.as_ref(), &self.path).await;
        }
    }
}

async fn unstage(files: &dyn FileStore, path: &Path) {
    match files.delete_file(path).await {
        Ok(()) => debug!(path = %path.display(), "staged rule removed"),
        Err(e) => error!(
            path = %path.display(),
            error = %e,
            "failed to delete temporary test file"
        ),
    }
}

impl Drop for StagedRule {
    fn drop(&mut self) {
        let Some(files) = self.files.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        warn!(path = %path.display(), "staged rule dropped before release; cleaning up");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { unstage(files.as_ref(), &path).await });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    error!(path = %path.display(), error = %e, "failed to delete temporary test file");
                }
            }
        }
    }
}
