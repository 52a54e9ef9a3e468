//! File helpers used for staging rule bodies.
//!
//! The coordinator talks to a [`FileStore`] rather than `tokio::fs` directly
//! so tests can count deletes or force write failures.

use std::path::Path;

use anyhow::{Context, Result};

#[async_trait::async_trait]
pub trait FileStore: Send + Sync + std::fmt::Debug {
    /// Create `path` and any missing parents. Succeeds if it already exists.
    async fn create_dir_if_not_exists(&self, path: &Path) -> Result<()>;

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()>;

    async fn delete_file(&self, path: &Path) -> Result<()>;
}

/// [`FileStore`] backed by the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

#[async_trait::async_trait]
impl FileStore for LocalFileStore {
    async fn create_dir_if_not_exists(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("creating directory {}", path.display()))
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("writing file {}", path.display()))
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("deleting file {}", path.display()))
    }
}
