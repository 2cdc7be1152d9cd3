//! Catalog readers.
//!
//! The catalog is the source of truth for which jobs should be scheduled.
//! Readers page through enabled definitions in a stable order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{CatalogError, JobDefinition};

/// Read side of the job catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Up to `size` enabled definitions starting at `offset`.
    ///
    /// Ordering must be stable across calls so consecutive pages neither
    /// repeat nor skip records while the catalog is unchanged.
    async fn find_enabled(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Vec<JobDefinition>, CatalogError>;
}

/// Enabled jobs in catalog order (`created`, then `id`), paged.
fn enabled_page<'a>(
    jobs: impl Iterator<Item = &'a JobDefinition>,
    offset: usize,
    size: usize,
) -> Vec<JobDefinition> {
    let mut enabled: Vec<_> = jobs.filter(|job| job.enabled).collect();
    enabled.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
    enabled
        .into_iter()
        .skip(offset)
        .take(size)
        .cloned()
        .collect()
}

/// In-memory catalog with a small write side.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    jobs: RwLock<HashMap<Uuid, JobDefinition>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding `jobs`.
    pub fn with_jobs(jobs: impl IntoIterator<Item = JobDefinition>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|job| (job.id, job)).collect()),
        }
    }

    /// Insert or replace a definition.
    pub async fn save(&self, job: JobDefinition) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Look up a definition, enabled or not.
    pub async fn find_by_id(&self, id: Uuid) -> Option<JobDefinition> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Delete a definition. Returns whether it existed.
    pub async fn delete_by_id(&self, id: Uuid) -> bool {
        self.jobs.write().await.remove(&id).is_some()
    }

    /// Number of definitions, enabled or not.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_enabled(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Vec<JobDefinition>, CatalogError> {
        let jobs = self.jobs.read().await;
        Ok(enabled_page(jobs.values(), offset, size))
    }
}

/// Catalog backed by a JSON array of definitions on disk.
///
/// The file is re-read for every page, so edits are picked up on the next
/// reconciliation tick.
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every definition in the file, in file order.
    pub async fn load_all(&self) -> Result<Vec<JobDefinition>, CatalogError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let jobs: Vec<JobDefinition> = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), count = jobs.len(), "read catalog file");
        Ok(jobs)
    }
}

#[async_trait]
impl Catalog for JsonFileCatalog {
    async fn find_enabled(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Vec<JobDefinition>, CatalogError> {
        let jobs = self.load_all().await?;
        Ok(enabled_page(jobs.iter(), offset, size))
    }
}
