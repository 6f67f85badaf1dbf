//! Runtime configuration, assembled from the command line.

use crate::content::{ExerciseSource, FileExerciseSource, HttpExerciseSource};
use crate::error::{LabError, Result};
use crate::persistence::{FallbackStore, FileStore, MemoryStore, SessionStore};
use crate::sandbox::SandboxConfig;
use crate::session::AUTOSAVE_INTERVAL;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Idle sessions are destroyed after this long (5 minutes).
pub const SESSION_TTL_SECS: u64 = 300;

/// Upper bound on every call to the content service or snapshot store.
pub const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct LabConfig {
    pub sandbox: SandboxConfig,
    /// New sessions confine commands and paths to the sandbox root.
    pub sandboxed: bool,
    pub autosave_interval: Duration,
    pub session_ttl: Duration,
    pub collaborator_timeout: Duration,
    /// Base URL of the exercise content service.
    pub content_url: Option<String>,
    /// Local `{"exercises": [...]}` catalog, used when no URL is set.
    pub exercises_file: Option<PathBuf>,
    /// Directory for snapshot files. Snapshots stay in memory when unset.
    pub store_dir: Option<PathBuf>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            sandboxed: true,
            autosave_interval: AUTOSAVE_INTERVAL,
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            collaborator_timeout: COLLABORATOR_TIMEOUT,
            content_url: None,
            exercises_file: None,
            store_dir: None,
        }
    }
}

impl LabConfig {
    /// The snapshot store every session shares, with its fallback cache.
    pub fn build_store(&self) -> Arc<FallbackStore> {
        let inner: Arc<dyn SessionStore> = match &self.store_dir {
            Some(dir) => {
                info!(dir = ?dir, "Persisting snapshots to disk");
                Arc::new(FileStore::new(dir))
            }
            None => Arc::new(MemoryStore::new()),
        };
        FallbackStore::shared(inner, self.collaborator_timeout)
    }

    pub fn build_exercise_source(&self) -> Result<Option<Arc<dyn ExerciseSource>>> {
        if let Some(url) = &self.content_url {
            let source = HttpExerciseSource::new(url, self.collaborator_timeout)
                .map_err(|e| LabError::CollaboratorUnavailable(e.to_string()))?;
            return Ok(Some(Arc::new(source)));
        }
        Ok(self
            .exercises_file
            .as_ref()
            .map(|path| Arc::new(FileExerciseSource::new(path)) as Arc<dyn ExerciseSource>))
    }
}
