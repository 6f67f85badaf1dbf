//! Shared application state for the HTTP service.

use crate::config::LabConfig;
use crate::content::ExerciseSource;
use crate::error::Result;
use crate::exercise::ExerciseManager;
use crate::persistence::FallbackStore;
use crate::session::{SessionController, SessionOptions, SharedSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe session storage.
pub type Sessions = Arc<RwLock<HashMap<String, SharedSession>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Sessions,
    pub config: Arc<LabConfig>,
    pub store: Arc<FallbackStore>,
    pub content: Option<Arc<dyn ExerciseSource>>,
}

impl AppState {
    pub fn new(config: LabConfig) -> Result<Self> {
        let store = config.build_store();
        let content = config.build_exercise_source()?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            store,
            content,
        })
    }

    /// Build and initialize a controller wired to the shared collaborators.
    pub fn new_session(&self, options: SessionOptions) -> Result<SessionController> {
        let mut exercises = ExerciseManager::default();
        if let Some(source) = &self.content {
            exercises = exercises.with_source(source.clone(), self.config.collaborator_timeout);
        }
        let mut session =
            SessionController::new(options, self.config.sandbox.clone(), self.store.clone())
                .with_exercises(exercises);
        session.initialize()?;
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }
}
