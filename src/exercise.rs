//! Exercise catalog and per-student progress.

use crate::content::ExerciseSource;
use crate::error::{LabError, Result};
use crate::evaluator::{CompletionEvaluator, KeywordOverlapEvaluator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rolling window of submitted code kept per exercise.
pub const MAX_RECENT_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default, alias = "starter_code")]
    pub starter_code: String,
    #[serde(default, alias = "solution_code")]
    pub solution_code: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default, alias = "expected_output")]
    pub expected_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseProgress {
    pub exercise_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default)]
    pub last_code: String,
    pub completed: bool,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub recent_attempts: VecDeque<String>,
}

impl ExerciseProgress {
    fn new(exercise_id: &str) -> Self {
        let now = Utc::now();
        Self {
            exercise_id: exercise_id.to_string(),
            started_at: now,
            completed_at: None,
            attempts: 0,
            last_code: String::new(),
            completed: false,
            last_activity: now,
            recent_attempts: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CatalogStatus {
    NotLoaded,
    Loaded,
    /// The stored catalog was empty and the service generated one.
    Generated,
    /// The service answered but has no exercises for the course.
    Empty,
    Unavailable { reason: String },
}

/// Result of one catalog fetch, ready to install into a manager.
#[derive(Debug, Clone)]
pub struct CatalogLoad {
    pub exercises: Vec<Exercise>,
    pub status: CatalogStatus,
}

impl CatalogLoad {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            exercises: Vec::new(),
            status: CatalogStatus::Unavailable {
                reason: reason.into(),
            },
        }
    }
}

async fn bounded<F>(timeout: Duration, what: &str, fut: F) -> Result<Vec<Exercise>>
where
    F: Future<Output = std::result::Result<Vec<Exercise>, crate::content::ContentError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(exercises)) => Ok(exercises),
        Ok(Err(e)) => Err(LabError::CollaboratorUnavailable(format!("{}: {}", what, e))),
        Err(_) => Err(LabError::CollaboratorUnavailable(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

/// Fetch a course catalog, falling back to on-demand generation when the
/// stored catalog is empty. Failures produce an empty catalog marked
/// unavailable; nothing is ever made up.
pub async fn fetch_catalog(
    source: &dyn ExerciseSource,
    course_id: &str,
    timeout: Duration,
) -> CatalogLoad {
    let unavailable = |e: LabError| {
        warn!(course_id, error = %e, "Exercise catalog unavailable");
        CatalogLoad::unavailable(e.to_string())
    };

    match bounded(timeout, "fetch exercises", source.fetch(course_id)).await {
        Ok(exercises) if !exercises.is_empty() => {
            info!(course_id, count = exercises.len(), "Loaded exercises");
            return CatalogLoad {
                exercises,
                status: CatalogStatus::Loaded,
            };
        }
        Ok(_) => {}
        Err(e) => return unavailable(e),
    }

    match bounded(timeout, "generate exercises", source.refresh(course_id)).await {
        Ok(exercises) if exercises.is_empty() => CatalogLoad {
            exercises,
            status: CatalogStatus::Empty,
        },
        Ok(exercises) => {
            info!(course_id, count = exercises.len(), "Generated exercises");
            CatalogLoad {
                exercises,
                status: CatalogStatus::Generated,
            }
        }
        Err(e) => unavailable(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_exercises: usize,
    pub completed_exercises: usize,
    pub percentage: u32,
}

pub struct ExerciseManager {
    catalog: Vec<Exercise>,
    status: CatalogStatus,
    progress: BTreeMap<String, ExerciseProgress>,
    current: Option<String>,
    evaluator: Arc<dyn CompletionEvaluator>,
    source: Option<Arc<dyn ExerciseSource>>,
    timeout: Duration,
}

impl Default for ExerciseManager {
    fn default() -> Self {
        Self::new(Arc::new(KeywordOverlapEvaluator::default()))
    }
}

impl ExerciseManager {
    pub fn new(evaluator: Arc<dyn CompletionEvaluator>) -> Self {
        Self {
            catalog: Vec::new(),
            status: CatalogStatus::NotLoaded,
            progress: BTreeMap::new(),
            current: None,
            evaluator,
            source: None,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ExerciseSource>, timeout: Duration) -> Self {
        self.source = Some(source);
        self.timeout = timeout;
        self
    }

    pub fn source(&self) -> Option<Arc<dyn ExerciseSource>> {
        self.source.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn catalog(&self) -> &[Exercise] {
        &self.catalog
    }

    pub fn status(&self) -> &CatalogStatus {
        &self.status
    }

    pub fn install_catalog(&mut self, load: CatalogLoad) {
        self.catalog = load.exercises;
        self.status = load.status;
    }

    /// Fetch and install the course catalog in one step.
    pub async fn load_exercises(&mut self, course_id: &str) -> &[Exercise] {
        let load = match &self.source {
            Some(source) => fetch_catalog(source.as_ref(), course_id, self.timeout).await,
            None => CatalogLoad::unavailable("no exercise source configured"),
        };
        self.install_catalog(load);
        &self.catalog
    }

    pub fn get(&self, id: &str) -> Option<&Exercise> {
        self.catalog.iter().find(|e| e.id == id)
    }

    pub fn current_exercise(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn progress(&self, id: &str) -> Option<&ExerciseProgress> {
        self.progress.get(id)
    }

    pub fn all_progress(&self) -> &BTreeMap<String, ExerciseProgress> {
        &self.progress
    }

    /// Replace progress wholesale, as when restoring a snapshot.
    pub fn restore_progress(
        &mut self,
        progress: BTreeMap<String, ExerciseProgress>,
        current: Option<String>,
    ) {
        self.progress = progress;
        self.current = current;
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.get(id).is_some() {
            Ok(())
        } else {
            Err(LabError::NotFound(format!("exercise {}", id)))
        }
    }

    fn progress_entry(&mut self, id: &str) -> &mut ExerciseProgress {
        self.progress
            .entry(id.to_string())
            .or_insert_with(|| ExerciseProgress::new(id))
    }

    pub fn select_exercise(&mut self, id: &str) -> Result<&Exercise> {
        self.require(id)?;
        self.progress_entry(id).last_activity = Utc::now();
        self.current = Some(id.to_string());
        self.get(id)
            .ok_or_else(|| LabError::NotFound(format!("exercise {}", id)))
    }

    pub fn record_attempt(&mut self, id: &str, code: &str) -> Result<&ExerciseProgress> {
        self.require(id)?;
        let progress = self.progress_entry(id);
        progress.attempts += 1;
        progress.last_code = code.to_string();
        progress.last_activity = Utc::now();
        if progress.recent_attempts.len() == MAX_RECENT_ATTEMPTS {
            progress.recent_attempts.pop_front();
        }
        progress.recent_attempts.push_back(code.to_string());
        Ok(&*progress)
    }

    /// Run the evaluator and mark the exercise complete on success. A
    /// completed exercise stays completed whatever is submitted later.
    pub fn evaluate_completion(&mut self, id: &str, code: &str, language: &str) -> Result<bool> {
        let exercise = self
            .catalog
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| LabError::NotFound(format!("exercise {}", id)))?;
        let progress = self
            .progress
            .entry(id.to_string())
            .or_insert_with(|| ExerciseProgress::new(id));
        if progress.completed {
            return Ok(true);
        }
        if self.evaluator.evaluate(exercise, code, language) {
            let now = Utc::now();
            progress.completed = true;
            progress.completed_at = Some(now);
            progress.last_activity = now;
            info!(exercise_id = id, attempts = progress.attempts, "Exercise completed");
        }
        Ok(progress.completed)
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        let total = self.catalog.len();
        let completed = self
            .catalog
            .iter()
            .filter(|e| self.progress.get(&e.id).is_some_and(|p| p.completed))
            .count();
        let percentage = if total == 0 {
            0
        } else {
            (completed as f64 * 100.0 / total as f64).round() as u32
        };
        ProgressSummary {
            total_exercises: total,
            completed_exercises: completed,
            percentage,
        }
    }
}
