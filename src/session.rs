//! Session controller: owns every lab component for one student session.

use crate::error::{LabError, Result};
use crate::events::{EventBus, EventKind, LabEvent, SubscriptionId};
use crate::exercise::{
    fetch_catalog, CatalogLoad, CatalogStatus, Exercise, ExerciseManager, ExerciseProgress,
    ProgressSummary,
};
use crate::persistence::{FallbackStore, SaveOutcome};
use crate::sandbox::{AuditLog, PathAccess, SandboxConfig, SandboxPolicy};
use crate::terminal::{CommandOutput, TerminalContext, TerminalInterpreter};
use crate::vfs::{VfsNode, VirtualFileSystem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Default autosave period.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

pub type SharedSession = Arc<Mutex<SessionController>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Panel {
    Exercises,
    Editor,
    Terminal,
    Assistant,
}

impl Panel {
    pub const ALL: [Panel; 4] = [Panel::Exercises, Panel::Editor, Panel::Terminal, Panel::Assistant];

    pub fn as_str(self) -> &'static str {
        match self {
            Panel::Exercises => "exercises",
            Panel::Editor => "editor",
            Panel::Terminal => "terminal",
            Panel::Assistant => "assistant",
        }
    }
}

impl FromStr for Panel {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        Panel::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| LabError::NotFound(format!("panel {}", s)))
    }
}

/// Which UI panels are visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelState(BTreeMap<Panel, bool>);

impl Default for PanelState {
    fn default() -> Self {
        Self(
            Panel::ALL
                .iter()
                .map(|&p| (p, p != Panel::Assistant))
                .collect(),
        )
    }
}

impl PanelState {
    pub fn is_visible(&self, panel: Panel) -> bool {
        self.0.get(&panel).copied().unwrap_or(false)
    }

    fn set(&mut self, panel: Panel, visible: bool) {
        self.0.insert(panel, visible);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Ready => "ready",
            Lifecycle::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Who the session is for.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub student_id: String,
    pub course_id: String,
    pub course_title: String,
    pub language: String,
    pub sandboxed: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            student_id: "student".to_string(),
            course_id: String::new(),
            course_title: String::new(),
            language: "python".to_string(),
            sandboxed: true,
        }
    }
}

/// Persisted form of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub student_id: String,
    pub course_id: String,
    pub course_title: String,
    pub current_language: String,
    pub panel_states: PanelState,
    pub file_system_state: VfsNode,
    pub exercise_progress: BTreeMap<String, ExerciseProgress>,
    pub terminal_history: Vec<String>,
    pub lab_start_time: DateTime<Utc>,
    /// Seconds spent in the lab across all resumptions.
    pub total_lab_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_exercise_id: Option<String>,
}

/// Summary of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub course_title: String,
    pub language: String,
    pub state: Lifecycle,
    pub sandboxed: bool,
    pub cwd: String,
    pub panels: PanelState,
    pub catalog: CatalogStatus,
    pub progress: ProgressSummary,
    pub lab_seconds: u64,
    pub idle_secs: u64,
}

fn corrupt<E: fmt::Display>(e: E) -> LabError {
    LabError::SnapshotCorrupt(e.to_string())
}

pub fn snapshot_key(session_id: &str) -> String {
    format!("lab_state_{}", session_id)
}

/// `lab-<unix millis>-<random>`
pub fn generate_session_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("lab-{}-{}", Utc::now().timestamp_millis(), &random[..9])
}

/// A snapshot taken under the session lock, written after it is released.
struct PendingSave {
    key: String,
    json: String,
    snapshot: SessionSnapshot,
    store: Arc<FallbackStore>,
}

async fn read_snapshot(store: &FallbackStore, session_id: &str) -> Result<SessionSnapshot> {
    let key = snapshot_key(session_id);
    let json = match store.load(&key).await {
        Ok(Some(json)) => json,
        Ok(None) => return Err(LabError::NotFound(format!("no snapshot under {}", key))),
        Err(e) => return Err(LabError::CollaboratorUnavailable(e.to_string())),
    };
    serde_json::from_str(&json).map_err(corrupt)
}

pub struct SessionController {
    session_id: String,
    student_id: String,
    course_id: String,
    course_title: String,
    language: String,
    lifecycle: Lifecycle,
    vfs: VirtualFileSystem,
    policy: SandboxPolicy,
    terminal: TerminalInterpreter,
    exercises: ExerciseManager,
    panels: PanelState,
    bus: EventBus,
    store: Arc<FallbackStore>,
    lab_start_time: DateTime<Utc>,
    accumulated_seconds: u64,
    resumed_at: Instant,
    last_activity: Instant,
    autosave: Option<AbortHandle>,
}

impl SessionController {
    pub fn new(options: SessionOptions, sandbox: SandboxConfig, store: Arc<FallbackStore>) -> Self {
        let session_id = options.session_id.unwrap_or_else(generate_session_id);
        let root = sandbox.root().to_string();
        let audit = AuditLog::new(options.student_id.clone(), session_id.clone());
        Self {
            vfs: VirtualFileSystem::seeded(&root),
            policy: SandboxPolicy::new(sandbox, options.sandboxed, audit),
            terminal: TerminalInterpreter::new(&root),
            exercises: ExerciseManager::default(),
            panels: PanelState::default(),
            bus: EventBus::new(),
            session_id,
            student_id: options.student_id,
            course_id: options.course_id,
            course_title: options.course_title,
            language: options.language,
            lifecycle: Lifecycle::Uninitialized,
            store,
            lab_start_time: Utc::now(),
            accumulated_seconds: 0,
            resumed_at: Instant::now(),
            last_activity: Instant::now(),
            autosave: None,
        }
    }

    pub fn with_exercises(mut self, exercises: ExerciseManager) -> Self {
        self.exercises = exercises;
        self
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.vfs
    }

    pub fn terminal(&self) -> &TerminalInterpreter {
        &self.terminal
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn exercises(&self) -> &ExerciseManager {
        &self.exercises
    }

    pub fn panels(&self) -> &PanelState {
        &self.panels
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Lab time including the current stretch while ready.
    pub fn total_lab_seconds(&self) -> u64 {
        match self.lifecycle {
            Lifecycle::Ready => self.accumulated_seconds + self.resumed_at.elapsed().as_secs(),
            _ => self.accumulated_seconds,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.session_id.clone(),
            student_id: self.student_id.clone(),
            course_id: self.course_id.clone(),
            course_title: self.course_title.clone(),
            language: self.language.clone(),
            state: self.lifecycle,
            sandboxed: self.policy.is_sandboxed(),
            cwd: self.terminal.current_directory().to_string(),
            panels: self.panels.clone(),
            catalog: self.exercises.status().clone(),
            progress: self.exercises.progress_summary(),
            lab_seconds: self.total_lab_seconds(),
            idle_secs: self.idle_for().as_secs(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.lifecycle == Lifecycle::Ready {
            Ok(())
        } else {
            Err(LabError::InvalidState(format!(
                "session {} is {}",
                self.session_id, self.lifecycle
            )))
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Wire the components together and become ready. Only valid once.
    pub fn initialize(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Uninitialized {
            return Err(LabError::InvalidState(format!(
                "cannot initialize a session that is {}",
                self.lifecycle
            )));
        }
        self.lifecycle = Lifecycle::Initializing;
        let root = self.policy.root().to_string();
        if let Err(e) = self.vfs.mkdir_all(&root) {
            self.lifecycle = Lifecycle::Uninitialized;
            return Err(e.into());
        }
        self.terminal = TerminalInterpreter::new(&root);
        self.lifecycle = Lifecycle::Ready;
        self.resumed_at = Instant::now();
        self.touch();
        info!(
            session_id = %self.session_id,
            student_id = %self.student_id,
            sandboxed = self.policy.is_sandboxed(),
            root = %root,
            "Session ready"
        );
        self.emit(&LabEvent::SessionReady {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }

    // ---- event bus ----

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LabEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn on_any<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&LabEvent) + Send + Sync + 'static,
    {
        self.bus.on_any(handler)
    }

    pub fn off(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        self.bus.off(kind, id)
    }

    pub fn emit(&self, event: &LabEvent) {
        self.bus.emit(event);
    }

    // ---- panels ----

    fn set_panel(&mut self, panel: Panel, visible: bool) -> Result<()> {
        self.ensure_ready()?;
        self.panels.set(panel, visible);
        self.touch();
        self.emit(&LabEvent::PanelToggled { panel, visible });
        Ok(())
    }

    /// Flip a panel and return its new visibility.
    pub fn toggle_panel(&mut self, panel: Panel) -> Result<bool> {
        let visible = !self.panels.is_visible(panel);
        self.set_panel(panel, visible)?;
        Ok(visible)
    }

    pub fn show_panel(&mut self, panel: Panel) -> Result<()> {
        self.set_panel(panel, true)
    }

    pub fn hide_panel(&mut self, panel: Panel) -> Result<()> {
        self.set_panel(panel, false)
    }

    pub fn set_language(&mut self, language: &str) -> Result<()> {
        self.ensure_ready()?;
        self.language = language.to_string();
        self.touch();
        Ok(())
    }

    // ---- terminal ----

    pub fn execute_command(&mut self, line: &str) -> Result<CommandOutput> {
        self.ensure_ready()?;
        self.touch();
        let mut ctx = TerminalContext {
            vfs: &mut self.vfs,
            policy: &mut self.policy,
            user: &self.student_id,
        };
        let output = self.terminal.execute(line, &mut ctx);
        if !line.trim().is_empty() {
            self.emit(&LabEvent::TerminalCommand {
                command: line.trim().to_string(),
                output: output.text.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(output)
    }

    pub fn recall_previous(&mut self) -> Result<String> {
        self.ensure_ready()?;
        Ok(self.terminal.recall_previous())
    }

    pub fn recall_next(&mut self) -> Result<String> {
        self.ensure_ready()?;
        Ok(self.terminal.recall_next())
    }

    // ---- editor files ----

    fn checked_path(&self, path: &str) -> Result<String> {
        let resolved = VirtualFileSystem::resolve(path, self.terminal.current_directory());
        match self.policy.check_path_access(&resolved) {
            PathAccess::Allowed => Ok(resolved),
            PathAccess::Denied(reason) => Err(LabError::Denied(reason)),
        }
    }

    /// Read a file for the editor, relative to the terminal's directory.
    pub fn read_file(&mut self, path: &str) -> Result<String> {
        self.ensure_ready()?;
        let resolved = self.checked_path(path)?;
        self.touch();
        Ok(self.vfs.read(&resolved)?.to_string())
    }

    pub fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        self.ensure_ready()?;
        let resolved = self.checked_path(path)?;
        self.touch();
        self.vfs.write(&resolved, content)?;
        debug!(session_id = %self.session_id, path = %resolved, "Editor saved file");
        Ok(())
    }

    // ---- exercises ----

    /// Install a fetched catalog. Returns the number of exercises.
    pub fn install_exercises(&mut self, load: CatalogLoad) -> Result<usize> {
        self.ensure_ready()?;
        let count = load.exercises.len();
        let status = load.status.clone();
        self.exercises.install_catalog(load);
        self.emit(&LabEvent::ExercisesLoaded { count, status });
        Ok(count)
    }

    /// Load the course catalog without holding the session lock while the
    /// content service is consulted. Terminal commands keep running in the
    /// meantime; the result is dropped if the session was destroyed.
    pub async fn load_exercises(session: &SharedSession) -> Result<usize> {
        let (source, course_id, timeout) = {
            let guard = session.lock().await;
            guard.ensure_ready()?;
            (
                guard.exercises.source(),
                guard.course_id.clone(),
                guard.exercises.timeout(),
            )
        };
        let load = match source {
            Some(source) => fetch_catalog(source.as_ref(), &course_id, timeout).await,
            None => CatalogLoad::unavailable("no exercise source configured"),
        };
        let mut guard = session.lock().await;
        if guard.lifecycle == Lifecycle::Destroyed {
            debug!(session_id = %guard.session_id, "Discarding exercise load for destroyed session");
            return Err(LabError::InvalidState(format!(
                "session {} was destroyed while loading exercises",
                guard.session_id
            )));
        }
        guard.install_exercises(load)
    }

    pub fn select_exercise(&mut self, id: &str) -> Result<Exercise> {
        self.ensure_ready()?;
        self.touch();
        let exercise = self.exercises.select_exercise(id)?.clone();
        self.emit(&LabEvent::ExerciseSelected {
            exercise_id: id.to_string(),
        });
        Ok(exercise)
    }

    /// Record a code run. No code is executed.
    pub fn run_code(&mut self, id: &str, code: &str) -> Result<ExerciseProgress> {
        self.ensure_ready()?;
        self.touch();
        let progress = self.exercises.record_attempt(id, code)?.clone();
        self.emit(&LabEvent::ExerciseAttempted {
            exercise_id: id.to_string(),
            attempts: progress.attempts,
        });
        Ok(progress)
    }

    /// Record an attempt and evaluate it for completion.
    pub fn submit_code(&mut self, id: &str, code: &str) -> Result<bool> {
        let was_completed = self
            .exercises
            .progress(id)
            .is_some_and(|p| p.completed);
        self.run_code(id, code)?;
        let completed = self.exercises.evaluate_completion(id, code, &self.language)?;
        if completed && !was_completed {
            self.emit(&LabEvent::ExerciseCompleted {
                exercise_id: id.to_string(),
                summary: self.exercises.progress_summary(),
            });
        }
        Ok(completed)
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        self.exercises.progress_summary()
    }

    // ---- persistence ----

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            student_id: self.student_id.clone(),
            course_id: self.course_id.clone(),
            course_title: self.course_title.clone(),
            current_language: self.language.clone(),
            panel_states: self.panels.clone(),
            file_system_state: self.vfs.serialize(),
            exercise_progress: self.exercises.all_progress().clone(),
            terminal_history: self.terminal.history().to_vec(),
            lab_start_time: self.lab_start_time,
            total_lab_time: self.total_lab_seconds(),
            current_directory: Some(self.terminal.current_directory().to_string()),
            sandbox_root: Some(self.policy.root().to_string()),
            current_exercise_id: self.exercises.current_exercise().map(str::to_string),
        }
    }

    fn begin_save(&self) -> Result<PendingSave> {
        self.ensure_ready()?;
        let snapshot = self.snapshot();
        let json = serde_json::to_string(&snapshot).map_err(corrupt)?;
        Ok(PendingSave {
            key: snapshot_key(&self.session_id),
            json,
            snapshot,
            store: self.store.clone(),
        })
    }

    fn finish_save(&mut self, key: String, outcome: SaveOutcome) {
        let cached_locally = outcome.cached_locally();
        debug!(session_id = %self.session_id, %key, cached_locally, "State saved");
        self.emit(&LabEvent::StateSaved {
            key,
            cached_locally,
        });
    }

    /// Write a snapshot to the store. When the store is unreachable the
    /// snapshot is kept in the shared fallback cache and still returned.
    pub async fn save_state(&mut self) -> Result<SessionSnapshot> {
        let pending = self.begin_save()?;
        let outcome = pending.store.save(&pending.key, &pending.json).await;
        self.finish_save(pending.key, outcome);
        Ok(pending.snapshot)
    }

    /// Like [`save_state`](Self::save_state), but the session stays unlocked
    /// while the store is written, so terminal commands keep running. A
    /// session destroyed meanwhile gets no `state:saved` event.
    pub async fn save_shared(session: &SharedSession) -> Result<SessionSnapshot> {
        let pending = session.lock().await.begin_save()?;
        let outcome = pending.store.save(&pending.key, &pending.json).await;
        let mut guard = session.lock().await;
        if guard.lifecycle == Lifecycle::Destroyed {
            debug!(session_id = %guard.session_id, "Session destroyed during save");
        } else {
            guard.finish_save(pending.key, outcome);
        }
        Ok(pending.snapshot)
    }

    /// Restore a snapshot, by default this session's own. Either every
    /// component is replaced or, on any error, nothing is.
    pub async fn load_state(&mut self, session_id: Option<&str>) -> Result<()> {
        self.ensure_ready()?;
        let source_id = session_id.unwrap_or(&self.session_id).to_string();
        let snapshot = read_snapshot(&self.store, &source_id).await?;
        self.apply_snapshot(source_id, snapshot)
    }

    /// Like [`load_state`](Self::load_state), with the store read done
    /// outside the session lock.
    pub async fn load_shared(session: &SharedSession, session_id: Option<&str>) -> Result<()> {
        let (store, source_id) = {
            let guard = session.lock().await;
            guard.ensure_ready()?;
            let source_id = session_id.unwrap_or(&guard.session_id).to_string();
            (guard.store.clone(), source_id)
        };
        let snapshot = read_snapshot(&store, &source_id).await?;
        let mut guard = session.lock().await;
        guard.ensure_ready()?;
        guard.apply_snapshot(source_id, snapshot)
    }

    fn apply_snapshot(&mut self, source_id: String, snapshot: SessionSnapshot) -> Result<()> {
        self.restore(snapshot)?;
        info!(session_id = %self.session_id, from = %source_id, "State restored");
        self.emit(&LabEvent::StateLoaded {
            session_id: source_id,
        });
        Ok(())
    }

    fn restore(&mut self, snapshot: SessionSnapshot) -> Result<()> {
        let vfs = VirtualFileSystem::from_tree(snapshot.file_system_state).map_err(corrupt)?;
        let config = match &snapshot.sandbox_root {
            Some(root) if root != self.policy.root() => {
                self.policy.config().with_root(root).map_err(corrupt)?
            }
            _ => self.policy.config().clone(),
        };
        if !vfs.is_dir(config.root()) {
            return Err(corrupt(format!(
                "sandbox root {} missing from tree",
                config.root()
            )));
        }
        let mut policy = self.policy.clone();
        policy.set_config(config);
        let cwd = snapshot
            .current_directory
            .filter(|d| vfs.is_dir(d) && policy.check_path_access(d).is_allowed())
            .unwrap_or_else(|| policy.root().to_string());

        self.vfs = vfs;
        self.policy = policy;
        self.terminal.restore(&cwd, snapshot.terminal_history);
        self.exercises
            .restore_progress(snapshot.exercise_progress, snapshot.current_exercise_id);
        self.panels = snapshot.panel_states;
        self.language = snapshot.current_language;
        self.lab_start_time = snapshot.lab_start_time;
        self.accumulated_seconds = snapshot.total_lab_time;
        self.resumed_at = Instant::now();
        self.touch();
        Ok(())
    }

    // ---- lifecycle end ----

    fn set_autosave(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.autosave.replace(handle) {
            previous.abort();
        }
    }

    /// Save every `period` while the session is ready. The task holds only
    /// a weak reference and stops once the session is destroyed or dropped.
    pub async fn start_autosave(session: &SharedSession, period: Duration) {
        let weak = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                let lifecycle = session.lock().await.lifecycle;
                match lifecycle {
                    Lifecycle::Ready => {
                        if let Err(e) = Self::save_shared(&session).await {
                            warn!(error = %e, "Autosave failed");
                        }
                    }
                    Lifecycle::Destroyed => break,
                    _ => {}
                }
            }
        });
        session.lock().await.set_autosave(handle.abort_handle());
    }

    /// Final save, drop all subscribers, stop autosave. Terminal state.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Destroyed {
            return Err(LabError::InvalidState(format!(
                "session {} is already destroyed",
                self.session_id
            )));
        }
        if self.lifecycle == Lifecycle::Ready {
            if let Err(e) = self.save_state().await {
                warn!(session_id = %self.session_id, error = %e, "Final save failed");
            }
            self.accumulated_seconds = self.total_lab_seconds();
        }
        if let Some(handle) = self.autosave.take() {
            handle.abort();
        }
        self.emit(&LabEvent::SessionDestroyed {
            session_id: self.session_id.clone(),
        });
        self.bus.clear();
        self.lifecycle = Lifecycle::Destroyed;
        info!(session_id = %self.session_id, "Session destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, SessionStore, StoreError};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct DownStore;

    #[async_trait]
    impl SessionStore for DownStore {
        async fn save(&self, _: &str, _: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("backend down")))
        }

        async fn load(&self, _: &str) -> std::result::Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("backend down")))
        }
    }

    /// Holds every save until released.
    struct GatedStore {
        gate: Arc<Notify>,
        inner: MemoryStore,
    }

    #[async_trait]
    impl SessionStore for GatedStore {
        async fn save(&self, key: &str, json: &str) -> std::result::Result<(), StoreError> {
            self.gate.notified().await;
            self.inner.save(key, json).await
        }

        async fn load(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.load(key).await
        }
    }

    fn controller_with(store: Arc<dyn SessionStore>) -> SessionController {
        controller_on(FallbackStore::shared(store, Duration::from_secs(3)))
    }

    fn controller_on(store: Arc<FallbackStore>) -> SessionController {
        let options = SessionOptions {
            session_id: Some("lab-test".into()),
            student_id: "stu-7".into(),
            course_id: "linux-101".into(),
            course_title: "Linux Basics".into(),
            ..SessionOptions::default()
        };
        let mut ctl = SessionController::new(options, SandboxConfig::default(), store);
        ctl.initialize().unwrap();
        ctl
    }

    fn controller() -> SessionController {
        controller_with(Arc::new(MemoryStore::new()))
    }

    fn recorder(ctl: &mut SessionController) -> Arc<StdMutex<Vec<&'static str>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.on_any(move |e| sink.lock().unwrap().push(e.kind().as_str()));
        seen
    }

    #[test]
    fn generated_ids_have_lab_prefix() {
        let id = generate_session_id();
        let parts: Vec<_> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "lab");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn initialize_only_from_uninitialized() {
        let mut ctl = controller();
        assert_eq!(ctl.lifecycle(), Lifecycle::Ready);
        assert!(matches!(ctl.initialize(), Err(LabError::InvalidState(_))));
    }

    #[test]
    fn operations_require_ready() {
        let mut ctl = SessionController::new(
            SessionOptions::default(),
            SandboxConfig::default(),
            FallbackStore::shared(Arc::new(MemoryStore::new()), Duration::from_secs(3)),
        );
        assert!(matches!(ctl.execute_command("ls"), Err(LabError::InvalidState(_))));
        assert!(matches!(ctl.toggle_panel(Panel::Editor), Err(LabError::InvalidState(_))));
    }

    #[test]
    fn panels_toggle_and_emit() {
        let mut ctl = controller();
        let seen = recorder(&mut ctl);
        assert!(!ctl.panels().is_visible(Panel::Assistant));
        assert!(ctl.toggle_panel(Panel::Assistant).unwrap());
        ctl.hide_panel(Panel::Terminal).unwrap();
        ctl.show_panel(Panel::Terminal).unwrap();
        assert!(ctl.panels().is_visible(Panel::Terminal));
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert!("sidebar".parse::<Panel>().is_err());
        assert_eq!("editor".parse::<Panel>().unwrap(), Panel::Editor);
    }

    #[test]
    fn execute_command_emits_terminal_event() {
        let mut ctl = controller();
        let outputs = Arc::new(StdMutex::new(Vec::new()));
        let sink = outputs.clone();
        ctl.on(EventKind::TerminalCommand, move |e| {
            if let LabEvent::TerminalCommand { command, output, .. } = e {
                sink.lock().unwrap().push((command.clone(), output.clone()));
            }
        });
        ctl.execute_command("pwd").unwrap();
        ctl.execute_command("   ").unwrap();
        assert_eq!(
            *outputs.lock().unwrap(),
            vec![("pwd".to_string(), "/home/student".to_string())]
        );
    }

    #[test]
    fn editor_files_respect_containment() {
        let mut ctl = controller();
        ctl.write_file("main.py", "print(1)\n").unwrap();
        assert_eq!(ctl.read_file("/home/student/main.py").unwrap(), "print(1)\n");
        assert!(matches!(ctl.read_file("/etc/passwd"), Err(LabError::Denied(_))));
        assert!(matches!(ctl.read_file("ghost.txt"), Err(LabError::NotFound(_))));
    }

    #[tokio::test]
    async fn save_then_load_restores_saved_tree() {
        let mut ctl = controller();
        ctl.execute_command("mkdir work").unwrap();
        ctl.save_state().await.unwrap();
        ctl.execute_command("touch work/later.txt").unwrap();
        ctl.execute_command("cd work").unwrap();
        ctl.hide_panel(Panel::Editor).unwrap();

        ctl.load_state(None).await.unwrap();
        assert!(ctl.vfs().is_dir("/home/student/work"));
        assert!(!ctl.vfs().exists("/home/student/work/later.txt"));
        assert!(ctl.panels().is_visible(Panel::Editor));
        assert_eq!(ctl.terminal().current_directory(), "/home/student");
        assert_eq!(ctl.terminal().history(), &["mkdir work"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller_with(store.clone());
        ctl.execute_command("mkdir keep").unwrap();
        let before = ctl.vfs().paths();

        store.save(&snapshot_key("lab-test"), "{\"sessionId\": 3").await.unwrap();
        assert!(matches!(ctl.load_state(None).await, Err(LabError::SnapshotCorrupt(_))));

        // Parses, but the sandbox root is missing from the tree.
        let mut snapshot = ctl.snapshot();
        snapshot.file_system_state = VfsNode::directory();
        store
            .save(&snapshot_key("lab-test"), &serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();
        assert!(matches!(ctl.load_state(None).await, Err(LabError::SnapshotCorrupt(_))));

        // Missing required field.
        store
            .save(&snapshot_key("lab-test"), "{\"sessionId\": \"lab-test\"}")
            .await
            .unwrap();
        assert!(matches!(ctl.load_state(None).await, Err(LabError::SnapshotCorrupt(_))));

        assert_eq!(ctl.vfs().paths(), before);
        assert_eq!(ctl.terminal().history(), &["mkdir keep"]);
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let mut ctl = controller();
        assert!(matches!(
            ctl.load_state(Some("lab-other")).await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_store_falls_back_to_local_cache() {
        let mut ctl = controller_with(Arc::new(DownStore));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.on(EventKind::StateSaved, move |e| {
            if let LabEvent::StateSaved { cached_locally, .. } = e {
                sink.lock().unwrap().push(*cached_locally);
            }
        });
        ctl.execute_command("touch saved.txt").unwrap();
        ctl.save_state().await.unwrap();
        ctl.execute_command("touch unsaved.txt").unwrap();
        ctl.load_state(None).await.unwrap();
        assert!(ctl.vfs().exists("/home/student/saved.txt"));
        assert!(!ctl.vfs().exists("/home/student/unsaved.txt"));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn destroy_saves_clears_subscribers_and_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller_with(store.clone());
        let seen = recorder(&mut ctl);
        ctl.execute_command("touch final.txt").unwrap();
        ctl.destroy().await.unwrap();

        assert_eq!(ctl.lifecycle(), Lifecycle::Destroyed);
        assert!(store.load(&snapshot_key("lab-test")).await.unwrap().is_some());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["terminal:command", "state:saved", "session:destroyed"]
        );
        assert!(matches!(ctl.execute_command("ls"), Err(LabError::InvalidState(_))));
        assert!(matches!(ctl.destroy().await, Err(LabError::InvalidState(_))));
        assert!(matches!(ctl.save_state().await, Err(LabError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_runs_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let shared = controller_with(store.clone()).into_shared();
        SessionController::start_autosave(&shared, Duration::from_secs(30)).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(store.load(&snapshot_key("lab-test")).await.unwrap().is_some());

        shared.lock().await.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_runs_while_a_save_is_in_flight() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            gate: gate.clone(),
            inner: MemoryStore::new(),
        });
        let shared = controller_with(store.clone()).into_shared();
        let seen = recorder(&mut *shared.lock().await);

        let saver = {
            let shared = shared.clone();
            tokio::spawn(async move { SessionController::save_shared(&shared).await })
        };
        tokio::task::yield_now().await;

        let output = tokio::time::timeout(Duration::from_millis(200), async {
            shared.lock().await.execute_command("pwd")
        })
        .await
        .expect("terminal blocked by pending save")
        .unwrap();
        assert_eq!(output.text, "/home/student");

        gate.notify_one();
        saver.await.unwrap().unwrap();
        assert!(store.inner.load(&snapshot_key("lab-test")).await.unwrap().is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["terminal:command", "state:saved"]);
    }

    #[tokio::test]
    async fn save_finishing_after_destroy_emits_nothing() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            gate: gate.clone(),
            inner: MemoryStore::new(),
        });
        let shared = controller_with(store).into_shared();
        let saved = Arc::new(StdMutex::new(0));
        {
            let saved = saved.clone();
            shared.lock().await.on(EventKind::StateSaved, move |_| {
                *saved.lock().unwrap() += 1;
            });
        }

        let saver = {
            let shared = shared.clone();
            tokio::spawn(async move { SessionController::save_shared(&shared).await })
        };
        tokio::task::yield_now().await;
        let destroyer = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.lock().await.destroy().await })
        };
        tokio::task::yield_now().await;

        // Both writes are now parked on the gate; destroy holds the lock.
        gate.notify_waiters();
        destroyer.await.unwrap().unwrap();
        saver.await.unwrap().unwrap();

        // Only the final save inside destroy was announced.
        assert_eq!(*saved.lock().unwrap(), 1);
        assert_eq!(shared.lock().await.lifecycle(), Lifecycle::Destroyed);
    }

    #[tokio::test]
    async fn load_shared_restores_without_holding_the_lock() {
        let shared = controller().into_shared();
        SessionController::save_shared(&shared).await.unwrap();
        shared.lock().await.execute_command("touch scratch.txt").unwrap();
        SessionController::load_shared(&shared, None).await.unwrap();
        assert!(!shared.lock().await.vfs().exists("/home/student/scratch.txt"));
    }

    #[tokio::test]
    async fn cached_final_save_survives_the_controller() {
        let store = FallbackStore::shared(Arc::new(DownStore), Duration::from_secs(1));
        let mut first = controller_on(store.clone());
        first.execute_command("touch work.txt").unwrap();
        first.destroy().await.unwrap();
        drop(first);

        let mut second = controller_on(store);
        second.load_state(None).await.unwrap();
        assert!(second.vfs().exists("/home/student/work.txt"));
    }
}
