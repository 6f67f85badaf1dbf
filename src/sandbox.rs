//! Sandbox policy: command allow-list, path containment and command audit.

use crate::error::{LabError, Result};
use crate::vfs::{is_within, VfsPath, VirtualFileSystem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Maximum number of audit entries kept per session.
pub const AUDIT_LOG_CAPACITY: usize = 1000;

pub const DEFAULT_ROOT: &str = "/home/student";

/// Configuration for confining a session.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxConfig {
    root: VfsPath,
    allowed_commands: BTreeSet<String>,
    blocked_paths: BTreeSet<VfsPath>,
}

impl SandboxConfig {
    /// Paths are normalized on the way in. Fails when the root itself sits
    /// inside a blocked path, since containment could never succeed.
    pub fn new<I, J, S, T>(root: &str, allowed_commands: I, blocked_paths: J) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        J: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let root = VirtualFileSystem::resolve(root, "/");
        let blocked_paths: BTreeSet<VfsPath> = blocked_paths
            .into_iter()
            .map(|p| VirtualFileSystem::resolve(p.as_ref(), "/"))
            .collect();
        if let Some(blocked) = blocked_paths.iter().find(|b| is_within(&root, b)) {
            return Err(LabError::Malformed(format!(
                "sandbox root {} is inside blocked path {}",
                root, blocked
            )));
        }
        Ok(Self {
            root,
            allowed_commands: allowed_commands.into_iter().map(Into::into).collect(),
            blocked_paths,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn allowed_commands(&self) -> &BTreeSet<String> {
        &self.allowed_commands
    }

    pub fn blocked_paths(&self) -> &BTreeSet<VfsPath> {
        &self.blocked_paths
    }

    /// Same allow-list and deny-list under a different root.
    pub fn with_root(&self, root: &str) -> Result<Self> {
        Self::new(
            root,
            self.allowed_commands.iter().cloned(),
            self.blocked_paths.iter(),
        )
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            allowed_commands: crate::terminal::Verb::ALL
                .iter()
                .map(|v| v.name().to_string())
                .collect(),
            blocked_paths: ["/etc", "/root"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAccess {
    Allowed,
    Denied(String),
}

impl PathAccess {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PathAccess::Allowed)
    }
}

/// One accepted command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub raw: String,
    pub verb: String,
    pub args: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub working_directory: VfsPath,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub student_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub record: CommandRecord,
}

/// Append-only, capped command audit log for one student session.
#[derive(Debug, Clone)]
pub struct AuditLog {
    student_id: String,
    session_id: String,
    entries: VecDeque<AuditEntry>,
}

impl AuditLog {
    pub fn new(student_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            session_id: session_id.into(),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: CommandRecord) {
        if self.entries.len() == AUDIT_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(AuditEntry {
            student_id: self.student_id.clone(),
            session_id: self.session_id.clone(),
            record,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Enforces a [`SandboxConfig`] when the session is sandboxed.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    config: SandboxConfig,
    sandboxed: bool,
    audit: AuditLog,
}

impl SandboxPolicy {
    pub fn new(config: SandboxConfig, sandboxed: bool, audit: AuditLog) -> Self {
        Self {
            config,
            sandboxed,
            audit,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn root(&self) -> &str {
        self.config.root()
    }

    pub fn set_config(&mut self, config: SandboxConfig) {
        self.config = config;
    }

    pub fn is_command_allowed(&self, verb: &str) -> bool {
        if !self.sandboxed {
            return true;
        }
        let allowed = self.config.allowed_commands.contains(verb);
        if !allowed {
            warn!(verb, session_id = %self.audit.session_id, "Command rejected by sandbox policy");
        }
        allowed
    }

    /// `resolved` must already be normalized.
    pub fn check_path_access(&self, resolved: &str) -> PathAccess {
        if !self.sandboxed {
            return PathAccess::Allowed;
        }
        if !is_within(resolved, &self.config.root) {
            warn!(path = resolved, root = %self.config.root, "Path outside sandbox root");
            return PathAccess::Denied(format!("{} is outside {}", resolved, self.config.root));
        }
        if let Some(blocked) = self
            .config
            .blocked_paths
            .iter()
            .find(|b| is_within(resolved, b))
        {
            warn!(path = resolved, blocked = %blocked, "Path is blocked");
            return PathAccess::Denied(format!("{} is blocked", resolved));
        }
        PathAccess::Allowed
    }

    /// Audit an accepted command. No-op outside sandboxed sessions.
    pub fn record(&mut self, record: CommandRecord) {
        if self.sandboxed {
            debug!(verb = %record.verb, cwd = %record.working_directory, "Audited command");
            self.audit.push(record);
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }
}
