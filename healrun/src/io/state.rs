//! Per-project agent state shared between the engine and observers.
//!
//! The store is the only shared mutable structure: snapshots for the UI, the
//! interrupt flag, and the active-session slot all live here, and every
//! mutation goes through [`StateStore::update`].

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::types::{AgentSnapshot, project_slug};

#[derive(Debug, Default)]
struct ProjectState {
    snapshots: Vec<AgentSnapshot>,
    interrupted: bool,
    session_active: bool,
}

#[derive(Debug, Default)]
pub struct StateStore {
    projects: Mutex<HashMap<String, ProjectState>>,
    /// When set, latest snapshots, interrupt markers and session locks are
    /// mirrored here so separate processes see each other.
    state_dir: Option<PathBuf>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects: Mutex::default(),
            state_dir: Some(state_dir.into()),
        }
    }

    fn update<R>(&self, project_id: &str, f: impl FnOnce(&mut ProjectState) -> R) -> Result<R> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        Ok(f(projects.entry(project_id.to_string()).or_default()))
    }

    fn snapshot_path(&self, project_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", project_slug(project_id))))
    }

    fn interrupt_marker(&self, project_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.interrupt", project_slug(project_id))))
    }

    fn session_lock(&self, project_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.session", project_slug(project_id))))
    }

    /// Create the lock file for a persistent store. `Ok(false)` means another
    /// process holds it.
    fn claim_lock(&self, project_id: &str) -> Result<bool> {
        let Some(lock) = self.session_lock(project_id) else {
            return Ok(true);
        };
        if let Some(dir) = lock.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .with_context(|| format!("write {}", lock.display()))?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                info!(lock = %lock.display(), "session lock held by another process");
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("create {}", lock.display())),
        }
    }

    /// Record a new snapshot. A snapshot without a browser session inherits
    /// the previous one.
    pub fn push_snapshot(&self, project_id: &str, mut snapshot: AgentSnapshot) -> Result<()> {
        let persisted = self.latest_persisted(project_id)?;
        let snapshot = self.update(project_id, |state| {
            if snapshot.browser_session.is_none() {
                snapshot.browser_session = state
                    .snapshots
                    .last()
                    .or(persisted.as_ref())
                    .and_then(|previous| previous.browser_session.clone());
            }
            state.snapshots.push(snapshot.clone());
            snapshot
        })?;
        debug!(project_id, monologue = %snapshot.internal_monologue, "pushed snapshot");
        if let Some(path) = self.snapshot_path(project_id) {
            let mut buf = serde_json::to_string_pretty(&snapshot)?;
            buf.push('\n');
            super::write_atomic(&path, &buf)?;
        }
        Ok(())
    }

    /// Most recent snapshot, falling back to the persisted one from an earlier process.
    pub fn latest(&self, project_id: &str) -> Result<Option<AgentSnapshot>> {
        if let Some(latest) = self.update(project_id, |state| state.snapshots.last().cloned())? {
            return Ok(Some(latest));
        }
        self.latest_persisted(project_id)
    }

    /// Snapshots pushed through this store, oldest first.
    pub fn snapshots(&self, project_id: &str) -> Result<Vec<AgentSnapshot>> {
        self.update(project_id, |state| state.snapshots.clone())
    }

    fn latest_persisted(&self, project_id: &str) -> Result<Option<AgentSnapshot>> {
        let Some(path) = self.snapshot_path(project_id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Ask the running session to stop at its next poll.
    pub fn request_interrupt(&self, project_id: &str) -> Result<()> {
        info!(project_id, "interrupt requested");
        self.update(project_id, |state| state.interrupted = true)?;
        if let Some(marker) = self.interrupt_marker(project_id) {
            super::write_atomic(&marker, "")?;
        }
        let mut snapshot = self
            .latest(project_id)?
            .unwrap_or_else(|| AgentSnapshot::monologue(""));
        let fresh = AgentSnapshot::monologue("Interrupted by user");
        snapshot.internal_monologue = fresh.internal_monologue;
        snapshot.timestamp = fresh.timestamp;
        self.push_snapshot(project_id, snapshot)
    }

    /// Whether an interrupt is pending. An unreadable store counts as interrupted.
    pub fn is_interrupted(&self, project_id: &str) -> bool {
        match self.update(project_id, |state| state.interrupted) {
            Ok(true) => true,
            Ok(false) => self
                .interrupt_marker(project_id)
                .is_some_and(|marker| marker.exists()),
            Err(err) => {
                warn!(project_id, err = %err, "treating unreadable state as interrupted");
                true
            }
        }
    }

    /// Claim the project's single session slot. Returns `None` when another
    /// session holds it, in this process or, for a persistent store, in any
    /// process sharing the state directory. A stale interrupt from an earlier
    /// run is cleared.
    pub fn begin_session(&self, project_id: &str) -> Result<Option<SessionGuard<'_>>> {
        let claimed = self.update(project_id, |state| {
            if state.session_active {
                return false;
            }
            state.session_active = true;
            true
        })?;
        if !claimed {
            warn!(project_id, "session already active");
            return Ok(None);
        }
        let locked = self.claim_lock(project_id);
        if !matches!(locked, Ok(true)) {
            // Release the in-process slot without touching the other holder's lock.
            self.update(project_id, |state| state.session_active = false)?;
            locked?;
            warn!(project_id, "session already active in another process");
            return Ok(None);
        }
        let guard = SessionGuard {
            store: self,
            project_id: project_id.to_string(),
        };
        self.update(project_id, |state| state.interrupted = false)?;
        if let Some(marker) = self.interrupt_marker(project_id) {
            remove_if_exists(&marker)?;
        }
        debug!(project_id, "session started");
        Ok(Some(guard))
    }

    /// Push a closing snapshot derived from the latest one.
    pub fn finish(&self, project_id: &str, completed: bool, monologue: &str) -> Result<()> {
        let mut snapshot = self
            .latest(project_id)?
            .unwrap_or_else(|| AgentSnapshot::monologue(""));
        let fresh = AgentSnapshot::monologue(monologue);
        snapshot.internal_monologue = fresh.internal_monologue;
        snapshot.timestamp = fresh.timestamp;
        snapshot.completed = completed;
        snapshot.agent_is_active = false;
        self.push_snapshot(project_id, snapshot)
    }

    pub fn is_session_active(&self, project_id: &str) -> Result<bool> {
        let in_process = self.update(project_id, |state| state.session_active)?;
        Ok(in_process
            || self
                .session_lock(project_id)
                .is_some_and(|lock| lock.exists()))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Holds a project's session slot; releases it on drop.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    store: &'a StateStore,
    project_id: String,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .store
            .update(&self.project_id, |state| state.session_active = false)
        {
            warn!(project_id = %self.project_id, err = %err, "failed to release session");
        }
        if let Some(lock) = self.store.session_lock(&self.project_id)
            && let Err(err) = remove_if_exists(&lock)
        {
            warn!(project_id = %self.project_id, err = %err, "failed to remove session lock");
        }
    }
}
