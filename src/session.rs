use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{self, RunContext, RunEnvironment};
use crate::qmp::{QmpMonitor, VncInfo};
use crate::template::{Template, TemplateError};

/// Template snapshot stored in every workspace.
pub const TEMPLATE_FILE: &str = "template.toml";
/// Persisted per-session metadata.
pub const PROPS_FILE: &str = "props.toml";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session is already running: {0}")]
    AlreadyRunning(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("failed to read session properties {}: {}", .0.display(), .1)]
    PropsRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse session properties {}: {}", .0.display(), .1)]
    PropsParse(PathBuf, #[source] toml::de::Error),
    #[error("failed to write session properties {}: {}", .0.display(), .1)]
    PropsWrite(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize session properties: {0}")]
    PropsSerialize(#[from] toml::ser::Error),
    #[error("workspace error at {}: {}", .0.display(), .1)]
    Workspace(PathBuf, #[source] std::io::Error),
}

/// Small key/value record persisted next to the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProps {
    /// Display name.
    pub name: String,
    /// Set once the install tasks have completed.
    pub installed: bool,
}

impl SessionProps {
    /// Load from `path`, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SessionError::PropsRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| SessionError::PropsParse(path.to_path_buf(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| SessionError::PropsWrite(path.to_path_buf(), e))
    }
}

/// Point-in-time copy of a session's observable state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub status: String,
    pub sub_status: String,
    pub error: Option<String>,
    pub endpoint: Option<VncInfo>,
    pub running: bool,
}

#[derive(Default)]
struct LiveState {
    status: String,
    sub_status: String,
    error: Option<String>,
    endpoint: Option<VncInfo>,
    monitor: Option<QmpMonitor>,
}

struct Runner {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    done: watch::Receiver<bool>,
}

impl Runner {
    fn is_active(&self) -> bool {
        !*self.done.borrow() && !self.task.is_finished()
    }
}

/// One virtual machine: a workspace directory, the template it was created
/// from, and the state of its current run.
///
/// Status fields are last-write-wins. Observers poll [`Session::status`]
/// and stop once `running` turns false.
pub struct Session {
    id: String,
    path: PathBuf,
    template: Template,
    props: Mutex<SessionProps>,
    state: Mutex<LiveState>,
    runner: Mutex<Option<Runner>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("template", &self.template.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Write a new workspace at `path` and return its session.
    pub fn create(id: String, path: PathBuf, template: Template) -> Result<Self, SessionError> {
        std::fs::create_dir_all(&path).map_err(|e| SessionError::Workspace(path.clone(), e))?;
        template.save(&path.join(TEMPLATE_FILE))?;
        let props = SessionProps {
            name: template.name.clone(),
            installed: false,
        };
        props.save(&path.join(PROPS_FILE))?;
        Ok(Self::with_parts(id, path, template, props))
    }

    /// Load an existing workspace.
    pub fn open(id: String, path: PathBuf) -> Result<Self, SessionError> {
        let template = Template::load(&path.join(TEMPLATE_FILE))?;
        let mut props = SessionProps::load(&path.join(PROPS_FILE))?;
        if props.name.is_empty() {
            props.name = template.name.clone();
        }
        Ok(Self::with_parts(id, path, template, props))
    }

    fn with_parts(id: String, path: PathBuf, template: Template, props: SessionProps) -> Self {
        Self {
            id,
            path,
            template,
            props: Mutex::new(props),
            state: Mutex::new(LiveState::default()),
            runner: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Workspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn name(&self) -> String {
        self.props.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) -> Result<(), SessionError> {
        self.update_props(|props| props.name = name.to_string())
    }

    pub fn is_installed(&self) -> bool {
        self.props.lock().installed
    }

    /// Persist the installed flag.
    pub fn set_installed(&self, installed: bool) -> Result<(), SessionError> {
        self.update_props(|props| props.installed = installed)
    }

    fn update_props(&self, f: impl FnOnce(&mut SessionProps)) -> Result<(), SessionError> {
        let mut props = self.props.lock();
        let mut updated = props.clone();
        f(&mut updated);
        updated.save(&self.path.join(PROPS_FILE))?;
        *props = updated;
        Ok(())
    }

    // ── Live state ──────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        SessionStatus {
            status: state.status.clone(),
            sub_status: state.sub_status.clone(),
            error: state.error.clone(),
            endpoint: state.endpoint.clone(),
            running: self.is_running(),
        }
    }

    pub fn set_status(&self, text: &str) {
        self.state.lock().status = text.to_string();
    }

    pub fn set_sub_status(&self, text: &str) {
        self.state.lock().sub_status = text.to_string();
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.lock().error = error;
    }

    /// Where the emulator's display is listening, once negotiated.
    pub fn endpoint(&self) -> Option<VncInfo> {
        self.state.lock().endpoint.clone()
    }

    pub fn set_endpoint(&self, endpoint: Option<VncInfo>) {
        self.state.lock().endpoint = endpoint;
    }

    /// Control channel of the running emulator.
    pub fn monitor(&self) -> Option<QmpMonitor> {
        self.state.lock().monitor.clone()
    }

    pub fn set_monitor(&self, monitor: Option<QmpMonitor>) {
        self.state.lock().monitor = monitor;
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start running the session's tasks on a new task.
    pub fn start(self: &Arc<Self>, env: RunEnvironment) -> Result<(), SessionError> {
        let mut runner = self.runner.lock();
        if runner.as_ref().is_some_and(Runner::is_active) {
            return Err(SessionError::AlreadyRunning(self.id.clone()));
        }

        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(false);
        let ctx = RunContext::new(self.clone(), env);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            // The outcome is recorded on the session itself.
            let _ = pipeline::run_session(ctx, token).await;
            let _ = done_tx.send(true);
        });

        *runner = Some(Runner { cancel, task, done });
        Ok(())
    }

    /// Ask the current run to stop. Teardown still runs; use [`wait`](Self::wait)
    /// to know when it has.
    pub fn stop(&self) {
        if let Some(runner) = self.runner.lock().as_ref() {
            runner.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner.lock().as_ref().is_some_and(Runner::is_active)
    }

    /// Wait for the current run, if any, to finish.
    pub async fn wait(&self) {
        let done = self.runner.lock().as_ref().map(|runner| runner.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// All sessions under one machines directory.
pub struct SessionManager {
    root: PathBuf,
    env: RunEnvironment,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(env: RunEnvironment) -> Self {
        Self {
            root: env.config.machines_dir.clone(),
            env,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env(&self) -> &RunEnvironment {
        &self.env
    }

    /// Load every workspace under the machines directory. Directories that
    /// fail to load are logged and skipped. Returns the number loaded.
    pub fn load_all(&self) -> Result<usize, SessionError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| SessionError::Workspace(self.root.clone(), e))?;
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| SessionError::Workspace(self.root.clone(), e))?;

        let mut loaded = 0;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.join(TEMPLATE_FILE).is_file() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            match Session::open(id.clone(), path) {
                Ok(session) => {
                    self.sessions.write().insert(id, Arc::new(session));
                    loaded += 1;
                }
                Err(e) => tracing::warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        tracing::debug!(loaded, root = %self.root.display(), "sessions loaded");
        Ok(loaded)
    }

    /// Create a session from a template in a new workspace.
    pub fn create(&self, template: Template) -> Result<Arc<Session>, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::create(id.clone(), self.root.join(&id), template)?);
        self.sessions.write().insert(id.clone(), session.clone());
        tracing::info!(session = %id, name = %session.name(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// All sessions, ordered by name then id.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(&b.name()).then_with(|| a.id().cmp(b.id())));
        sessions
    }

    /// Start a session's run.
    pub fn start(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.start(self.env.clone())?;
        Ok(session)
    }

    /// Stop a session, wait for its teardown, and remove its workspace.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.stop();
        session.wait().await;
        tokio::fs::remove_dir_all(session.path())
            .await
            .map_err(|e| SessionError::Workspace(session.path().to_path_buf(), e))?;
        tracing::info!(session = %id, "session deleted");
        Ok(())
    }
}
