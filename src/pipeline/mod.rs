//! Command pipeline: turns a session's template task lines into operations
//! and runs them in order.
//!
//! Each line is variable-expanded, tokenized, and dispatched by its first
//! token to a registered [`Operation`]. A fresh operation instance is built
//! for every line. Whatever happens, every instance that was invoked gets its
//! [`Operation::finish`] hook called once, in invocation order.

pub mod ops;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::process::ProcessError;
use crate::qmp::QmpError;
use crate::resources::{self, ResourceError, Resources};
use crate::session::{Session, SessionError};
use crate::tokenize;
use crate::vars;

pub use ops::format_size;

/// Operation id of the step appended after the install tasks.
pub const MARK_INSTALLED: &str = "internal:mark-installed";

/// Errors raised by a single operation.
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Qmp(#[from] QmpError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Emulator(String),
}

impl OperationError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("empty command")]
    EmptyCommand,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{source}")]
    Operation {
        name: String,
        #[source]
        source: OperationError,
    },

    #[error("session stopped")]
    Stopped,
}

/// A named step a template can run.
///
/// Implementations may keep per-invocation state (a child process, a
/// monitor handle) in `self`; the registry builds a new instance for every
/// task line.
#[async_trait]
pub trait Operation: Send {
    /// Run the operation. `name` is the command as written (useful for
    /// prefix-matched families), `args` the remaining tokens.
    async fn execute(
        &mut self,
        ctx: &RunContext,
        name: &str,
        args: &[String],
    ) -> Result<(), OperationError>;

    /// Release whatever `execute` left behind. Called once per invoked
    /// instance after the task list ends, whether it succeeded or not.
    async fn finish(&mut self, _ctx: &RunContext) {}
}

type Factory = Box<dyn Fn() -> Box<dyn Operation> + Send + Sync>;

/// How a registered id matches command names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    /// From an id ending in `*`.
    Prefix(String),
}

impl NamePattern {
    pub fn parse(id: &str) -> Self {
        match id.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_ascii_lowercase()),
            None => Self::Exact(id.to_ascii_lowercase()),
        }
    }

    /// Case-insensitive match against a command name.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            Self::Exact(id) => name == *id,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

struct Registration {
    id: String,
    pattern: NamePattern,
    factory: Factory,
}

/// Ordered table of operation factories.
#[derive(Default)]
pub struct OperationRegistry {
    entries: Vec<Registration>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the standard operations.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("echo", || Box::new(ops::Echo));
        registry.register("download", || Box::new(ops::Download));
        registry.register(resources::IMAGE_TOOL, || Box::new(ops::ImageTool));
        registry.register(MARK_INSTALLED, || Box::new(ops::MarkInstalled));
        registry.register(&format!("{}*", resources::EMULATOR_PREFIX), || {
            Box::new(ops::Emulator::default())
        });
        registry
    }

    /// Add an operation. An existing registration with the same id is
    /// replaced; the new one goes to the end of the lookup order.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn() -> Box<dyn Operation> + Send + Sync + 'static,
    {
        self.entries.retain(|entry| entry.id != id);
        self.entries.push(Registration {
            id: id.to_string(),
            pattern: NamePattern::parse(id),
            factory: Box::new(factory),
        });
    }

    /// Id of the first registration matching `name`.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.find(name).map(|entry| entry.id.as_str())
    }

    /// Build a fresh instance of the first operation matching `name`.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn Operation>> {
        self.find(name).map(|entry| (entry.factory)())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.id.as_str()).collect()
    }

    fn find(&self, name: &str) -> Option<&Registration> {
        self.entries.iter().find(|entry| entry.pattern.matches(name))
    }
}

/// Shared services a session run needs.
#[derive(Clone, Debug)]
pub struct RunEnvironment {
    pub registry: Arc<OperationRegistry>,
    pub resources: Resources,
    pub config: Arc<HostConfig>,
}

impl RunEnvironment {
    pub fn new(registry: OperationRegistry, config: HostConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            resources: Resources::new(&config.resources),
            config: Arc::new(config),
        }
    }
}

/// What an operation sees while it runs.
#[derive(Clone, Debug)]
pub struct RunContext {
    session: Arc<Session>,
    env: RunEnvironment,
}

impl RunContext {
    pub fn new(session: Arc<Session>, env: RunEnvironment) -> Self {
        Self { session, env }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn workspace(&self) -> &Path {
        self.session.path()
    }

    pub fn resources(&self) -> &Resources {
        &self.env.resources
    }

    pub fn config(&self) -> &HostConfig {
        &self.env.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.env.registry
    }

    /// Value of a `${name}` placeholder.
    pub fn variable(&self, name: &str) -> Option<String> {
        match name {
            "system.arch" => Some(resources::host_arch().to_string()),
            "qemu.path" => Some(self.env.resources.data_dir().display().to_string()),
            "vm.path" => Some(self.session.path().display().to_string()),
            _ => self.session.template().prop(name).map(str::to_string),
        }
    }

    pub fn expand(&self, raw: &str) -> String {
        vars::expand(raw, |name| self.variable(name))
    }
}

struct Invoked {
    name: String,
    op: Box<dyn Operation>,
}

/// Runs task lines one at a time and remembers what it invoked.
pub struct CommandRunner {
    ctx: RunContext,
    invoked: Vec<Invoked>,
}

impl CommandRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            invoked: Vec::new(),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Number of operation instances created so far.
    pub fn invoked_count(&self) -> usize {
        self.invoked.len()
    }

    /// Expand, tokenize, dispatch and run one task line.
    pub async fn run_command(&mut self, raw: &str) -> Result<(), PipelineError> {
        let expanded = self.ctx.expand(raw);
        let mut tokens = tokenize::tokenize(&expanded).into_iter();
        let name = tokens.next().ok_or(PipelineError::EmptyCommand)?;
        let args: Vec<String> = tokens.collect();

        let op = self
            .ctx
            .registry()
            .instantiate(&name)
            .ok_or_else(|| PipelineError::UnknownCommand(name.clone()))?;

        tracing::info!(
            session = %self.ctx.session.id(),
            op = %name,
            command = %tokenize::join(&args),
            "running"
        );

        // Recorded before it runs so finish reaches it even if execute is
        // abandoned part way through.
        let index = self.invoked.len();
        self.invoked.push(Invoked {
            name: name.clone(),
            op,
        });
        let invoked = &mut self.invoked[index];
        invoked
            .op
            .execute(&self.ctx, &invoked.name, &args)
            .await
            .map_err(|source| PipelineError::Operation { name, source })
    }

    /// Run every task line in order, stopping at the first failure.
    pub async fn run_all(&mut self, tasks: &[String]) -> Result<(), PipelineError> {
        for task in tasks {
            self.run_command(task).await?;
        }
        Ok(())
    }

    /// Call `finish` on every invoked operation, in invocation order.
    pub async fn finish(&mut self) {
        for mut invoked in self.invoked.drain(..) {
            tracing::debug!(op = %invoked.name, "finishing");
            invoked.op.finish(&self.ctx).await;
        }
    }
}

/// Task lines for one launch: install tasks plus the mark-installed step if
/// the session is not installed yet, then the run tasks.
pub fn plan(session: &Session) -> Vec<String> {
    let template = session.template();
    let mut tasks = Vec::new();
    if !session.is_installed() {
        tasks.extend(template.install_tasks.iter().cloned());
        tasks.push(MARK_INSTALLED.to_string());
    }
    tasks.extend(template.run_tasks.iter().cloned());
    tasks
}

/// Run a session's tasks to completion, failure, or cancellation.
///
/// The outcome is also recorded on the session: success clears the status
/// lines, a failure becomes the session error and status text. Teardown runs
/// in every case.
pub async fn run_session(
    ctx: RunContext,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let session = ctx.session().clone();
    let tasks = plan(&session);
    session.set_error(None);
    tracing::info!(session = %session.id(), tasks = tasks.len(), "session started");

    let mut runner = CommandRunner::new(ctx);
    let result = tokio::select! {
        result = runner.run_all(&tasks) => result,
        _ = cancel.cancelled() => Err(PipelineError::Stopped),
    };

    match &result {
        Ok(()) => {
            session.set_status("");
            session.set_sub_status("");
            tracing::info!(session = %session.id(), "session finished");
        }
        Err(PipelineError::Stopped) => {
            session.set_status("");
            session.set_sub_status("");
            tracing::info!(session = %session.id(), "session stopped");
        }
        Err(e) => {
            let message = e.to_string();
            tracing::error!(session = %session.id(), error = %message, "session failed");
            session.set_error(Some(message.clone()));
            session.set_status(&message);
            session.set_sub_status("");
        }
    }

    runner.finish().await;
    result
}
