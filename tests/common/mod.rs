#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use vmhost::config::{HostConfig, ResourcesConfig};
use vmhost::pipeline::{Operation, OperationError, OperationRegistry, RunContext, RunEnvironment};
use vmhost::session::{Session, SessionManager};
use vmhost::template::Template;

/// A machines directory and emulator resource tree inside a tempdir.
pub struct TestHost {
    pub dir: tempfile::TempDir,
    pub config: HostConfig,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = dir.path();
        let config = HostConfig {
            machines_dir: root.join("machines"),
            resources: ResourcesConfig {
                bin_dir: root.join("qemu/bin"),
                lib_dir: root.join("qemu/lib"),
                data_dir: root.join("qemu/share"),
            },
            ..Default::default()
        };
        for dir in [
            &config.resources.bin_dir,
            &config.resources.lib_dir,
            &config.resources.data_dir,
        ] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self { dir, config }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.config.resources.bin_dir
    }

    pub fn manager(&self, registry: OperationRegistry) -> SessionManager {
        SessionManager::new(RunEnvironment::new(registry, self.config.clone()))
    }

    /// Write an executable shell script into the resource bin directory.
    #[cfg(unix)]
    pub fn install_script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = self.bin_dir().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

pub fn template(install: &[&str], run: &[&str]) -> Template {
    Template {
        id: "test".into(),
        name: "Test Machine".into(),
        install_tasks: install.iter().map(|s| s.to_string()).collect(),
        run_tasks: run.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Shared list of things the test operations saw.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// `probe`: records the session's status lines as `status|sub_status`.
pub struct Probe(pub Log);

#[async_trait]
impl Operation for Probe {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        _name: &str,
        _args: &[String],
    ) -> Result<(), OperationError> {
        let status = ctx.session().status();
        self.0
            .lock()
            .push(format!("{}|{}", status.status, status.sub_status));
        Ok(())
    }
}

/// `rec <args...>`: records `exec <args>` and later `finish <args>`.
/// `fail` behaves the same but returns an error from execute.
pub struct Recorder {
    log: Log,
    label: String,
    fail: bool,
}

#[async_trait]
impl Operation for Recorder {
    async fn execute(
        &mut self,
        _ctx: &RunContext,
        name: &str,
        args: &[String],
    ) -> Result<(), OperationError> {
        self.label = if args.is_empty() {
            name.to_string()
        } else {
            args.join(" ")
        };
        self.log.lock().push(format!("exec {}", self.label));
        if self.fail {
            return Err(OperationError::Usage(format!("{} exploded", self.label)));
        }
        Ok(())
    }

    async fn finish(&mut self, _ctx: &RunContext) {
        self.log.lock().push(format!("finish {}", self.label));
    }
}

/// `block`: never completes until the session is stopped.
pub struct Block(pub Log);

#[async_trait]
impl Operation for Block {
    async fn execute(
        &mut self,
        _ctx: &RunContext,
        _name: &str,
        _args: &[String],
    ) -> Result<(), OperationError> {
        self.0.lock().push("exec block".into());
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn finish(&mut self, _ctx: &RunContext) {
        self.0.lock().push("finish block".into());
    }
}

/// Standard operations plus `probe`, `rec`, `fail` and `block`.
pub fn registry_with_test_ops(log: &Log) -> OperationRegistry {
    let mut registry = OperationRegistry::with_defaults();
    let l = log.clone();
    registry.register("probe", move || Box::new(Probe(l.clone())));
    let l = log.clone();
    registry.register("rec", move || {
        Box::new(Recorder {
            log: l.clone(),
            label: String::new(),
            fail: false,
        })
    });
    let l = log.clone();
    registry.register("fail", move || {
        Box::new(Recorder {
            log: l.clone(),
            label: String::new(),
            fail: true,
        })
    });
    let l = log.clone();
    registry.register("block", move || Box::new(Block(l.clone())));
    registry
}

/// Start a session and wait for its run to end, failing the test after `limit`.
pub async fn run_to_end(manager: &SessionManager, session: &Arc<Session>, limit: Duration) {
    manager.start(session.id()).expect("failed to start session");
    tokio::time::timeout(limit, session.wait())
        .await
        .expect("session did not finish in time");
}

/// Poll `cond` every 20ms until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
