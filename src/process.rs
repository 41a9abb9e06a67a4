use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Environment variable the dynamic loader consults for extra library directories.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(windows)]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with exit code {code}")]
    ExitCode { program: String, code: i32 },

    #[error("{program} was terminated by a signal")]
    Signaled { program: String },
}

/// Everything needed to launch a bundled tool inside a session workspace.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    lib_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            lib_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Prepend `dir` to the child's dynamic library search path.
    pub fn library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lib_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Short name of the program for messages (`qemu-img`, not the full path).
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Build the tokio command. The child is killed if its handle is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(lib_dir) = &self.lib_dir {
            cmd.env(LIBRARY_PATH_VAR, prepend_search_path(lib_dir));
        }
        cmd
    }

    /// Spawn with stdin, stdout and stderr all piped.
    pub fn spawn_piped(&self) -> Result<Child, ProcessError> {
        self.command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.display_name(),
                source,
            })
    }

    /// Run to completion, handing each stdout/stderr line to `on_line` as it arrives.
    pub async fn run_with_lines<F>(&self, mut on_line: F) -> Result<ExitStatus, ProcessError>
    where
        F: FnMut(&str),
    {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.display_name(),
                source,
            })?;

        tracing::debug!(program = %self.program.display(), args = ?self.args, "process started");

        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => on_line(&line),
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => on_line(&line),
                    None => stderr = None,
                },
            }
        }

        child.wait().await.map_err(|source| ProcessError::Wait {
            program: self.display_name(),
            source,
        })
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        // A read error ends the stream the same way EOF does.
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Turn an exit status into an error unless it reports success.
pub fn check_exit(program: &str, status: ExitStatus) -> Result<(), ProcessError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(ProcessError::ExitCode {
            program: program.to_string(),
            code,
        }),
        None => Err(ProcessError::Signaled {
            program: program.to_string(),
        }),
    }
}

fn prepend_search_path(dir: &Path) -> OsString {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os(LIBRARY_PATH_VAR) {
        paths.extend(std::env::split_paths(&existing));
    }
    // Only fails if a path contains the separator; fall back to the bare dir.
    std::env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_owned())
}
