use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;

use crate::pipeline::{Operation, OperationError, RunContext};
use crate::process::{check_exit, ProcessError, ProcessSpec};
use crate::qmp::{self, QmpError, QmpMonitor};
use crate::session::Session;

/// `qemu-system-<arch> <args...>`: launch the emulator and supervise it
/// until it exits.
///
/// The monitor runs over the child's stdin/stdout. Once it is up, the
/// display endpoint is queried on a separate task and published on the
/// session.
#[derive(Default)]
pub struct Emulator {
    child: Option<Child>,
}

/// Fixed launch flags followed by the template's own arguments.
pub fn emulator_args(data_dir: &Path, vnc_listen: &str, template_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "-L".to_string(),
        data_dir.display().to_string(),
        "-display".to_string(),
        "none".to_string(),
        "-vnc".to_string(),
        vnc_listen.to_string(),
        "-qmp".to_string(),
        "stdio".to_string(),
    ];
    args.extend(template_args.iter().cloned());
    args
}

#[async_trait]
impl Operation for Emulator {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        name: &str,
        args: &[String],
    ) -> Result<(), OperationError> {
        let session = ctx.session();
        let resources = ctx.resources();
        let program = name.to_ascii_lowercase();

        session.set_sub_status("Checking emulator resources...");
        resources.ensure()?;
        let binary = resources.binary(&program)?;

        session.set_sub_status("Starting emulator...");
        let spec = ProcessSpec::new(binary)
            .args(emulator_args(
                resources.data_dir(),
                &ctx.config().display.vnc_listen,
                args,
            ))
            .current_dir(ctx.workspace())
            .library_dir(resources.lib_dir());
        tracing::info!(
            session = %session.id(),
            program = %spec.program().display(),
            args = ?spec.arguments(),
            "launching emulator"
        );

        let child = self.child.insert(spec.spawn_piped()?);
        let result = supervise(ctx, &program, child).await;
        self.child = None;

        session.set_monitor(None);
        session.set_endpoint(None);
        result
    }

    async fn finish(&mut self, ctx: &RunContext) {
        if let Some(mut child) = self.child.take() {
            tracing::info!(session = %ctx.session().id(), "killing emulator");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        ctx.session().set_monitor(None);
        ctx.session().set_endpoint(None);
    }
}

async fn supervise(
    ctx: &RunContext,
    program: &str,
    child: &mut Child,
) -> Result<(), OperationError> {
    let session = ctx.session().clone();
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(OperationError::Emulator(format!("{program} has no stdio pipes")));
    };
    let output = tokio::spawn(forward_output(stderr, session.clone(), program.to_string()));

    let timeout = ctx.config().monitor.timeout();
    let connected = tokio::time::timeout(timeout, qmp::handshake(stdout, stdin, timeout)).await;
    let (monitor, event_loop) = match connected {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(abort_launch(child, program, e.into()).await),
        Err(_) => {
            let e = OperationError::Emulator(format!("{program} did not open its monitor"));
            return Err(abort_launch(child, program, e).await);
        }
    };
    session.set_monitor(Some(monitor.clone()));

    let (kill_tx, kill_rx) = oneshot::channel();
    let negotiation = tokio::spawn(negotiate_display(monitor, session.clone(), kill_tx));

    // Blocks for as long as the emulator keeps its stdout open.
    let monitor_loop = event_loop.run();
    tokio::pin!(monitor_loop);
    let loop_result = tokio::select! {
        result = &mut monitor_loop => result,
        Ok(()) = kill_rx => {
            tracing::warn!(session = %session.id(), "stopping emulator after failed startup");
            let _ = child.start_kill();
            monitor_loop.await
        }
    };

    let status = child.wait().await.map_err(|source| ProcessError::Wait {
        program: program.to_string(),
        source,
    })?;
    let _ = output.await;
    tracing::info!(session = %session.id(), program, %status, "emulator exited");

    let negotiation_error = match negotiation.await {
        Ok(Ok(())) => None,
        // The emulator went away first; its exit status tells the story.
        Ok(Err(OperationError::Qmp(QmpError::Closed | QmpError::Io(_)))) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(OperationError::Emulator(format!(
            "display negotiation task failed: {e}"
        ))),
    };
    if let Some(e) = negotiation_error {
        return Err(e);
    }
    loop_result?;
    check_exit(program, status)?;
    Ok(())
}

/// Query the display endpoint and publish it. On failure, asks the
/// supervisor to kill the emulator.
async fn negotiate_display(
    monitor: QmpMonitor,
    session: Arc<Session>,
    kill: oneshot::Sender<()>,
) -> Result<(), OperationError> {
    session.set_sub_status("Querying display...");
    let result = match monitor.query_vnc().await {
        Ok(info) if info.port != 0 => Ok(info),
        Ok(_) => Err(OperationError::Emulator(
            "emulator did not start the VNC server".into(),
        )),
        Err(e) => Err(OperationError::from(e)),
    };

    match result {
        Ok(info) => {
            tracing::info!(session = %session.id(), address = %info.address(), "display ready");
            session.set_status("");
            session.set_sub_status("");
            session.set_endpoint(Some(info));
            Ok(())
        }
        Err(e) => {
            tracing::warn!(session = %session.id(), error = %e, "display negotiation failed");
            let _ = kill.send(());
            Err(e)
        }
    }
}

/// Kill a child that never got its monitor up and report the most useful
/// error: its own non-zero exit code if it had already failed.
async fn abort_launch(child: &mut Child, program: &str, error: OperationError) -> OperationError {
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => match check_exit(program, status) {
            Err(exit @ ProcessError::ExitCode { .. }) => exit.into(),
            _ => error,
        },
        Err(_) => error,
    }
}

async fn forward_output<R>(stream: R, session: Arc<Session>, program: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(session = %session.id(), "{program}: {line}");
        if !line.trim().is_empty() {
            session.set_sub_status(&line);
        }
    }
}
