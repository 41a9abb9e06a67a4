use async_trait::async_trait;

use crate::pipeline::{Operation, OperationError, RunContext};
use crate::process::{check_exit, ProcessSpec};
use crate::resources::IMAGE_TOOL;

/// `qemu-img <args...>`: run the disk image utility in the workspace.
///
/// Output lines are shown as the sub-status while it runs.
pub struct ImageTool;

#[async_trait]
impl Operation for ImageTool {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        _name: &str,
        args: &[String],
    ) -> Result<(), OperationError> {
        let resources = ctx.resources();
        resources.ensure()?;
        let spec = ProcessSpec::new(resources.binary(IMAGE_TOOL)?)
            .args(args.iter().cloned())
            .current_dir(ctx.workspace())
            .library_dir(resources.lib_dir());

        let session = ctx.session();
        let status = spec
            .run_with_lines(|line| {
                tracing::debug!(session = %session.id(), "{IMAGE_TOOL}: {line}");
                if !line.trim().is_empty() {
                    session.set_sub_status(line);
                }
            })
            .await?;
        session.set_sub_status("");

        check_exit(IMAGE_TOOL, status)?;
        Ok(())
    }
}
