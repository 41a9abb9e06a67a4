use async_trait::async_trait;

use crate::pipeline::{Operation, OperationError, RunContext};

/// Persist the installed flag once the install tasks have all succeeded.
///
/// Also clears the status lines left over from installation.
pub struct MarkInstalled;

#[async_trait]
impl Operation for MarkInstalled {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        _name: &str,
        _args: &[String],
    ) -> Result<(), OperationError> {
        let session = ctx.session();
        session.set_installed(true)?;
        session.set_status("");
        session.set_sub_status("");
        tracing::info!(session = %session.id(), "installation complete");
        Ok(())
    }
}
