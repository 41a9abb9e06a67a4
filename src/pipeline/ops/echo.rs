use async_trait::async_trait;

use crate::pipeline::{Operation, OperationError, RunContext};

/// `echo <text...>`: show a status line.
pub struct Echo;

#[async_trait]
impl Operation for Echo {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        _name: &str,
        args: &[String],
    ) -> Result<(), OperationError> {
        let session = ctx.session();
        session.set_status(&args.join(" "));
        session.set_sub_status("");
        Ok(())
    }
}
