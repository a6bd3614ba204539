//! Pre- and post-transaction scripts.

use tracing::{error, info};

use crate::build::context::{BuildContext, TransactionEnv};
use crate::error::{Result, RootfsError};
use crate::process::shell;

/// Runs configured shell command lines against the target root.
pub struct ScriptRunner<'a> {
    ctx: &'a BuildContext,
    env: &'a TransactionEnv,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(ctx: &'a BuildContext, env: &'a TransactionEnv) -> Self {
        Self { ctx, env }
    }

    /// Run `scripts` in order. The first non-zero exit aborts.
    pub fn run_all(&self, stage: &str, scripts: &[String]) -> Result<()> {
        for script in scripts {
            self.run(stage, script)?;
        }
        Ok(())
    }

    pub fn run(&self, stage: &str, script: &str) -> Result<()> {
        info!(stage, script, "executing script");
        let cmd = shell(script).envs(self.env.script()).dir(&self.ctx.workdir);
        let result = cmd.run()?;
        let output = result.combined();
        self.ctx.append_log(&cmd.display(), &output)?;

        if !result.success() {
            error!(stage, script, code = result.code(), "script failed");
            return Err(RootfsError::Script {
                script: script.to_string(),
                code: result.code(),
                output,
            });
        }
        Ok(())
    }
}
