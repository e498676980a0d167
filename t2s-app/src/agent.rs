use async_trait::async_trait;
use std::process::Stdio;
use t2s_core::{AgentError, AgentRunner};
use tokio::process::Command;

const MAX_ERROR_TAIL: usize = 2000;

/// Runs the configured agent CLI once per task:
/// `<program> <args...> <instruction>` inside the session workspace.
pub struct ProcessAgent {
    program: String,
    args: Vec<String>,
}

impl ProcessAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgent {
    #[tracing::instrument(level = "info", skip_all, fields(program = %self.program, workspace = %workspace))]
    async fn run_task(&self, workspace: &str, instruction: &str) -> Result<String, AgentError> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| AgentError::Internal(format!("prepare workspace {workspace}: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(instruction)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| AgentError::Unreachable(format!("spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), MAX_ERROR_TAIL);
            tracing::warn!(exit_code = output.status.code().unwrap_or(-1), "agent exited with failure");
            return Err(AgentError::Internal(format!(
                "agent exited with {}: {tail}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
