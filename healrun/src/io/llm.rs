//! Model inference abstraction.
//!
//! The [`Llm`] trait decouples the engine from the inference backend. The
//! shipped backend pipes the prompt into a configured command (for example
//! `codex exec -`); tests use scripted replies without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::LlmConfig;
use crate::io::process::run_command_with_timeout;

/// A blocking text-completion backend.
pub trait Llm {
    /// Complete `prompt` on behalf of `project_id`. Failures are fatal to the caller.
    fn infer(&self, prompt: &str, project_id: &str) -> Result<String>;
}

impl<T: Llm + ?Sized> Llm for &T {
    fn infer(&self, prompt: &str, project_id: &str) -> Result<String> {
        (**self).infer(prompt, project_id)
    }
}

/// Backend that spawns a command, writes the prompt to its stdin and returns stdout.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandLlm {
    pub fn new(config: &LlmConfig, workdir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            command: config.command.clone(),
            workdir,
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes,
        }
    }
}

impl Llm for CommandLlm {
    #[instrument(skip_all, fields(project_id = %project_id, timeout_secs = self.timeout.as_secs()))]
    fn infer(&self, prompt: &str, project_id: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("llm.command is empty"))?;
        info!(program = %program, prompt_bytes = prompt.len(), "requesting completion");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("HEALRUN_PROJECT", project_id);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run llm command `{program}`"))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "llm command timed out");
            return Err(anyhow!("llm command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "llm command failed");
            return Err(anyhow!(
                "llm command failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let reply = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(reply_bytes = reply.len(), "completion received");
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn llm(command: &[&str]) -> CommandLlm {
        CommandLlm::new(
            &LlmConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                timeout_secs: 10,
            },
            std::env::temp_dir(),
            10_000,
        )
    }

    #[test]
    fn prompt_is_piped_through_stdin() {
        let reply = llm(&["cat"]).infer("<commands/>", "demo").expect("infer");
        assert_eq!(reply, "<commands/>");
    }

    #[test]
    fn project_id_is_exported_to_the_backend() {
        let reply = llm(&["sh", "-c", "cat >/dev/null; printf %s \"$HEALRUN_PROJECT\""])
            .infer("x", "demo")
            .expect("infer");
        assert_eq!(reply, "demo");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = llm(&["sh", "-c", "cat >/dev/null; echo quota >&2; exit 1"])
            .infer("x", "demo")
            .unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(llm(&[]).infer("x", "demo").is_err());
    }
}
