//! Child process execution with timeouts and bounded output.
//!
//! [`ProcessRunner`] is the seam the engine runs workspace commands through;
//! [`run_command_with_timeout`] is shared with the command-backed LLM client.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::argv::{ArgvError, split_command};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// How a command line is turned into a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Split with shell quoting rules and run the executable directly.
    #[default]
    Argv,
    /// Hand the line to `sh -c` (`cmd /C` on Windows).
    Shell,
}

/// One workspace command to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub invocation: Invocation,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Decoded output of a finished (or killed) workspace command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot parse command line: {0}")]
    Parse(#[from] ArgvError),
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("process i/o failed: {0:#}")]
    Io(anyhow::Error),
}

impl RunError {
    /// Whether the command never started, as opposed to an I/O fault while it ran.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, RunError::Parse(_) | RunError::Launch { .. })
    }
}

/// Abstraction over how workspace commands are executed.
pub trait ProcessRunner {
    fn run(&self, request: &RunRequest) -> Result<ProcessOutput, RunError>;
}

impl<T: ProcessRunner + ?Sized> ProcessRunner for &T {
    fn run(&self, request: &RunRequest) -> Result<ProcessOutput, RunError> {
        (**self).run(request)
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    #[instrument(skip_all, fields(command = %request.command, invocation = ?request.invocation))]
    fn run(&self, request: &RunRequest) -> Result<ProcessOutput, RunError> {
        let (program, mut cmd) = build_command(&request.command, request.invocation)?;
        cmd.current_dir(&request.workdir);
        let child = spawn_piped(cmd, false).map_err(|source| RunError::Launch { program, source })?;
        let output = collect_output(child, None, request.timeout, request.output_limit_bytes)
            .map_err(RunError::Io)?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice("command"));
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice("command"));
        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

/// Build the process for `command` under `invocation`. Returns the program
/// name alongside for error reporting.
pub fn build_command(command: &str, invocation: Invocation) -> Result<(String, Command), ArgvError> {
    match invocation {
        Invocation::Argv => {
            let argv = split_command(command)?;
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            Ok((argv[0].clone(), cmd))
        }
        Invocation::Shell => {
            if command.trim().is_empty() {
                return Err(ArgvError::Empty);
            }
            let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
            let mut cmd = Command::new(shell);
            cmd.arg(flag).arg(command);
            Ok((shell.to_string(), cmd))
        }
    }
}

fn spawn_piped(mut cmd: Command, with_stdin: bool) -> io::Result<Child> {
    if with_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    debug!("spawning child process");
    cmd.spawn().inspect_err(|e| error!(err = %e, "failed to spawn command"))
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let child = spawn_piped(cmd, stdin.is_some()).context("spawn command")?;
    collect_output(child, stdin, timeout, output_limit_bytes)
}

fn collect_output(
    mut child: Child,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
