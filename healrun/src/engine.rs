//! The self-healing execution engine.
//!
//! A session asks the model for a command list, runs each command, and on
//! failure asks for guidance: either a replacement command or a code patch
//! followed by a re-run. Each command gets `retry_budget` remediations; after
//! that the engine moves on to the next command.
//!
//! Cancellation is cooperative. The state store's interrupt flag is polled
//! before every model request and after every reply is parsed, never while a
//! command is running.

use std::path::PathBuf;
use std::slice;
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::core::directive::{ExtractionError, parse_command_list, parse_guidance};
use crate::core::render::{conversation_entry, terminal_output};
use crate::core::types::{
    AgentSnapshot, ExecutionRecord, ExitState, GuidanceAction, Message,
};
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::conversation::ConversationSink;
use crate::io::llm::Llm;
use crate::io::patcher::{PatchRequest, Patcher};
use crate::io::process::{ProcessRunner, RunRequest};
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptKind};
use crate::io::state::StateStore;
use crate::io::workspace::snapshot_code;

const RUNNING: &str = "Executing command...";
const SUCCEEDED: &str = "Command executed successfully";
const FAILED: &str = "Oh seems like there is some error... :(";

/// Context for one top-level run against a project.
#[derive(Debug, Clone)]
pub struct ExecutionSession {
    pub project_id: String,
    pub workspace: PathBuf,
    pub os_id: String,
    /// Ordered, append-only.
    pub transcript: Vec<Message>,
    pub code_markdown: String,
    /// Remediations across the whole session.
    pub retries: u32,
    pub records: Vec<ExecutionRecord>,
}

impl ExecutionSession {
    pub fn new(
        project_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
        os_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            workspace: workspace.into(),
            os_id: os_id.into(),
            transcript: Vec::new(),
            code_markdown: String::new(),
            retries: 0,
            records: Vec::new(),
        }
    }

    pub fn with_transcript(mut self, transcript: Vec<Message>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn with_code_markdown(mut self, code_markdown: impl Into<String>) -> Self {
        self.code_markdown = code_markdown.into();
        self
    }

    pub fn transcript_text(&self) -> String {
        self.transcript
            .iter()
            .map(Message::formatted)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every command was attempted.
    Completed,
    /// Stopped by an interrupt.
    Aborted,
    /// The model never produced a usable command list.
    MalformedReplies,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Commands abandoned after their remediations ran out.
    pub gave_up: Vec<String>,
}

impl ExecutionOutcome {
    fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            gave_up: Vec::new(),
        }
    }
}

/// Result of asking the model for one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Parsed(T),
    Interrupted,
    /// Every attempt came back malformed.
    Exhausted,
}

enum CommandResult {
    Succeeded,
    GaveUp,
    Aborted,
}

pub struct Engine<'s, L, R, P, C> {
    pub(crate) llm: L,
    pub(crate) runner: R,
    pub(crate) patcher: P,
    pub(crate) conversation: C,
    pub(crate) store: &'s StateStore,
    pub(crate) prompts: PromptBuilder,
    pub(crate) config: EngineConfig,
}

impl<'s, L, R, P, C> Engine<'s, L, R, P, C>
where
    L: Llm,
    R: ProcessRunner,
    P: Patcher,
    C: ConversationSink,
{
    pub fn new(
        llm: L,
        runner: R,
        patcher: P,
        conversation: C,
        store: &'s StateStore,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            llm,
            runner,
            patcher,
            conversation,
            store,
            prompts: PromptBuilder::new(config.prompt_budget_bytes)?,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a full session: claim the project, get a command list, and run
    /// every command through remediation.
    #[instrument(skip_all, fields(project_id = %session.project_id))]
    pub fn execute(
        &self,
        session: &mut ExecutionSession,
    ) -> Result<ExecutionOutcome, EngineError> {
        let _guard = self
            .store
            .begin_session(&session.project_id)
            .map_err(EngineError::Sink)?
            .ok_or_else(|| EngineError::SessionActive(session.project_id.clone()))?;
        let result = self.execute_claimed(session);
        self.close(&session.project_id, result.as_ref().map(|o| o.status));
        result
    }

    /// [`Engine::execute`] for a caller that already holds the session slot.
    pub(crate) fn execute_claimed(
        &self,
        session: &mut ExecutionSession,
    ) -> Result<ExecutionOutcome, EngineError> {
        let conversation = session.transcript_text();
        let input = PromptInputs {
            invocation: self.config.invocation,
            ..PromptInputs::new(&conversation, &session.code_markdown, &session.os_id)
        };
        let prompt = self
            .prompts
            .build(PromptKind::Runner, &input)
            .map_err(EngineError::Inference)?;

        let commands = match self.request_directive(&session.project_id, &prompt, parse_command_list)? {
            Reply::Parsed(commands) => commands,
            Reply::Interrupted => return Ok(ExecutionOutcome::status(ExecutionStatus::Aborted)),
            Reply::Exhausted => {
                return Ok(ExecutionOutcome::status(ExecutionStatus::MalformedReplies));
            }
        };
        info!(commands = commands.len(), "running command list");

        let mut outcome = ExecutionOutcome::status(ExecutionStatus::Completed);
        for command in &commands {
            if self.store.is_interrupted(&session.project_id) {
                outcome.status = ExecutionStatus::Aborted;
                return Ok(outcome);
            }
            match self.run_with_remediation(session, command)? {
                CommandResult::Succeeded => {}
                CommandResult::GaveUp => outcome.gave_up.push(command.clone()),
                CommandResult::Aborted => {
                    outcome.status = ExecutionStatus::Aborted;
                    return Ok(outcome);
                }
            }
        }
        Ok(outcome)
    }

    /// Push the closing snapshot for a finished session.
    pub(crate) fn close(
        &self,
        project_id: &str,
        result: Result<ExecutionStatus, &EngineError>,
    ) {
        let (completed, monologue) = match result {
            Ok(ExecutionStatus::Completed) => (true, "Execution complete".to_string()),
            Ok(ExecutionStatus::Aborted) => (false, "Interrupted by user".to_string()),
            Ok(ExecutionStatus::MalformedReplies) => (
                false,
                "Stopped: the model did not return a usable reply".to_string(),
            ),
            Err(err) => (false, format!("Execution failed: {err}")),
        };
        if let Err(err) = self.store.finish(project_id, completed, &monologue) {
            warn!(err = %err, "failed to record final state");
        }
    }

    /// Ask the model until `parse` accepts a reply, the project is interrupted,
    /// or `max_reply_attempts` replies were rejected.
    pub(crate) fn request_directive<T>(
        &self,
        project_id: &str,
        prompt: &str,
        parse: impl Fn(&str) -> Result<T, ExtractionError>,
    ) -> Result<Reply<T>, EngineError> {
        for attempt in 1..=self.config.max_reply_attempts {
            if self.store.is_interrupted(project_id) {
                info!("interrupted before model request");
                return Ok(Reply::Interrupted);
            }
            let reply = self
                .llm
                .infer(prompt, project_id)
                .map_err(EngineError::Inference)?;
            let parsed = parse(&reply);
            if self.store.is_interrupted(project_id) {
                info!("interrupted after model reply");
                return Ok(Reply::Interrupted);
            }
            match parsed {
                Ok(value) => return Ok(Reply::Parsed(value)),
                Err(err) => warn!(attempt, err = %err, "invalid reply from the model, trying again"),
            }
        }
        warn!(
            attempts = self.config.max_reply_attempts,
            "no usable reply from the model"
        );
        Ok(Reply::Exhausted)
    }

    fn run_with_remediation(
        &self,
        session: &mut ExecutionSession,
        command: &str,
    ) -> Result<CommandResult, EngineError> {
        let mut current = command.to_string();
        let mut remediations = 0;
        loop {
            let record = self.run_command(session, &current)?;
            if record.succeeded() {
                return Ok(CommandResult::Succeeded);
            }
            if remediations >= self.config.retry_budget {
                warn!(command = %current, remediations, "retry budget exhausted, moving on");
                return Ok(CommandResult::GaveUp);
            }

            let error = terminal_output(&record);
            let conversation = session.transcript_text();
            let input = PromptInputs {
                invocation: self.config.invocation,
                commands: slice::from_ref(&current),
                error: &error,
                ..PromptInputs::new(&conversation, &session.code_markdown, &session.os_id)
            };
            let prompt = self
                .prompts
                .build(PromptKind::Rerunner, &input)
                .map_err(EngineError::Inference)?;
            let guidance = match self.request_directive(&session.project_id, &prompt, parse_guidance)? {
                Reply::Parsed(guidance) => guidance,
                Reply::Interrupted => return Ok(CommandResult::Aborted),
                Reply::Exhausted => {
                    warn!(command = %current, "no usable guidance, moving on");
                    return Ok(CommandResult::GaveUp);
                }
            };

            remediations += 1;
            session.retries += 1;
            debug!(remediations, retries = session.retries, action = ?guidance.action, "remediating");
            self.append(session, Message::from_devika(guidance.response.clone()))?;

            match guidance.action {
                GuidanceAction::Command { command } => current = command,
                GuidanceAction::Patch => {
                    if !self.apply_patch(session, &current, &error)? {
                        return Ok(CommandResult::Aborted);
                    }
                }
            }
        }
    }

    /// Patch the workspace and re-read the code context from disk, since a
    /// patch only carries the files it changed. Returns `false` when the
    /// project was interrupted before a patch arrived.
    fn apply_patch(
        &self,
        session: &mut ExecutionSession,
        command: &str,
        error: &str,
    ) -> Result<bool, EngineError> {
        self.push(&session.project_id, AgentSnapshot::monologue("Patching the code..."))?;
        let conversation = session.transcript_text();
        let commands = [command.to_string()];
        let request = PatchRequest {
            conversation: &conversation,
            code_markdown: &session.code_markdown,
            commands: &commands,
            error,
            os_id: &session.os_id,
            project_id: &session.project_id,
            store: self.store,
        };
        let Some(code) = self.patcher.patch(&request).map_err(EngineError::Patch)? else {
            info!("interrupted while patching");
            return Ok(false);
        };
        self.patcher
            .persist(&code, &session.workspace)
            .map_err(EngineError::Patch)?;
        info!(files = code.files.len(), "patch applied");
        session.code_markdown = snapshot_code(&session.workspace)
            .map_err(EngineError::Workspace)?
            .to_markdown();
        Ok(true)
    }

    /// Run one command and record it everywhere it is observed.
    fn run_command(
        &self,
        session: &mut ExecutionSession,
        command: &str,
    ) -> Result<ExecutionRecord, EngineError> {
        self.push(
            &session.project_id,
            AgentSnapshot::terminal(RUNNING, command, ""),
        )?;
        let request = RunRequest {
            command: command.to_string(),
            workdir: session.workspace.clone(),
            invocation: self.config.invocation,
            timeout: self.config.command_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let (stdout, stderr, exit) = match self.runner.run(&request) {
            Ok(output) => {
                let exit = if output.timed_out {
                    ExitState::TimedOut {
                        after_secs: self.config.command_timeout_secs,
                    }
                } else {
                    ExitState::Exited {
                        code: output.exit_code,
                    }
                };
                (output.stdout, output.stderr, exit)
            }
            Err(err) if err.is_launch_failure() => {
                warn!(command, err = %err, "command did not start");
                (
                    String::new(),
                    String::new(),
                    ExitState::LaunchFailed {
                        reason: err.to_string(),
                    },
                )
            }
            Err(err) => return Err(EngineError::Process(err)),
        };

        let record = ExecutionRecord {
            command: command.to_string(),
            stdout,
            stderr,
            exit,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        info!(command, succeeded = record.succeeded(), exit = ?record.exit, "command finished");
        session.records.push(record.clone());

        self.append(session, Message::from_devika(conversation_entry(&record)))?;
        let monologue = if record.succeeded() { SUCCEEDED } else { FAILED };
        self.push(
            &session.project_id,
            AgentSnapshot::terminal(monologue, command, terminal_output(&record)),
        )?;

        let pacing = self.config.pacing();
        if !pacing.is_zero() {
            thread::sleep(pacing);
        }
        Ok(record)
    }

    pub(crate) fn append(
        &self,
        session: &mut ExecutionSession,
        message: Message,
    ) -> Result<(), EngineError> {
        self.conversation
            .append(&session.project_id, message.clone())
            .map_err(EngineError::Sink)?;
        session.transcript.push(message);
        Ok(())
    }

    pub(crate) fn push(&self, project_id: &str, snapshot: AgentSnapshot) -> Result<(), EngineError> {
        self.store
            .push_snapshot(project_id, snapshot)
            .map_err(EngineError::Sink)
    }
}
