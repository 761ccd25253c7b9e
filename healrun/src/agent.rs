//! The step loop that drives a project forward, and direct answers.

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::directive::{parse_answer, parse_step_result};
use crate::core::types::{AgentSnapshot, Message, NextStep, StepAction, WriteFile};
use crate::engine::{Engine, ExecutionSession, ExecutionStatus, Reply};
use crate::error::EngineError;
use crate::io::conversation::ConversationSink;
use crate::io::llm::Llm;
use crate::io::patcher::Patcher;
use crate::io::process::ProcessRunner;
use crate::io::prompt::{PromptInputs, PromptKind};
use crate::io::workspace::{snapshot_code, write_file};

/// Why the step loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The model asked for user input.
    NeedUserAnswer,
    /// `max_steps` steps ran without the model stopping.
    MaxSteps,
    Aborted,
    MalformedReplies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub steps: u32,
}

impl<L, R, P, C> Engine<'_, L, R, P, C>
where
    L: Llm,
    R: ProcessRunner,
    P: Patcher,
    C: ConversationSink,
{
    /// Ask for steps and act on them until the model needs the user, the
    /// project is interrupted, or `max_steps` is reached.
    #[instrument(skip_all, fields(project_id = %session.project_id))]
    pub fn run_agent_loop(
        &self,
        session: &mut ExecutionSession,
    ) -> Result<LoopOutcome, EngineError> {
        let _guard = self
            .store
            .begin_session(&session.project_id)
            .map_err(EngineError::Sink)?
            .ok_or_else(|| EngineError::SessionActive(session.project_id.clone()))?;
        let result = self.step_until_stop(session);
        let status = result.as_ref().map(|outcome| match outcome.stop {
            LoopStop::Aborted => ExecutionStatus::Aborted,
            LoopStop::MalformedReplies => ExecutionStatus::MalformedReplies,
            LoopStop::NeedUserAnswer | LoopStop::MaxSteps => ExecutionStatus::Completed,
        });
        self.close(&session.project_id, status);
        result
    }

    fn step_until_stop(&self, session: &mut ExecutionSession) -> Result<LoopOutcome, EngineError> {
        for step in 1..=self.config.max_steps {
            let conversation = session.transcript_text();
            let input = PromptInputs::new(&conversation, &session.code_markdown, &session.os_id);
            let prompt = self
                .prompts
                .build(PromptKind::Step, &input)
                .map_err(EngineError::Inference)?;
            let result = match self.request_directive(&session.project_id, &prompt, parse_step_result)? {
                Reply::Parsed(result) => result,
                Reply::Interrupted => {
                    return Ok(LoopOutcome {
                        stop: LoopStop::Aborted,
                        steps: step - 1,
                    });
                }
                Reply::Exhausted => {
                    return Ok(LoopOutcome {
                        stop: LoopStop::MalformedReplies,
                        steps: step - 1,
                    });
                }
            };
            info!(step, action = ?result.action, next = ?result.next, "agent step");

            if !result.comment.trim().is_empty() {
                self.append(session, Message::from_devika(result.comment.trim()))?;
                self.push(&session.project_id, AgentSnapshot::monologue(result.comment.trim()))?;
            }

            match result.action {
                StepAction::Execute => {
                    let outcome = self.execute_claimed(session)?;
                    let stop = match outcome.status {
                        ExecutionStatus::Completed => None,
                        ExecutionStatus::Aborted => Some(LoopStop::Aborted),
                        ExecutionStatus::MalformedReplies => Some(LoopStop::MalformedReplies),
                    };
                    if let Some(stop) = stop {
                        return Ok(LoopOutcome { stop, steps: step });
                    }
                }
                StepAction::WriteFile => {
                    let content = match result.action_params.get("content") {
                        Some(Value::String(content)) => content.clone(),
                        _ => String::new(),
                    };
                    let file = WriteFile {
                        file_name: result.file_name.trim().to_string(),
                        content,
                    };
                    write_file(&session.workspace, &file).map_err(EngineError::Workspace)?;
                    session.code_markdown = snapshot_code(&session.workspace)
                        .map_err(EngineError::Workspace)?
                        .to_markdown();
                    self.append(
                        session,
                        Message::from_devika(format!("Wrote `{}`", file.file_name)),
                    )?;
                }
                StepAction::Answer => {}
            }

            if result.next == NextStep::NeedUserAnswer {
                return Ok(LoopOutcome {
                    stop: LoopStop::NeedUserAnswer,
                    steps: step,
                });
            }
        }
        warn!(max_steps = self.config.max_steps, "step limit reached");
        Ok(LoopOutcome {
            stop: LoopStop::MaxSteps,
            steps: self.config.max_steps,
        })
    }

    /// Answer the user's latest message and append the answer to the conversation.
    ///
    /// Returns `None` when interrupted or when no usable answer arrived.
    #[instrument(skip_all, fields(project_id = %session.project_id))]
    pub fn answer(&self, session: &mut ExecutionSession) -> Result<Option<String>, EngineError> {
        let conversation = session.transcript_text();
        let input = PromptInputs::new(&conversation, &session.code_markdown, &session.os_id);
        let prompt = self
            .prompts
            .build(PromptKind::Answer, &input)
            .map_err(EngineError::Inference)?;
        match self.request_directive(&session.project_id, &prompt, parse_answer)? {
            Reply::Parsed(text) => {
                self.append(session, Message::from_devika(text.clone()))?;
                Ok(Some(text))
            }
            Reply::Interrupted | Reply::Exhausted => Ok(None),
        }
    }
}
