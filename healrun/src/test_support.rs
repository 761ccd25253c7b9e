//! Scripted collaborators for driving the engine without a model or a shell.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::types::{CodeContext, Message, WriteFile};
use crate::io::config::{EngineConfig, LlmConfig};
use crate::io::conversation::ConversationSink;
use crate::io::llm::Llm;
use crate::io::patcher::{PatchRequest, Patcher};
use crate::io::process::{ProcessOutput, ProcessRunner, RunError, RunRequest};
use crate::io::workspace::write_file;

/// Config with no pacing and small ceilings, for fast engine tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_budget: 2,
        max_reply_attempts: 3,
        max_steps: 5,
        pacing_ms: 0,
        command_timeout_secs: 5,
        llm: LlmConfig {
            command: vec!["unused".to_string()],
            timeout_secs: 5,
        },
        ..EngineConfig::default()
    }
}

pub fn ok_output(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        stdout: stdout.to_string(),
        exit_code: Some(0),
        ..ProcessOutput::default()
    }
}

pub fn failed_output(stderr: &str, code: i32) -> ProcessOutput {
    ProcessOutput {
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..ProcessOutput::default()
    }
}

pub fn launch_error(program: &str) -> RunError {
    RunError::Launch {
        program: program.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
    }
}

type Hook<'a> = Box<dyn Fn(usize) + 'a>;

/// Replies to prompts from a fixed queue and records every prompt.
pub struct ScriptedLlm<'a> {
    replies: RefCell<VecDeque<String>>,
    prompts: RefCell<Vec<String>>,
    hook: Option<Hook<'a>>,
}

impl<'a> ScriptedLlm<'a> {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            prompts: RefCell::new(Vec::new()),
            hook: None,
        }
    }

    /// Run `hook` with the 1-based call number before each reply is handed out.
    pub fn with_hook(mut self, hook: impl Fn(usize) + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn assert_drained(&self) {
        let left = self.replies.borrow().len();
        assert_eq!(left, 0, "{left} scripted replies were never requested");
    }
}

impl Llm for ScriptedLlm<'_> {
    fn infer(&self, prompt: &str, _project_id: &str) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        if let Some(hook) = &self.hook {
            hook(self.prompts.borrow().len());
        }
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm: no reply left"))
    }
}

/// Returns queued outcomes for each command and records what was run.
#[derive(Default)]
pub struct ScriptedRunner<'a> {
    outcomes: RefCell<VecDeque<Result<ProcessOutput, RunError>>>,
    commands: RefCell<Vec<String>>,
    hook: Option<Hook<'a>>,
}

impl<'a> ScriptedRunner<'a> {
    pub fn new<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Result<ProcessOutput, RunError>>,
    {
        Self {
            outcomes: RefCell::new(outcomes.into_iter().collect()),
            commands: RefCell::new(Vec::new()),
            hook: None,
        }
    }

    /// Run `hook` with the 1-based run number after each command finishes.
    pub fn with_hook(mut self, hook: impl Fn(usize) + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.outcomes.borrow().len();
        assert_eq!(left, 0, "{left} scripted command outcomes were never used");
    }
}

impl ProcessRunner for ScriptedRunner<'_> {
    fn run(&self, request: &RunRequest) -> Result<ProcessOutput, RunError> {
        self.commands.borrow_mut().push(request.command.clone());
        let outcome = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(RunError::Io(anyhow!("scripted runner: no outcome left"))));
        if let Some(hook) = &self.hook {
            hook(self.commands.borrow().len());
        }
        outcome
    }
}

/// Hands out queued patches, records every request and writes persisted
/// files into the workspace. A patch is withheld while the project is
/// interrupted.
#[derive(Default)]
pub struct ScriptedPatcher<'a> {
    patches: RefCell<VecDeque<CodeContext>>,
    requests: RefCell<Vec<(Vec<String>, String)>>,
    persisted: RefCell<Vec<WriteFile>>,
    hook: Option<Hook<'a>>,
}

impl<'a> ScriptedPatcher<'a> {
    pub fn new(patches: impl IntoIterator<Item = CodeContext>) -> Self {
        Self {
            patches: RefCell::new(patches.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Run `hook` with the 1-based request number while each patch is generated.
    pub fn with_hook(mut self, hook: impl Fn(usize) + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// `(commands, error)` of every patch request.
    pub fn requests(&self) -> Vec<(Vec<String>, String)> {
        self.requests.borrow().clone()
    }

    pub fn persisted(&self) -> Vec<WriteFile> {
        self.persisted.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.patches.borrow().len();
        assert_eq!(left, 0, "{left} scripted patches were never requested");
    }
}

impl Patcher for ScriptedPatcher<'_> {
    fn patch(&self, request: &PatchRequest<'_>) -> Result<Option<CodeContext>> {
        self.requests
            .borrow_mut()
            .push((request.commands.to_vec(), request.error.to_string()));
        if let Some(hook) = &self.hook {
            hook(self.requests.borrow().len());
        }
        let code = self
            .patches
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted patcher: no patch left"))?;
        if request.store.is_interrupted(request.project_id) {
            return Ok(None);
        }
        Ok(Some(code))
    }

    fn persist(&self, code: &CodeContext, workspace: &Path) -> Result<()> {
        for file in &code.files {
            write_file(workspace, file)?;
        }
        self.persisted.borrow_mut().extend(code.files.iter().cloned());
        Ok(())
    }
}

/// Conversation sink that keeps messages in memory.
#[derive(Default)]
pub struct MemoryConversation {
    messages: RefCell<Vec<(String, Message)>>,
}

impl MemoryConversation {
    pub fn messages(&self, project_id: &str) -> Vec<Message> {
        self.messages
            .borrow()
            .iter()
            .filter(|(project, _)| project == project_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl ConversationSink for MemoryConversation {
    fn append(&self, project_id: &str, message: Message) -> Result<()> {
        self.messages
            .borrow_mut()
            .push((project_id.to_string(), message));
        Ok(())
    }
}
