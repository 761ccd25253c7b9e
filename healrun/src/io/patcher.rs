//! Code regeneration after a failed command.
//!
//! The engine only needs two things from a patcher: new code for a failure,
//! and a way to put that code into the workspace. [`LlmPatcher`] asks the
//! model for a `<files>` block and writes it with sandboxed paths. A patch
//! only carries the files it changes.
//!
//! The project's interrupt flag is checked around every model request, so a
//! stop requested mid-patch ends the patch with `Ok(None)`.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::directive::parse_write_files;
use crate::core::types::CodeContext;
use crate::io::llm::Llm;
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptKind};
use crate::io::state::StateStore;
use crate::io::workspace::write_file;

/// Inputs for one patch.
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest<'a> {
    pub conversation: &'a str,
    pub code_markdown: &'a str,
    pub commands: &'a [String],
    pub error: &'a str,
    pub os_id: &'a str,
    pub project_id: &'a str,
    /// Polled for the project's interrupt flag.
    pub store: &'a StateStore,
}

pub trait Patcher {
    /// Produce the files that should fix the failure, or `None` when the
    /// project was interrupted first.
    fn patch(&self, request: &PatchRequest<'_>) -> Result<Option<CodeContext>>;

    /// Write a patch into the workspace.
    fn persist(&self, code: &CodeContext, workspace: &Path) -> Result<()>;
}

impl<T: Patcher + ?Sized> Patcher for &T {
    fn patch(&self, request: &PatchRequest<'_>) -> Result<Option<CodeContext>> {
        (**self).patch(request)
    }

    fn persist(&self, code: &CodeContext, workspace: &Path) -> Result<()> {
        (**self).persist(code, workspace)
    }
}

/// Patcher backed by an [`Llm`].
pub struct LlmPatcher<L> {
    llm: L,
    prompts: PromptBuilder,
    max_reply_attempts: u32,
}

impl<L: Llm> LlmPatcher<L> {
    pub fn new(llm: L, prompt_budget_bytes: usize, max_reply_attempts: u32) -> Result<Self> {
        Ok(Self {
            llm,
            prompts: PromptBuilder::new(prompt_budget_bytes)?,
            max_reply_attempts,
        })
    }
}

impl<L: Llm> Patcher for LlmPatcher<L> {
    #[instrument(skip_all, fields(project_id = %request.project_id))]
    fn patch(&self, request: &PatchRequest<'_>) -> Result<Option<CodeContext>> {
        let input = PromptInputs {
            commands: request.commands,
            error: request.error,
            ..PromptInputs::new(request.conversation, request.code_markdown, request.os_id)
        };
        let prompt = self.prompts.build(PromptKind::Patcher, &input)?;
        for attempt in 1..=self.max_reply_attempts {
            if request.store.is_interrupted(request.project_id) {
                debug!(attempt, "interrupted before patch request");
                return Ok(None);
            }
            let reply = self.llm.infer(&prompt, request.project_id)?;
            if request.store.is_interrupted(request.project_id) {
                debug!(attempt, "interrupted after patch reply");
                return Ok(None);
            }
            match parse_write_files(&reply) {
                Ok(files) => {
                    info!(files = files.len(), attempt, "patch generated");
                    return Ok(Some(CodeContext { files }));
                }
                Err(err) => warn!(attempt, err = %err, "invalid patch reply, asking again"),
            }
        }
        bail!(
            "no valid patch after {} replies",
            self.max_reply_attempts
        )
    }

    fn persist(&self, code: &CodeContext, workspace: &Path) -> Result<()> {
        for file in &code.files {
            write_file(workspace, file)?;
        }
        Ok(())
    }
}
