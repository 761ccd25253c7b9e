//! Prompt rendering for every model request the engine makes.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go
//! first, then the largest remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::process::Invocation;

const RUNNER_TEMPLATE: &str = include_str!("prompts/runner.md");
const RERUNNER_TEMPLATE: &str = include_str!("prompts/rerunner.md");
const PATCHER_TEMPLATE: &str = include_str!("prompts/patcher.md");
const STEP_TEMPLATE: &str = include_str!("prompts/step.md");
const ANSWER_TEMPLATE: &str = include_str!("prompts/answer.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// Which request a prompt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Initial command list for a session.
    Runner,
    /// Remediation guidance for a failed command.
    Rerunner,
    /// Code regeneration after a failure.
    Patcher,
    /// Next agent step.
    Step,
    /// Direct answer to the user.
    Answer,
}

impl PromptKind {
    fn template_name(self) -> &'static str {
        match self {
            PromptKind::Runner => "runner",
            PromptKind::Rerunner => "rerunner",
            PromptKind::Patcher => "patcher",
            PromptKind::Step => "step",
            PromptKind::Answer => "answer",
        }
    }
}

/// Everything a template may reference. Unused fields are ignored.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub conversation: &'a str,
    pub code_markdown: &'a str,
    pub os_id: &'a str,
    pub invocation: Invocation,
    pub commands: &'a [String],
    pub error: &'a str,
}

impl<'a> PromptInputs<'a> {
    pub fn new(conversation: &'a str, code_markdown: &'a str, os_id: &'a str) -> Self {
        Self {
            conversation,
            code_markdown,
            os_id,
            invocation: Invocation::Argv,
            commands: &[],
            error: "",
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("runner", RUNNER_TEMPLATE),
            ("rerunner", RERUNNER_TEMPLATE),
            ("patcher", PATCHER_TEMPLATE),
            ("step", STEP_TEMPLATE),
            ("answer", ANSWER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, kind: PromptKind, input: &PromptInputs<'_>) -> Result<String> {
        let invocation = match input.invocation {
            Invocation::Argv => "argv",
            Invocation::Shell => "shell",
        };
        let template = self.env.get_template(kind.template_name())?;
        let rendered = template.render(context! {
            conversation => input.conversation.trim(),
            code_markdown => input.code_markdown.trim(),
            os_id => input.os_id,
            invocation => invocation,
            commands => input.commands,
            error => input.error.trim(),
        })?;
        Ok(rendered)
    }
}

/// Renders budgeted prompts.
pub struct PromptBuilder {
    engine: PromptEngine,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        Ok(Self {
            engine: PromptEngine::new()?,
            budget_bytes,
        })
    }

    pub fn build(&self, kind: PromptKind, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self
            .engine
            .render(kind, input)
            .with_context(|| format!("render {} prompt", kind.template_name()))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let Some(marker) = caps.get(0) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[marker.end()..end].trim().to_string();
        let required = &caps[2] == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop order: code -> conversation. Anything still over budget is cut from
/// the largest section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["code", "conversation"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let before_len = largest.content.len();
    let allowed = before_len.saturating_sub(total - budget);
    let marker = "\n[truncated]";
    let mut cut = allowed.saturating_sub(marker.len());
    while !largest.content.is_char_boundary(cut) {
        cut -= 1;
    }
    largest.content.truncate(cut);
    largest.content.push_str(marker);
    debug!(
        section = %largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
