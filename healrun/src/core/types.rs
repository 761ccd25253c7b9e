//! Shared data model for extraction and execution.
//!
//! These types define stable contracts between core components and the I/O
//! adapters. Serialized shapes are consumed by the UI and must not drift.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated instruction derived from a model reply.
///
/// A directive is always fully populated for its kind; partial replies are
/// rejected during extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDirective {
    Answer { text: String },
    CommandList { commands: Vec<String> },
    Guidance(Guidance),
    WriteFile(WriteFile),
    StepResult(StepResult),
}

/// Remediation advice for a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guidance {
    pub action: GuidanceAction,
    /// Message for the user explaining the remediation.
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuidanceAction {
    /// Run this command in place of the failed one.
    Command { command: String },
    /// Regenerate code from the error, then re-run the failed command.
    Patch,
}

/// A file the model wants written into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    pub file_name: String,
    pub content: String,
}

/// Files produced by the patch generator, in the order they were emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeContext {
    pub files: Vec<WriteFile>,
}

impl CodeContext {
    pub fn to_markdown(&self) -> String {
        super::render::code_markdown(&self.files)
    }
}

/// One step of the autonomous agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub comment: String,
    pub action: StepAction,
    pub next: NextStep,
    pub action_params: Map<String, Value>,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Ask for a command list and run it through the retry engine.
    Execute,
    /// Write `actionParams.content` to `fileName`.
    WriteFile,
    /// Reply to the user with the step comment only.
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextStep {
    ProceedToNextStep,
    NeedUserAnswer,
}

/// How a single invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    Exited { code: Option<i32> },
    TimedOut { after_secs: u64 },
    /// The process never started (missing executable, unparsable command line).
    LaunchFailed { reason: String },
}

/// One command invocation. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitState,
    pub timestamp: String,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.exit, ExitState::Exited { code: Some(0) })
    }

    /// Stdout followed by any stderr, as shown to both the model and the user.
    pub fn combined_output(&self) -> String {
        super::render::combined_output(&self.stdout, &self.stderr)
    }
}

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    // The UI keys agent messages on this exact spelling.
    #[serde(rename = "Devika")]
    Devika,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "system")]
    System,
}

impl MessageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSource::Devika => "Devika",
            MessageSource::User => "user",
            MessageSource::System => "system",
        }
    }
}

/// A conversation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub source: MessageSource,
    pub from_devika: bool,
    pub message: String,
    pub timestamp: String,
}

impl Message {
    pub fn new(source: MessageSource, message: impl Into<String>) -> Self {
        Self {
            source,
            from_devika: source == MessageSource::Devika,
            message: message.into(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn from_devika(message: impl Into<String>) -> Self {
        Self::new(MessageSource::Devika, message)
    }

    /// `source: message`, the form prompts consume.
    pub fn formatted(&self) -> String {
        format!("{}: {}", self.source.as_str(), self.message)
    }
}

/// Terminal pane of the UI snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub title: Option<String>,
    pub command: Option<String>,
    pub output: Option<String>,
}

/// Browser pane of the UI snapshot. Only carried through, never produced here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSession {
    pub url: Option<String>,
    pub screenshot: Option<String>,
}

/// Observer-facing state for one project. Last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub internal_monologue: String,
    pub browser_session: Option<BrowserSession>,
    pub terminal_session: TerminalSession,
    pub completed: bool,
    pub agent_is_active: bool,
    pub timestamp: String,
}

impl AgentSnapshot {
    pub fn monologue(text: impl Into<String>) -> Self {
        Self {
            internal_monologue: text.into(),
            browser_session: None,
            terminal_session: TerminalSession::default(),
            completed: false,
            agent_is_active: true,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn terminal(
        monologue: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            terminal_session: TerminalSession {
                title: Some("Terminal".to_string()),
                command: Some(command.into()),
                output: Some(output.into()),
            },
            ..Self::monologue(monologue)
        }
    }
}

/// Lowercased, dash-separated project identifier used for file names.
pub fn project_slug(project_id: &str) -> String {
    project_id
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_alphanumeric() || ch == '-' || ch == '_' { ch } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_success_requires_exit_zero() {
        let mut record = ExecutionRecord {
            command: "true".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit: ExitState::Exited { code: Some(0) },
            timestamp: String::new(),
        };
        assert!(record.succeeded());
        record.exit = ExitState::Exited { code: Some(2) };
        assert!(!record.succeeded());
        record.exit = ExitState::LaunchFailed {
            reason: "not found".to_string(),
        };
        assert!(!record.succeeded());
    }

    #[test]
    fn snapshot_serializes_with_ui_field_names() {
        let mut snapshot = AgentSnapshot::terminal("Executing command...", "ls", "a\nb");
        snapshot.timestamp = "2024-01-01 00:00:00".to_string();
        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["internal_monologue"], "Executing command...");
        assert_eq!(value["terminal_session"]["title"], "Terminal");
        assert_eq!(value["terminal_session"]["command"], "ls");
        assert_eq!(value["terminal_session"]["output"], "a\nb");
        assert!(value["browser_session"].is_null());
    }

    #[test]
    fn message_source_spellings_match_ui() {
        assert_eq!(
            serde_json::to_value(MessageSource::Devika).expect("serialize"),
            "Devika"
        );
        assert_eq!(Message::new(MessageSource::User, "hi").formatted(), "user: hi");
        assert!(Message::from_devika("done").from_devika);
    }

    #[test]
    fn slug_lowercases_and_dashes() {
        assert_eq!(project_slug("My Project/v2"), "my-project-v2");
    }
}
