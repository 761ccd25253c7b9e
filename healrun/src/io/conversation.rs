//! Append-only conversation history.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{Message, project_slug};

/// Destination for conversation messages. Messages are never rewritten.
pub trait ConversationSink {
    fn append(&self, project_id: &str, message: Message) -> Result<()>;
}

impl<T: ConversationSink + ?Sized> ConversationSink for &T {
    fn append(&self, project_id: &str, message: Message) -> Result<()> {
        (**self).append(project_id, message)
    }
}

/// One JSON object per line in `<dir>/<project-slug>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlConversationLog {
    dir: PathBuf,
}

impl JsonlConversationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", project_slug(project_id)))
    }

    /// Every stored message, oldest first. A missing log is an empty history.
    pub fn load(&self, project_id: &str) -> Result<Vec<Message>> {
        let path = self.path_for(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
            })
            .collect()
    }

    /// The transcript as `source: message` lines, the form prompts embed.
    pub fn load_formatted(&self, project_id: &str) -> Result<String> {
        Ok(self
            .load(project_id)?
            .iter()
            .map(Message::formatted)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

impl ConversationSink for JsonlConversationLog {
    fn append(&self, project_id: &str, message: Message) -> Result<()> {
        let path = self.path_for(project_id);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let mut line = serde_json::to_string(&message).context("serialize message")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(project_id, source = message.source.as_str(), "appended message");
        Ok(())
    }
}
