//! Text renderings of execution records and code context.

use super::types::{ExecutionRecord, ExitState, WriteFile};

/// Stdout with stderr appended. Both the model and the terminal pane see this.
pub fn combined_output(stdout: &str, stderr: &str) -> String {
    let mut out = stdout.to_string();
    if !stderr.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(stderr);
    }
    out
}

/// Short note for exits that are not a plain exit code.
pub fn exit_note(exit: &ExitState) -> Option<String> {
    match exit {
        ExitState::Exited { code: Some(_) } => None,
        ExitState::Exited { code: None } => Some("[terminated by signal]".to_string()),
        ExitState::TimedOut { after_secs } => Some(format!("[timed out after {after_secs}s]")),
        ExitState::LaunchFailed { reason } => Some(format!("[failed to launch: {reason}]")),
    }
}

/// Output shown in the terminal pane for one run.
pub fn terminal_output(record: &ExecutionRecord) -> String {
    let mut out = record.combined_output();
    if let Some(note) = exit_note(&record.exit) {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&note);
    }
    out
}

/// Conversation entry appended after each run.
pub fn conversation_entry(record: &ExecutionRecord) -> String {
    let mut entry = format!("Command output:\n```\n{}\n```\n", record.stdout.trim_end());
    if !record.stderr.is_empty() {
        entry.push_str(&format!("\n\nError:\n```\n{}\n```", record.stderr.trim_end()));
    }
    if let Some(note) = exit_note(&record.exit) {
        entry.push_str(&format!("\n{note}"));
    }
    entry
}

/// Markdown listing of files: a `File:` header and a fenced block per file.
pub fn code_markdown(files: &[WriteFile]) -> String {
    files
        .iter()
        .map(|file| {
            format!(
                "File: `{}`:\n```\n{}\n```\n",
                file.file_name,
                file.content.trim_end_matches('\n')
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stdout: &str, stderr: &str, exit: ExitState) -> ExecutionRecord {
        ExecutionRecord {
            command: "make".to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit,
            timestamp: String::new(),
        }
    }

    #[test]
    fn stderr_is_appended_after_stdout() {
        assert_eq!(combined_output("built", "warning: x"), "built\nwarning: x");
        assert_eq!(combined_output("built\n", ""), "built\n");
        assert_eq!(combined_output("", "boom"), "boom");
    }

    #[test]
    fn conversation_entry_includes_error_block_only_with_stderr() {
        let ok = record("done\n", "", ExitState::Exited { code: Some(0) });
        assert_eq!(conversation_entry(&ok), "Command output:\n```\ndone\n```\n");

        let failed = record("", "No module named flask", ExitState::Exited { code: Some(1) });
        let entry = conversation_entry(&failed);
        assert!(entry.ends_with("Error:\n```\nNo module named flask\n```"));
    }

    #[test]
    fn terminal_output_notes_timeouts_and_launch_failures() {
        let timed_out = record("partial", "", ExitState::TimedOut { after_secs: 5 });
        assert_eq!(terminal_output(&timed_out), "partial\n[timed out after 5s]");

        let missing = record(
            "",
            "",
            ExitState::LaunchFailed {
                reason: "No such file or directory".to_string(),
            },
        );
        assert_eq!(
            terminal_output(&missing),
            "[failed to launch: No such file or directory]"
        );
    }

    #[test]
    fn code_markdown_lists_each_file() {
        let files = vec![
            WriteFile {
                file_name: "app.py".to_string(),
                content: "print(1)\n".to_string(),
            },
            WriteFile {
                file_name: "README.md".to_string(),
                content: "hi".to_string(),
            },
        ];
        assert_eq!(
            code_markdown(&files),
            "File: `app.py`:\n```\nprint(1)\n```\n\nFile: `README.md`:\n```\nhi\n```\n"
        );
    }
}
