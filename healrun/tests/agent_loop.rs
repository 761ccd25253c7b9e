//! Step loop and direct answers, driven by scripted step results.

use std::fs;

use healrun::agent::{LoopOutcome, LoopStop};
use healrun::engine::{Engine, ExecutionSession};
use healrun::io::state::StateStore;
use healrun::test_support::{
    MemoryConversation, ScriptedLlm, ScriptedPatcher, ScriptedRunner, ok_output, test_config,
};
use serde_json::json;

const PROJECT: &str = "demo";

fn step(comment: &str, action: &str, next: &str) -> String {
    json!({
        "comment": comment,
        "action": action,
        "next": next,
        "actionParams": {},
        "fileName": "",
    })
    .to_string()
}

fn write_step(file_name: &str, content: &str, next: &str) -> String {
    json!({
        "comment": format!("Writing {file_name}"),
        "action": "write_file",
        "next": next,
        "actionParams": {"content": content},
        "fileName": file_name,
    })
    .to_string()
}

#[test]
fn proceed_continues_until_the_model_needs_the_user() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        step("Reading the project layout", "answer", "ProceedToNextStep"),
        step("Which port should the server use?", "answer", "NeedUserAnswer"),
    ]);
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(
        outcome,
        LoopOutcome {
            stop: LoopStop::NeedUserAnswer,
            steps: 2
        }
    );
    llm.assert_drained();
    let comments: Vec<String> = conversation
        .messages(PROJECT)
        .into_iter()
        .map(|message| message.message)
        .collect();
    assert_eq!(
        comments,
        vec![
            "Reading the project layout",
            "Which port should the server use?"
        ]
    );
    // The second prompt carries the first step's comment.
    assert!(llm.prompts()[1].contains("Devika: Reading the project layout"));

    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(latest.completed);
    assert!(!latest.agent_is_active);
}

#[test]
fn write_file_step_updates_the_workspace_and_code_context() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([write_step(
        "src/app.py",
        "print('ready')\n",
        "NeedUserAnswer",
    )]);
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, temp.path(), "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(outcome.stop, LoopStop::NeedUserAnswer);
    assert_eq!(
        fs::read_to_string(temp.path().join("src/app.py")).expect("read"),
        "print('ready')\n"
    );
    assert!(session.code_markdown.contains("File: `src/app.py`:"));
    assert_eq!(
        session.transcript.last().map(|message| message.message.as_str()),
        Some("Wrote `src/app.py`")
    );
}

#[test]
fn write_file_step_outside_the_workspace_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([write_step("../escape.txt", "x", "NeedUserAnswer")]);
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, temp.path().join("ws"), "linux");
    fs::create_dir_all(&session.workspace).expect("mkdir");
    assert!(engine.run_agent_loop(&mut session).is_err());
    assert!(!temp.path().join("escape.txt").exists());
}

#[test]
fn execute_step_runs_a_command_list() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        step("Running the tests", "execute", "ProceedToNextStep"),
        "<commands><command>cargo test</command></commands>".to_string(),
        step("Tests pass. Anything else?", "answer", "NeedUserAnswer"),
    ]);
    let runner = ScriptedRunner::new([Ok(ok_output("test result: ok\n"))]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(outcome.stop, LoopStop::NeedUserAnswer);
    assert_eq!(outcome.steps, 2);
    assert_eq!(runner.commands(), vec!["cargo test"]);
    assert_eq!(session.records.len(), 1);
    llm.assert_drained();
}

#[test]
fn execute_step_with_unusable_command_list_stops_the_loop() {
    let store = StateStore::in_memory();
    let config = test_config();
    let mut replies = vec![step("Running", "execute", "ProceedToNextStep")];
    replies.extend((0..config.max_reply_attempts).map(|_| "no commands today".to_string()));
    let llm = ScriptedLlm::new(replies);
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine = Engine::new(&llm, &runner, &patcher, &conversation, &store, config).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(
        outcome,
        LoopOutcome {
            stop: LoopStop::MalformedReplies,
            steps: 1
        }
    );
    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(!latest.completed);
}

#[test]
fn loop_stops_at_max_steps() {
    let store = StateStore::in_memory();
    let config = test_config();
    let max_steps = config.max_steps;
    let llm = ScriptedLlm::new((0..max_steps).map(|i| step(&format!("step {i}"), "answer", "ProceedToNextStep")));
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine = Engine::new(&llm, &runner, &patcher, &conversation, &store, config).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(
        outcome,
        LoopOutcome {
            stop: LoopStop::MaxSteps,
            steps: max_steps
        }
    );
    llm.assert_drained();
}

#[test]
fn interrupted_loop_reports_aborted() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        step("First", "answer", "ProceedToNextStep"),
        step("Second", "answer", "ProceedToNextStep"),
    ])
    .with_hook(|call| {
        if call == 2 {
            store.request_interrupt(PROJECT).expect("interrupt");
        }
    });
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let outcome = engine.run_agent_loop(&mut session).expect("loop");

    assert_eq!(
        outcome,
        LoopOutcome {
            stop: LoopStop::Aborted,
            steps: 1
        }
    );
    assert_eq!(session.transcript.len(), 1);
}

#[test]
fn answer_appends_the_reply_to_the_conversation() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        "not json at all",
        r#"```json
{"response": "It listens on port 8080.", "action": "answer"}
```"#,
    ]);
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux");
    let answer = engine.answer(&mut session).expect("answer");

    assert_eq!(answer.as_deref(), Some("It listens on port 8080."));
    assert_eq!(conversation.messages(PROJECT).len(), 1);
    assert!(conversation.messages(PROJECT)[0].from_devika);
}
