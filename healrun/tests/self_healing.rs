//! Engine-level tests for the run → fail → remediate cycle.
//!
//! Every collaborator is scripted, so each test pins down exactly which
//! commands ran and which prompts the model saw.

use std::fs;

use healrun::core::types::{CodeContext, ExitState, WriteFile};
use healrun::engine::{Engine, ExecutionSession, ExecutionStatus};
use healrun::error::EngineError;
use healrun::io::state::StateStore;
use healrun::io::workspace::snapshot_code;
use healrun::test_support::{
    MemoryConversation, ScriptedLlm, ScriptedPatcher, ScriptedRunner, failed_output,
    launch_error, ok_output, test_config,
};

const PROJECT: &str = "demo";
const COMMANDS: &str = "<commands><command>python main.py</command></commands>";

fn retry_with(command: &str) -> String {
    format!(
        "<root><action>command</action><command><![CDATA[{command}]]></command>\
         <response>Retrying with {command}</response></root>"
    )
}

fn patch_reply() -> String {
    "<root><action>patch</action><response>The import is wrong, patching it</response></root>"
        .to_string()
}

fn session() -> ExecutionSession {
    ExecutionSession::new(PROJECT, "/tmp/healrun-demo", "linux")
}

#[test]
fn failing_command_recovers_after_one_remediation() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([COMMANDS.to_string(), retry_with("python3 main.py")]);
    let runner = ScriptedRunner::new([
        Ok(failed_output("sh: python: not found", 127)),
        Ok(ok_output("hello\n")),
    ]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(outcome.gave_up.is_empty());
    assert_eq!(session.records.len(), 2);
    assert_eq!(session.retries, 1);
    assert_eq!(runner.commands(), vec!["python main.py", "python3 main.py"]);
    llm.assert_drained();
    runner.assert_drained();

    // The remediation prompt names the failed command and shows its output.
    let prompts = llm.prompts();
    assert!(prompts[1].contains("`python main.py`"));
    assert!(prompts[1].contains("sh: python: not found"));

    // Run entry, guidance response, run entry.
    let messages = conversation.messages(PROJECT);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].message, "Retrying with python3 main.py");
    assert_eq!(session.transcript, messages);

    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(latest.completed);
    assert!(!latest.agent_is_active);
    assert_eq!(latest.internal_monologue, "Execution complete");
    assert_eq!(
        latest.terminal_session.command.as_deref(),
        Some("python3 main.py")
    );
    assert!(!store.is_session_active(PROJECT).expect("active"));
}

#[test]
fn always_failing_command_runs_budget_plus_one_times() {
    let store = StateStore::in_memory();
    let config = test_config();
    let budget = config.retry_budget as usize;
    let mut replies = vec![COMMANDS.to_string()];
    replies.extend((0..budget).map(|_| retry_with("python main.py")));
    let llm = ScriptedLlm::new(replies);
    let runner = ScriptedRunner::new((0..=budget).map(|_| Ok(failed_output("boom", 1))));
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine = Engine::new(&llm, &runner, &patcher, &conversation, &store, config).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(runner.commands().len(), budget + 1);
    assert_eq!(session.records.len(), budget + 1);
    assert_eq!(session.retries as usize, budget);
    // Exhaustion is not fatal: the session completes and reports the command.
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.gave_up, vec!["python main.py".to_string()]);
    llm.assert_drained();
    runner.assert_drained();

    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert_eq!(latest.terminal_session.output.as_deref(), Some("boom"));
}

#[test]
fn budget_is_counted_per_command() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        "<commands><command>make build</command><command>make test</command></commands>"
            .to_string(),
        retry_with("make build"),
        retry_with("make test"),
        retry_with("make test"),
    ]);
    let runner = ScriptedRunner::new([
        Ok(failed_output("flaky", 1)),
        Ok(ok_output("")),
        Ok(failed_output("flaky", 1)),
        Ok(failed_output("flaky", 1)),
        Ok(ok_output("")),
    ]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(outcome.gave_up.is_empty());
    assert_eq!(session.retries, 3);
    runner.assert_drained();
}

#[test]
fn interrupt_after_a_failure_stops_before_asking_for_guidance() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([COMMANDS.to_string(), retry_with("python3 main.py")]);
    let runner = ScriptedRunner::new([Ok(failed_output("boom", 1))]).with_hook(|_| {
        store.request_interrupt(PROJECT).expect("interrupt");
    });
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Aborted);
    assert_eq!(llm.calls(), 1, "no guidance may be requested once interrupted");
    assert_eq!(session.records.len(), 1);
    assert_eq!(session.retries, 0);

    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(!latest.completed);
    assert!(!latest.agent_is_active);
    assert_eq!(latest.internal_monologue, "Interrupted by user");
}

#[test]
fn interrupt_while_the_model_replies_discards_the_reply() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([COMMANDS]).with_hook(|_| {
        store.request_interrupt(PROJECT).expect("interrupt");
    });
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Aborted);
    assert!(runner.commands().is_empty());
}

#[test]
fn new_session_clears_a_stale_interrupt() {
    let store = StateStore::in_memory();
    store.request_interrupt(PROJECT).expect("interrupt");
    let llm = ScriptedLlm::new([COMMANDS]);
    let runner = ScriptedRunner::new([Ok(ok_output("ok"))]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let outcome = engine.execute(&mut session()).expect("execute");
    assert_eq!(outcome.status, ExecutionStatus::Completed);
}

fn patched_main() -> CodeContext {
    CodeContext {
        files: vec![WriteFile {
            file_name: "main.py".to_string(),
            content: "from server import app\n".to_string(),
        }],
    }
}

#[test]
fn patch_guidance_persists_files_and_reruns_the_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("main.py"), "from srv import app\n").expect("write");
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([COMMANDS.to_string(), patch_reply()]);
    let runner = ScriptedRunner::new([
        Ok(failed_output("ImportError: cannot import name 'app'", 1)),
        Ok(ok_output("serving\n")),
    ]);
    let patched = patched_main();
    let patcher = ScriptedPatcher::new([patched.clone()]);
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, temp.path(), "linux")
        .with_code_markdown("File: `main.py`:\n```\nfrom srv import app\n```\n");
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(runner.commands(), vec!["python main.py", "python main.py"]);
    assert_eq!(patcher.persisted(), patched.files);
    assert_eq!(
        fs::read_to_string(temp.path().join("main.py")).expect("read"),
        "from server import app\n"
    );
    assert_eq!(session.code_markdown, patched.to_markdown());
    assert_eq!(session.retries, 1);

    let requests = patcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, vec!["python main.py".to_string()]);
    assert!(requests[0].1.contains("ImportError"));
    patcher.assert_drained();
}

#[test]
fn files_left_out_of_a_patch_stay_in_the_code_context() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("main.py"), "import util\n").expect("write");
    fs::write(temp.path().join("util.py"), "def helper():\n    return 1\n").expect("write");
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        COMMANDS.to_string(),
        patch_reply(),
        retry_with("python3 main.py"),
    ]);
    let runner = ScriptedRunner::new([
        Ok(failed_output("ImportError: cannot import name 'app'", 1)),
        Ok(failed_output("sh: python: not found", 127)),
        Ok(ok_output("serving\n")),
    ]);
    let patcher = ScriptedPatcher::new([patched_main()]);
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, temp.path(), "linux")
        .with_code_markdown(snapshot_code(temp.path()).expect("snapshot").to_markdown());
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(session.code_markdown.contains("File: `util.py`:"));
    assert!(session.code_markdown.contains("def helper():"));
    assert!(session.code_markdown.contains("from server import app"));

    // The remediation prompt after the patch still shows the untouched file.
    let prompts = llm.prompts();
    assert!(prompts[2].contains("File: `util.py`:"));
    assert!(prompts[2].contains("from server import app"));
}

#[test]
fn interrupt_while_patching_skips_the_rerun() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("main.py"), "from srv import app\n").expect("write");
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([COMMANDS.to_string(), patch_reply()]);
    let runner = ScriptedRunner::new([Ok(failed_output("ImportError", 1))]);
    let patcher = ScriptedPatcher::new([patched_main()]).with_hook(|_| {
        store.request_interrupt(PROJECT).expect("interrupt");
    });
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = ExecutionSession::new(PROJECT, temp.path(), "linux");
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Aborted);
    assert_eq!(runner.commands(), vec!["python main.py"]);
    assert!(patcher.persisted().is_empty());
    assert_eq!(
        fs::read_to_string(temp.path().join("main.py")).expect("read"),
        "from srv import app\n"
    );
    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert_eq!(latest.internal_monologue, "Interrupted by user");
}

#[test]
fn launch_failure_enters_remediation() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new([
        "<commands><command>pyhton main.py</command></commands>".to_string(),
        retry_with("python main.py"),
    ]);
    let runner = ScriptedRunner::new([Err(launch_error("pyhton")), Ok(ok_output(""))]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(matches!(
        session.records[0].exit,
        ExitState::LaunchFailed { .. }
    ));
    assert!(llm.prompts()[1].contains("[failed to launch: failed to launch `pyhton`"));
}

#[test]
fn malformed_replies_end_the_session_after_the_attempt_ceiling() {
    let store = StateStore::in_memory();
    let config = test_config();
    let attempts = config.max_reply_attempts as usize;
    let llm = ScriptedLlm::new((0..attempts).map(|_| "I would run the tests first."));
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine = Engine::new(&llm, &runner, &patcher, &conversation, &store, config).expect("engine");

    let mut session = session();
    let outcome = engine.execute(&mut session).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::MalformedReplies);
    assert_eq!(llm.calls(), attempts);
    assert!(session.records.is_empty());
    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(!latest.completed);
    assert!(!latest.agent_is_active);
}

#[test]
fn malformed_guidance_gives_up_on_the_command() {
    let store = StateStore::in_memory();
    let config = test_config();
    let mut replies = vec![COMMANDS.to_string()];
    replies.extend((0..config.max_reply_attempts).map(|_| "<root><action>shrug</action></root>".to_string()));
    let llm = ScriptedLlm::new(replies);
    let runner = ScriptedRunner::new([Ok(failed_output("boom", 1))]);
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine = Engine::new(&llm, &runner, &patcher, &conversation, &store, config).expect("engine");

    let outcome = engine.execute(&mut session()).expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.gave_up, vec!["python main.py".to_string()]);
    llm.assert_drained();
}

#[test]
fn second_session_on_a_busy_project_is_refused() {
    let store = StateStore::in_memory();
    let _held = store
        .begin_session(PROJECT)
        .expect("begin")
        .expect("slot is free");
    let llm = ScriptedLlm::new(Vec::<String>::new());
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let err = engine.execute(&mut session()).unwrap_err();
    assert!(matches!(err, EngineError::SessionActive(project) if project == PROJECT));
    assert_eq!(llm.calls(), 0);
}

#[test]
fn inference_failure_is_fatal_and_recorded() {
    let store = StateStore::in_memory();
    let llm = ScriptedLlm::new(Vec::<String>::new());
    let runner = ScriptedRunner::default();
    let patcher = ScriptedPatcher::default();
    let conversation = MemoryConversation::default();
    let engine =
        Engine::new(&llm, &runner, &patcher, &conversation, &store, test_config()).expect("engine");

    let err = engine.execute(&mut session()).unwrap_err();
    assert!(matches!(err, EngineError::Inference(_)));

    let latest = store.latest(PROJECT).expect("latest").expect("snapshot");
    assert!(latest.internal_monologue.starts_with("Execution failed:"));
    assert!(!latest.agent_is_active);
    assert!(!store.is_session_active(PROJECT).expect("active"));
}
