//! Self-healing command execution for coding agents.
//!
//! Project state lives under `.healrun/` in the workspace: engine config,
//! per-project conversation logs and the latest UI snapshots.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use healrun::agent::LoopStop;
use healrun::core::directive::{DirectiveKind, parse_directive};
use healrun::core::types::{Message, MessageSource};
use healrun::engine::{Engine, ExecutionSession, ExecutionStatus};
use healrun::error::EngineError;
use healrun::exit_codes;
use healrun::io::config::load_config;
use healrun::io::conversation::{ConversationSink, JsonlConversationLog};
use healrun::io::init::{HealrunPaths, InitOptions, init_layout};
use healrun::io::llm::CommandLlm;
use healrun::io::patcher::LlmPatcher;
use healrun::io::process::SystemRunner;
use healrun::io::state::StateStore;
use healrun::io::workspace::snapshot_code;
use healrun::logging;

#[derive(Parser)]
#[command(
    name = "healrun",
    version,
    about = "Run model-proposed commands and repair them when they fail"
)]
struct Cli {
    /// Project the session belongs to.
    #[arg(long, global = true)]
    project: Option<String>,

    /// Workspace directory commands run in.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Operating system named in prompts.
    #[arg(long, global = true, default_value = std::env::consts::OS)]
    os: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.healrun/` with a default config.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Ask for a command list and run it, repairing failures.
    Exec {
        /// User message appended to the conversation first.
        message: Option<String>,
    },
    /// Run the agent step loop until the model needs the user.
    Step {
        /// User message appended to the conversation first.
        message: Option<String>,
    },
    /// Ask the model to answer a user message.
    Ask { message: String },
    /// Parse a model reply from stdin and print the directive as JSON.
    Extract {
        #[arg(long, value_enum)]
        kind: KindArg,
    },
    /// Print the latest UI snapshot for the project.
    State,
    /// Ask the running session for the project to stop.
    Interrupt,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Answer,
    CommandList,
    Guidance,
    WriteFile,
    StepResult,
}

impl From<KindArg> for DirectiveKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Answer => DirectiveKind::Answer,
            KindArg::CommandList => DirectiveKind::CommandList,
            KindArg::Guidance => DirectiveKind::Guidance,
            KindArg::WriteFile => DirectiveKind::WriteFile,
            KindArg::StepResult => DirectiveKind::StepResult,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = match err.downcast_ref::<EngineError>() {
                Some(EngineError::SessionActive(_)) => exit_codes::BUSY,
                _ => exit_codes::INVALID,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = HealrunPaths::new(&cli.workspace);
    match &cli.command {
        Command::Init { force } => {
            init_layout(&cli.workspace, &InitOptions { force: *force })?;
            Ok(exit_codes::OK)
        }
        Command::Extract { kind } => cmd_extract(*kind),
        Command::State => cmd_state(&paths, project(&cli)?),
        Command::Interrupt => {
            let project = project(&cli)?;
            require_layout(&paths)?;
            StateStore::persistent(&paths.state_dir).request_interrupt(project)?;
            Ok(exit_codes::OK)
        }
        Command::Exec { message } => cmd_session(&cli, &paths, Mode::Exec, message.as_deref()),
        Command::Step { message } => cmd_session(&cli, &paths, Mode::Step, message.as_deref()),
        Command::Ask { message } => cmd_session(&cli, &paths, Mode::Ask, Some(message)),
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Exec,
    Step,
    Ask,
}

fn cmd_session(cli: &Cli, paths: &HealrunPaths, mode: Mode, message: Option<&str>) -> Result<i32> {
    let project = project(cli)?;
    require_layout(paths)?;
    let config = load_config(&paths.config_path)?;
    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("resolve workspace {}", cli.workspace.display()))?;

    let log = JsonlConversationLog::new(&paths.conversations_dir);
    if let Some(message) = message {
        log.append(project, Message::new(MessageSource::User, message))?;
    }
    let store = StateStore::persistent(&paths.state_dir);
    let llm = CommandLlm::new(&config.llm, workspace.clone(), config.output_limit_bytes);
    let patcher = LlmPatcher::new(&llm, config.prompt_budget_bytes, config.max_reply_attempts)?;

    let mut session = ExecutionSession::new(project, &workspace, &cli.os)
        .with_transcript(log.load(project)?)
        .with_code_markdown(snapshot_code(&workspace)?.to_markdown());
    let engine = Engine::new(&llm, SystemRunner, patcher, &log, &store, config)?;

    match mode {
        Mode::Exec => {
            let outcome = engine.execute(&mut session)?;
            for command in &outcome.gave_up {
                eprintln!("gave up on: {command}");
            }
            Ok(match outcome.status {
                ExecutionStatus::Completed => exit_codes::OK,
                ExecutionStatus::Aborted => exit_codes::ABORTED,
                ExecutionStatus::MalformedReplies => exit_codes::MALFORMED,
            })
        }
        Mode::Step => {
            let outcome = engine.run_agent_loop(&mut session)?;
            eprintln!("stopped after {} steps: {:?}", outcome.steps, outcome.stop);
            Ok(match outcome.stop {
                LoopStop::NeedUserAnswer | LoopStop::MaxSteps => exit_codes::OK,
                LoopStop::Aborted => exit_codes::ABORTED,
                LoopStop::MalformedReplies => exit_codes::MALFORMED,
            })
        }
        Mode::Ask => match engine.answer(&mut session)? {
            Some(answer) => {
                println!("{answer}");
                Ok(exit_codes::OK)
            }
            None => Ok(exit_codes::MALFORMED),
        },
    }
}

fn cmd_extract(kind: KindArg) -> Result<i32> {
    let mut reply = String::new();
    std::io::stdin()
        .read_to_string(&mut reply)
        .context("read reply from stdin")?;
    let directive = parse_directive(kind.into(), &reply)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&directive).context("serialize directive")?
    );
    Ok(exit_codes::OK)
}

fn cmd_state(paths: &HealrunPaths, project: &str) -> Result<i32> {
    require_layout(paths)?;
    let store = StateStore::persistent(&paths.state_dir);
    let snapshot = store
        .latest(project)?
        .with_context(|| format!("no state recorded for project {project:?}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("serialize snapshot")?
    );
    Ok(exit_codes::OK)
}

fn project(cli: &Cli) -> Result<&str> {
    match cli.project.as_deref().map(str::trim) {
        Some(project) if !project.is_empty() => Ok(project),
        _ => bail!("--project is required for this command"),
    }
}

fn require_layout(paths: &HealrunPaths) -> Result<()> {
    if !paths.healrun_dir.is_dir() {
        bail!(
            "{} not found: run `healrun init` first",
            paths.healrun_dir.display()
        );
    }
    Ok(())
}
