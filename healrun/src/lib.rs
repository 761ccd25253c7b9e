//! Self-healing command execution for coding agents.
//!
//! A model proposes shell commands for a project workspace; the engine runs
//! them, and when one fails asks the model how to recover, either with a
//! replacement command or a code patch, under a bounded retry budget and a
//! cooperative interrupt. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (reply extraction, JSON repair,
//!   directive validation, rendering). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (processes, inference, prompts,
//!   conversation log, state store, workspace). Behind traits where tests
//!   need to substitute them.
//!
//! [`engine`] and [`agent`] coordinate the two.

pub mod agent;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
