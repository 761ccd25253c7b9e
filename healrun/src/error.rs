//! Fatal engine errors.
//!
//! Malformed replies, failing commands and interruptions are outcomes, not
//! errors. Only collaborator failures surface here.

use thiserror::Error;

use crate::io::process::RunError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("patch failed: {0:#}")]
    Patch(anyhow::Error),
    #[error("command runner failed: {0}")]
    Process(RunError),
    #[error("project {0:?} already has an active session")]
    SessionActive(String),
    #[error("recording state failed: {0:#}")]
    Sink(anyhow::Error),
    #[error("workspace update failed: {0:#}")]
    Workspace(anyhow::Error),
}
