//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They turn model replies into
//! typed directives and execution records into text, and are tested in
//! isolation.

pub mod argv;
pub mod directive;
pub mod extract;
pub mod json_repair;
pub mod markup;
pub mod render;
pub mod types;
