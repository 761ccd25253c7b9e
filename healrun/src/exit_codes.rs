//! Stable exit codes for healrun CLI commands.

/// Command succeeded; for `exec`/`step`, the session ran to its end.
pub const OK: i32 = 0;
/// Invalid layout, config or input, or a collaborator failed.
pub const INVALID: i32 = 1;
/// The session was interrupted.
pub const ABORTED: i32 = 2;
/// The model never produced a usable reply.
pub const MALFORMED: i32 = 3;
/// Another session is already active for the project.
pub const BUSY: i32 = 4;
