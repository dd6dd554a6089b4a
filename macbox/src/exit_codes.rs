//! Stable exit codes for macbox CLI commands.

/// Every flow run succeeded.
pub const OK: i32 = 0;
/// At least one flow failed, or the command hit a fatal error.
pub const FAILED: i32 = 1;
/// Invalid invocation: missing flow name or workspace list, bad parallelism.
pub const USAGE: i32 = 2;
