//! Flow execution and swarm orchestration for macbox workspaces.
//!
//! A flow is an ordered list of declarative steps (`shell`, `git.status`,
//! `git.diff`) run in one workspace. Steps can read earlier steps' results
//! through `${steps.<id>.<path>}` references in their arguments. A swarm runs
//! one flow across many workspaces on a bounded pool of worker threads.
//!
//! - **[`core`]**: Pure data and policy (records, interpolation, halt/continue).
//! - **[`io`]**: Processes, git, config files, registries and result files.
//!
//! [`flow`], [`swarm`] and [`provision`] combine the two and back the CLI.

pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod flow;
pub mod io;
pub mod logging;
pub mod provision;
pub mod swarm;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
