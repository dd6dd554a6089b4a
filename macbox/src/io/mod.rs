//! Side-effecting modules: processes, git, files on disk.

pub mod config;
pub mod executor;
pub mod git;
pub mod paths;
pub mod process;
pub mod project;
pub mod registry;
pub mod results;
