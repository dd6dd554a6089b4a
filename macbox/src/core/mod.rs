//! Pure logic for flow runs: data model, interpolation, halt/continue policy.
//!
//! Nothing in `core` touches the filesystem or spawns processes.

pub mod flow_state;
pub mod interpolate;
pub mod types;
