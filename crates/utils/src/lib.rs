//! Shared plumbing for subsystems that drive external tools.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod command;
pub mod fs;

pub use command::{run_command, run_command_with_stdin, CommandError, CommandOutput};
