//! Configuration for a task processing node
//!
//! Options come from the command line and, optionally, a TOML config file
//! whose entries are converted into command line arguments. Arguments given
//! on the command line take precedence over those from the file.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::needless_pass_by_ref_mut)]

mod cli;
pub mod parsing;
mod validation;

pub use cli::*;
pub use parsing::{parse_command_line_args, parse_config_from_args, parse_config_from_file};
