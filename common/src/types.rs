//! Defines common types that many crates can depend on
pub mod log_context;
pub mod task_key;
pub mod tasks;
