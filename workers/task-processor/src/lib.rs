//! A per-key fair task processor
//!
//! Tasks submitted under the same [`TaskKey`] run one at a time in submission
//! order. Tasks under different keys run concurrently, and the threads visit
//! keys in round-robin order one task per visit so that no key can monopolize
//! the pool.
//!
//! Two execution strategies share one scheduling core:
//! - [`RoundRobinProcessor`] runs a self-serving selector loop on every
//!   thread of a fixed pool
//! - [`StripedProcessor`] runs a single queue consumer that dispatches into an
//!   elastic pool and may cap the number of pending tasks

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::needless_pass_by_ref_mut)]

pub mod error;
pub mod processor;
pub mod ring;
pub mod round_robin;
pub mod runner;
pub mod scheduler;
pub mod striped;
pub mod task_manager;
pub mod watchdog;

pub use common::types::{
    task_key::TaskKey,
    tasks::{BoxedTask, FnTask, ProcessorTask, TaskError, task_fn},
};
pub use error::ProcessorError;
pub use processor::{Processor, ProcessorServices, new_processor};
pub use round_robin::RoundRobinProcessor;
pub use striped::StripedProcessor;

#[cfg(test)]
pub(crate) mod test_helpers;
