//! Helpers for recording processor metrics
//!
//! Every counter is tagged with the name of the processor that emitted it.
//! Without a global recorder installed these are no-ops.

use crate::labels::{
    NUM_ACCEPTED_TASKS_METRIC, NUM_COMPLETED_TASKS_METRIC, NUM_FAILED_TASKS_METRIC,
    NUM_REJECTED_TASKS_METRIC, NUM_REPLACED_SELECTORS_METRIC, NUM_TIMED_OUT_TASKS_METRIC,
    PROCESSOR_METRIC_TAG,
};

/// Increment a counter tagged with the processor name
#[inline]
fn incr_processor_counter(metric: &'static str, processor: &str) {
    metrics::counter!(metric, PROCESSOR_METRIC_TAG => processor.to_string()).increment(1);
}

/// Increment the number of accepted tasks
#[inline]
pub fn incr_accepted_tasks(processor: &str) {
    incr_processor_counter(NUM_ACCEPTED_TASKS_METRIC, processor);
}

/// Increment the number of rejected tasks
#[inline]
pub fn incr_rejected_tasks(processor: &str) {
    incr_processor_counter(NUM_REJECTED_TASKS_METRIC, processor);
}

/// Increment the number of completed tasks
#[inline]
pub fn incr_completed_tasks(processor: &str) {
    incr_processor_counter(NUM_COMPLETED_TASKS_METRIC, processor);
}

/// Increment the number of failed tasks
#[inline]
pub fn incr_failed_tasks(processor: &str) {
    incr_processor_counter(NUM_FAILED_TASKS_METRIC, processor);
}

/// Increment the number of tasks interrupted by the watchdog
#[inline]
pub fn incr_timed_out_tasks(processor: &str) {
    incr_processor_counter(NUM_TIMED_OUT_TASKS_METRIC, processor);
}

/// Increment the number of replaced selector threads
#[inline]
pub fn incr_replaced_selectors(processor: &str) {
    incr_processor_counter(NUM_REPLACED_SELECTORS_METRIC, processor);
}
