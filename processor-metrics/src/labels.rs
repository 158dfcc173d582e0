//! Metric names and tags

// ----------------
// | METRIC NAMES |
// ----------------

// Admission metrics

/// Metric describing the number of tasks accepted by a processor
pub const NUM_ACCEPTED_TASKS_METRIC: &str = "num_accepted_tasks";
/// Metric describing the number of tasks rejected by a processor
pub const NUM_REJECTED_TASKS_METRIC: &str = "num_rejected_tasks";

// Execution metrics

/// Metric describing the number of tasks that ran to completion
pub const NUM_COMPLETED_TASKS_METRIC: &str = "num_completed_tasks";
/// Metric describing the number of tasks that returned an error or panicked
pub const NUM_FAILED_TASKS_METRIC: &str = "num_failed_tasks";
/// Metric describing the number of tasks interrupted by the timeout watchdog
pub const NUM_TIMED_OUT_TASKS_METRIC: &str = "num_timed_out_tasks";
/// Metric describing the number of tasks executing at the moment
pub const NUM_EXECUTING_TASKS_METRIC: &str = "num_executing_tasks";

// Thread metrics

/// Metric describing the number of selector threads retired and replaced
/// after an interrupt
pub const NUM_REPLACED_SELECTORS_METRIC: &str = "num_replaced_selectors";

// ---------------
// | METRIC TAGS |
// ---------------

/// Metric tag for the name of the processor
pub const PROCESSOR_METRIC_TAG: &str = "processor";
