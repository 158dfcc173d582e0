//! The entrypoint to the processing node, builds a task processor from the
//! config and drives a synthetic keyed workload through it
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod workload;

use std::{process::ExitCode, time::Duration};

use config::parse_command_line_args;
use task_processor::new_processor;
use tracing::{error, info};

use crate::workload::Workload;

/// How long to wait for the processor's threads to exit after it stops
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(30);

/// The entrypoint to the node's execution
///
/// The node:
///     1. Parses its config and sets up logging and metrics
///     2. Builds the configured processor
///     3. Submits the workload, one stream of tasks per key
///     4. Drains the processor and reports the outcome
fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("processing node failed: {e}");
            eprintln!("processing node failed: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Run the node to completion
fn run() -> Result<(), String> {
    let args = parse_command_line_args()?;
    args.configure_telemetry()?;
    info!(
        "running {:?} processor {} with {} threads",
        args.processor.kind, args.processor.name, args.processor.num_threads
    );

    let processor = new_processor(&args.processor).map_err(|e| e.to_string())?;
    let workload = Workload::new(args.workload.clone());
    workload.submit(processor.as_ref());

    processor.stop_when_empty().map_err(|e| e.to_string())?;
    if !processor.await_termination(TERMINATION_TIMEOUT) {
        return Err(format!("processor did not terminate within {TERMINATION_TIMEOUT:?}"));
    }

    let report = workload.report();
    info!("{report}");
    if report.out_of_order > 0 {
        return Err(format!("{} tasks ran out of order", report.out_of_order));
    }

    Ok(())
}
