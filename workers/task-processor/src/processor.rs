//! The processor interface shared by both execution strategies

use std::time::Duration;

use common::types::{task_key::TaskKey, tasks::BoxedTask};
use config::{ProcessorConfig, ProcessorKind};
use util::concurrency::timer::Timer;

use crate::{
    error::ProcessorError,
    round_robin::RoundRobinProcessor,
    striped::{StripedOptions, StripedProcessor},
    watchdog::TaskWatchdog,
};

/// A per-key fair task processor
pub trait Processor: Send + Sync {
    /// The name of the processor
    fn name(&self) -> &str;

    /// Submit a task under a key
    ///
    /// Tasks under the same key run one at a time in submission order. A
    /// `None` key stands for the calling thread, serializing the tasks it
    /// submits. Returns `false` if the task was rejected, in which case it
    /// never runs
    fn execute(&self, key: Option<TaskKey>, task: BoxedTask) -> bool;

    /// Stop immediately
    ///
    /// Queued tasks are abandoned and threads running tasks are interrupted.
    /// Idempotent
    fn stop(&self);

    /// Stop accepting tasks, wait for the queued ones to be taken for
    /// execution, then stop
    ///
    /// Returns `Err` if the calling thread is interrupted while waiting
    fn stop_when_empty(&self) -> Result<(), ProcessorError>;

    /// The number of accepted tasks that have not started yet
    fn num_buffered_tasks(&self) -> usize;

    /// The number of tasks running at the moment
    fn num_executing_tasks(&self) -> usize;

    /// Wait for the processor's threads to exit after a stop
    ///
    /// Returns whether they exited within the timeout
    fn await_termination(&self, timeout: Duration) -> bool;
}

/// The collaborators a processor schedules timed work on
#[derive(Clone)]
pub struct ProcessorServices {
    /// Schedules delayed work such as selector replacement
    pub timer: Option<Timer>,
    /// Interrupts tasks that overrun their timeout
    pub watchdog: Option<TaskWatchdog>,
}

impl Default for ProcessorServices {
    fn default() -> Self {
        Self { timer: Timer::global(), watchdog: TaskWatchdog::global() }
    }
}

/// Build the processor described by the config, using the global services
pub fn new_processor(config: &ProcessorConfig) -> Result<Box<dyn Processor>, ProcessorError> {
    new_processor_with_services(config, ProcessorServices::default())
}

/// Build the processor described by the config
pub fn new_processor_with_services(
    config: &ProcessorConfig,
    services: ProcessorServices,
) -> Result<Box<dyn Processor>, ProcessorError> {
    Ok(match config.kind {
        ProcessorKind::RoundRobin => Box::new(RoundRobinProcessor::with_options(
            &config.name,
            config.num_threads,
            config.selector_restart_delay,
            services,
        )?),
        ProcessorKind::Striped => {
            let options = StripedOptions {
                core_threads: config.num_threads,
                max_threads: config.max_threads,
                max_tasks: config.max_tasks,
                keep_alive: config.keep_alive,
                consumer_wait: config.consumer_wait,
            };
            Box::new(StripedProcessor::with_options(&config.name, options, services)?)
        },
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use config::{ProcessorConfig, ProcessorKind};
    use crossbeam::channel::unbounded;

    use super::new_processor;
    use crate::{ProcessorError, TaskKey, task_fn};

    /// Tests that both processor kinds build from a config and run a task
    #[test]
    fn test_new_processor() {
        for kind in [ProcessorKind::RoundRobin, ProcessorKind::Striped] {
            let config = ProcessorConfig { kind, num_threads: 2, ..Default::default() };
            let processor = new_processor(&config).unwrap();
            assert_eq!(processor.name(), config.name);

            let (send, recv) = unbounded();
            assert!(processor.execute(Some(TaskKey::from("k")), task_fn(move || {
                send.send(()).unwrap();
            })));
            recv.recv_timeout(Duration::from_secs(5)).unwrap();

            processor.stop_when_empty().unwrap();
            assert!(processor.await_termination(Duration::from_secs(5)));
        }
    }

    /// Tests that an invalid config is refused
    #[test]
    fn test_invalid_config() {
        let config = ProcessorConfig { num_threads: 0, ..Default::default() };
        assert!(matches!(new_processor(&config), Err(ProcessorError::InvalidConfig(_))));
    }
}
