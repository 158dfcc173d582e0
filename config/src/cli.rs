//! The node CLI and config definitions

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use util::telemetry::{LevelFilter, configure_telemetry};

use crate::parsing::parse_config_from_args;

/// The default name of a processor
pub const DEFAULT_PROCESSOR_NAME: &str = "task-processor";
/// The default number of processor threads
pub const DEFAULT_NUM_THREADS: usize = 4;
/// The default keep-alive of elastic pool threads, in milliseconds
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 60_000;
/// The default time the queue consumer waits for work, in milliseconds
pub const DEFAULT_CONSUMER_WAIT_MS: u64 = 60_000;
/// The default delay before an interrupted selector is replaced, in
/// milliseconds
pub const DEFAULT_SELECTOR_RESTART_DELAY_MS: u64 = 250;

// -------
// | CLI |
// -------

/// Defines the node command line interface
#[derive(Debug, Parser, Serialize, Deserialize)]
#[clap(author, about, long_about = None, args_override_self = true)]
#[rustfmt::skip]
pub struct Cli {
    // ---------------
    // | Config File |
    // ---------------
    /// A config file to read from
    #[clap(long, value_parser)]
    pub config_file: Option<String>,

    // ---------------------
    // | Processor Configs |
    // ---------------------
    /// The name of the processor, used to name its threads and tag its logs and metrics
    #[clap(long, value_parser, default_value = DEFAULT_PROCESSOR_NAME, env = "PROCESSOR_NAME")]
    pub processor_name: String,
    /// The execution strategy of the processor
    #[clap(long, value_enum, default_value_t = ProcessorKind::RoundRobin)]
    pub processor: ProcessorKind,
    /// The number of threads; the core pool size of a striped processor
    #[clap(long, value_parser, default_value_t = DEFAULT_NUM_THREADS, env = "NUM_THREADS")]
    pub num_threads: usize,
    /// The maximum pool size of a striped processor
    ///
    /// Defaults to the number of threads
    #[clap(long, value_parser)]
    pub max_threads: Option<usize>,
    /// The maximum number of tasks a striped processor holds before rejecting new ones
    ///
    /// Zero or a negative value disables the limit
    #[clap(long, value_parser, default_value = "0", allow_negative_numbers = true)]
    pub max_tasks: i64,
    /// How long, in milliseconds, a striped pool thread above the core size may idle
    #[clap(long, value_parser, default_value_t = DEFAULT_KEEP_ALIVE_MS)]
    pub keep_alive_ms: u64,
    /// How long, in milliseconds, the striped queue consumer waits for work before retiring
    #[clap(long, value_parser, default_value_t = DEFAULT_CONSUMER_WAIT_MS)]
    pub consumer_wait_ms: u64,
    /// The delay, in milliseconds, before an interrupted selector thread is replaced
    #[clap(long, value_parser, default_value_t = DEFAULT_SELECTOR_RESTART_DELAY_MS)]
    pub selector_restart_delay_ms: u64,

    // --------------------
    // | Workload Configs |
    // --------------------
    /// The number of distinct keys in the synthetic workload
    #[clap(long, value_parser, default_value = "16")]
    pub num_keys: usize,
    /// The number of tasks submitted under each key
    #[clap(long, value_parser, default_value = "8")]
    pub tasks_per_key: usize,
    /// How long, in milliseconds, each synthetic task works for
    #[clap(long, value_parser, default_value = "10")]
    pub task_duration_ms: u64,
    /// The timeout, in milliseconds, after which a task is interrupted; zero disables it
    #[clap(long, value_parser, default_value = "0")]
    pub task_timeout_ms: u64,

    // -------------
    // | Telemetry |
    // -------------
    /// Whether or not to emit logs as JSON
    #[clap(long = "json-logs", value_parser)]
    pub json_logs: bool,
    /// The default log level, overridden by `RUST_LOG`
    #[clap(long, value_parser, default_value = "info")]
    pub log_level: String,
    /// Whether or not to enable metrics collection
    #[clap(long = "enable-metrics", value_parser)]
    pub metrics_enabled: bool,
    /// The StatsD recorder host to send metrics to
    #[clap(long, value_parser, default_value = "127.0.0.1")]
    pub statsd_host: String,
    /// The StatsD recorder port to send metrics to
    #[clap(long, value_parser, default_value = "8125")]
    pub statsd_port: u16,
}

/// The execution strategy of a processor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorKind {
    /// A fixed pool of threads serving the ring themselves
    #[default]
    RoundRobin,
    /// A queue consumer dispatching into an elastic pool
    Striped,
}

// ----------
// | Config |
// ----------

/// The validated configuration of a processor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// The name of the processor
    pub name: String,
    /// The execution strategy
    pub kind: ProcessorKind,
    /// The number of threads; the core pool size of a striped processor
    pub num_threads: usize,
    /// The maximum pool size of a striped processor
    pub max_threads: usize,
    /// The maximum number of pending tasks of a striped processor
    pub max_tasks: Option<usize>,
    /// How long a striped pool thread above the core size may idle
    pub keep_alive: Duration,
    /// How long the striped queue consumer waits for work before retiring
    pub consumer_wait: Duration,
    /// The delay before an interrupted selector is replaced
    pub selector_restart_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROCESSOR_NAME.to_string(),
            kind: ProcessorKind::default(),
            num_threads: DEFAULT_NUM_THREADS,
            max_threads: DEFAULT_NUM_THREADS,
            max_tasks: None,
            keep_alive: Duration::from_millis(DEFAULT_KEEP_ALIVE_MS),
            consumer_wait: Duration::from_millis(DEFAULT_CONSUMER_WAIT_MS),
            selector_restart_delay: Duration::from_millis(DEFAULT_SELECTOR_RESTART_DELAY_MS),
        }
    }
}

/// The synthetic workload a node submits to its processor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// The number of distinct keys
    pub num_keys: usize,
    /// The number of tasks submitted under each key
    pub tasks_per_key: usize,
    /// How long each task works for
    pub task_duration: Duration,
    /// The timeout after which a task is interrupted
    pub task_timeout: Option<Duration>,
}

/// Defines the system config for a node
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// The processor to run
    pub processor: ProcessorConfig,
    /// The workload to submit
    pub workload: WorkloadConfig,

    // -------------
    // | Telemetry |
    // -------------
    /// Whether or not to emit logs as JSON
    pub json_logs: bool,
    /// The default log level
    pub log_level: LevelFilter,
    /// Whether or not to enable metrics collection
    pub metrics_enabled: bool,
    /// The StatsD recorder host to send metrics to
    pub statsd_host: String,
    /// The StatsD recorder port to send metrics to
    pub statsd_port: u16,
}

impl NodeConfig {
    /// Configure the telemetry layers from the node config
    pub fn configure_telemetry(&self) -> Result<(), String> {
        let statsd = self.metrics_enabled.then_some((self.statsd_host.as_str(), self.statsd_port));
        configure_telemetry(self.json_logs, self.log_level, statsd).map_err(|e| e.to_string())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        // Parse an empty set of command line args and convert this to a config
        let cli = Cli::parse_from(["node"]);
        parse_config_from_args(cli).expect("default config does not parse")
    }
}

// ---------
// | Tests |
// ---------
