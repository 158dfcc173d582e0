//! Parsing logic for the node config

use std::{env, str::FromStr, time::Duration};

use clap::Parser;
use util::telemetry::LevelFilter;

use crate::{
    Cli, NodeConfig, ProcessorConfig, WorkloadConfig, parsing::config_file::config_file_args,
    validation::validate_config,
};

pub mod config_file;

pub use config_file::parse_config_from_file;

/// Parses command line args into the node config
///
/// We allow for configurations to come from both a config file and overrides
/// on the command line directly. To support this, we first read configuration
/// options from the config file, prepend them to the cli args string, and parse
/// with `args_override_self` so that cli args (which come after config file
/// args) take precedence.
pub fn parse_command_line_args() -> Result<NodeConfig, String> {
    let command_line_args = env::args_os()
        .map(|arg| arg.into_string().map_err(|_| "command line argument is not UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    let cli = Cli::parse_from(merge_config_file_args(command_line_args)?);
    parse_config_from_args(cli)
}

/// Place the config file args between the executable name and the command
/// line args
pub(crate) fn merge_config_file_args(
    mut command_line_args: Vec<String>,
) -> Result<Vec<String>, String> {
    let config_file_args = config_file_args(&command_line_args)?;
    if command_line_args.is_empty() {
        return Ok(config_file_args);
    }

    let mut full_args = vec![command_line_args.remove(0)];
    full_args.extend(config_file_args);
    full_args.extend(command_line_args);
    Ok(full_args)
}

/// Parse the config from a set of command line arguments
///
/// Separating out this functionality allows us to easily inject custom args
/// apart from what is specified on the command line
pub fn parse_config_from_args(cli_args: Cli) -> Result<NodeConfig, String> {
    let max_tasks = usize::try_from(cli_args.max_tasks).ok().filter(|max| *max > 0);
    let processor = ProcessorConfig {
        name: cli_args.processor_name,
        kind: cli_args.processor,
        num_threads: cli_args.num_threads,
        max_threads: cli_args.max_threads.unwrap_or(cli_args.num_threads),
        max_tasks,
        keep_alive: Duration::from_millis(cli_args.keep_alive_ms),
        consumer_wait: Duration::from_millis(cli_args.consumer_wait_ms),
        selector_restart_delay: Duration::from_millis(cli_args.selector_restart_delay_ms),
    };

    let task_timeout =
        Some(Duration::from_millis(cli_args.task_timeout_ms)).filter(|timeout| !timeout.is_zero());
    let workload = WorkloadConfig {
        num_keys: cli_args.num_keys,
        tasks_per_key: cli_args.tasks_per_key,
        task_duration: Duration::from_millis(cli_args.task_duration_ms),
        task_timeout,
    };

    let log_level = LevelFilter::from_str(&cli_args.log_level)
        .map_err(|e| format!("invalid log level {}: {e}", cli_args.log_level))?;

    let config = NodeConfig {
        processor,
        workload,
        json_logs: cli_args.json_logs,
        log_level,
        metrics_enabled: cli_args.metrics_enabled,
        statsd_host: cli_args.statsd_host,
        statsd_port: cli_args.statsd_port,
    };

    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use std::{iter, time::Duration};

    use clap::Parser;

    use super::parse_config_from_args;
    use crate::{Cli, NodeConfig, ProcessorKind};

    /// Parse a config from the given arguments
    fn parse(args: &[&str]) -> Result<NodeConfig, String> {
        let full_args = iter::once("node").chain(args.iter().copied());
        let cli = Cli::try_parse_from(full_args).map_err(|e| e.to_string())?;
        parse_config_from_args(cli)
    }

    /// Tests that a striped processor is configured from flags
    #[test]
    fn test_striped_flags() {
        let config = parse(&[
            "--processor",
            "striped",
            "--num-threads",
            "2",
            "--max-threads",
            "6",
            "--max-tasks",
            "100",
            "--task-timeout-ms",
            "500",
        ])
        .unwrap();

        assert_eq!(config.processor.kind, ProcessorKind::Striped);
        assert_eq!(config.processor.num_threads, 2);
        assert_eq!(config.processor.max_threads, 6);
        assert_eq!(config.processor.max_tasks, Some(100));
        assert_eq!(config.workload.task_timeout, Some(Duration::from_millis(500)));
    }

    /// Tests that a non-positive task limit disables the limit
    #[test]
    fn test_unlimited_tasks() {
        let config = parse(&["--max-tasks", "-1"]).unwrap();
        assert_eq!(config.processor.max_tasks, None);
        let config = parse(&["--max-tasks", "0"]).unwrap();
        assert_eq!(config.processor.max_tasks, None);
    }

    /// Tests that a later occurrence of a flag overrides an earlier one
    #[test]
    fn test_later_flag_wins() {
        let config = parse(&["--num-threads", "2", "--num-threads", "3"]).unwrap();
        assert_eq!(config.processor.num_threads, 3);
    }

    /// Tests that invalid values are refused
    #[test]
    fn test_invalid_values() {
        assert!(parse(&["--num-threads", "0"]).is_err());
        let inverted = ["--processor", "striped", "--num-threads", "4", "--max-threads", "2"];
        assert!(parse(&inverted).is_err());
        assert!(parse(&["--log-level", "loud"]).is_err());
        assert!(parse(&["--processor", "fifo"]).is_err());
    }
}
