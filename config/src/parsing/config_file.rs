//! Parsing logic for a separate node config file
//!
//! Each top level TOML key becomes a `--key` argument. Booleans become bare
//! flags when true, arrays repeat the flag once per element.

use std::fs;

use clap::Parser;
use toml::{Value, map::Map};
use util::err_str;

use crate::{Cli, NodeConfig, parsing::parse_config_from_args};

/// The CLI argument name for the config file
const CONFIG_FILE_ARG: &str = "--config-file";

/// Parse args from the config file named on the command line, if any
pub(crate) fn config_file_args(cli_args: &[String]) -> Result<Vec<String>, String> {
    let inline_prefix = format!("{CONFIG_FILE_ARG}=");
    for (i, arg) in cli_args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&inline_prefix) {
            return read_config_file(path);
        }

        // If we find "--config-file", the next argument is the file to read from
        if arg == CONFIG_FILE_ARG {
            let path = cli_args
                .get(i + 1)
                .ok_or_else(|| format!("{CONFIG_FILE_ARG} requires a path"))?;
            return read_config_file(path);
        }
    }

    Ok(vec![])
}

/// Parse a config entirely from a file
pub fn parse_config_from_file(path: &str) -> Result<NodeConfig, String> {
    let mut file_args = read_config_file(path)?;
    file_args.insert(0, "dummy-program-name".to_string());
    let cli = Cli::try_parse_from(file_args).map_err(err_str!(String::from))?;
    parse_config_from_args(cli)
}

/// Read a config file into CLI style args
fn read_config_file(path: &str) -> Result<Vec<String>, String> {
    let file_contents = fs::read_to_string(path)
        .map_err(|err| format!("error reading config file {path}: {err}"))?;
    let config_kv_pairs: Map<_, _> = toml::from_str(&file_contents).map_err(err_str!(String::from))?;

    let mut config_file_args: Vec<String> = Vec::with_capacity(config_kv_pairs.len());
    for (toml_key, value) in config_kv_pairs.iter() {
        // Format the TOML key into --key
        let cli_arg = format!("--{toml_key}");
        config_file_args.extend(parse_toml_value(&cli_arg, value)?);
    }

    Ok(config_file_args)
}

// ----------------
// | TOML Parsing |
// ----------------

/// Parse a toml value into a list of strings to append to the CLI args
fn parse_toml_value(cli_arg: &str, val: &Value) -> Result<Vec<String>, String> {
    Ok(match val {
        Value::Boolean(true) => vec![cli_arg.to_string()],
        Value::Boolean(false) => vec![],
        Value::Array(arr) => toml_array_to_args(cli_arg, arr)?,
        x => vec![cli_arg.to_string(), toml_value_to_string(x)?],
    })
}

/// Parse a toml array into "--arg val1 --arg val2 --arg val3"
///
/// We assume that the array has no nested arrays
fn toml_array_to_args(cli_arg: &str, arr: &[Value]) -> Result<Vec<String>, String> {
    let mut res: Vec<String> = Vec::with_capacity(arr.len() * 2);
    for val in arr.iter() {
        res.push(cli_arg.to_string());
        res.push(toml_value_to_string(val)?);
    }

    Ok(res)
}

/// Helper method to convert a toml value to a string
fn toml_value_to_string(val: &Value) -> Result<String, String> {
    Ok(match val {
        Value::String(val) => val.clone(),
        Value::Integer(val) => val.to_string(),
        Value::Float(val) => val.to_string(),
        Value::Boolean(val) => val.to_string(),
        _ => return Err(format!("unsupported config value: {val}")),
    })
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use clap::Parser;
    use tempfile::NamedTempFile;

    use super::{config_file_args, parse_config_from_file};
    use crate::{Cli, ProcessorKind, parse_config_from_args, parsing::merge_config_file_args};

    /// Write a config file with the given contents
    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// Tests that TOML entries are converted into CLI args
    #[test]
    fn test_toml_to_args() {
        let file = config_file(
            r#"
            processor = "striped"
            num-threads = 3
            json-logs = true
            enable-metrics = false
            "#,
        );
        let path = file.path().to_str().unwrap().to_string();

        let args = config_file_args(&["node".to_string(), "--config-file".to_string(), path])
            .unwrap();
        assert_eq!(args, vec!["--json-logs", "--num-threads", "3", "--processor", "striped"]);
    }

    /// Tests that a config may come entirely from a file
    #[test]
    fn test_parse_from_file() {
        let file = config_file(
            r#"
            processor = "striped"
            processor-name = "ingest"
            num-threads = 2
            max-threads = 8
            max-tasks = 64
            "#,
        );

        let config = parse_config_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.processor.kind, ProcessorKind::Striped);
        assert_eq!(config.processor.name, "ingest");
        assert_eq!(config.processor.max_threads, 8);
        assert_eq!(config.processor.max_tasks, Some(64));
    }

    /// Tests that command line args take precedence over the config file
    #[test]
    fn test_command_line_overrides_file() {
        let file = config_file("num-threads = 2\nnum-keys = 5\n");
        let path = file.path().to_str().unwrap();

        let args: Vec<String> = ["node", &format!("--config-file={path}"), "--num-threads", "6"]
            .into_iter()
            .map(String::from)
            .collect();
        let cli = Cli::try_parse_from(merge_config_file_args(args).unwrap()).unwrap();
        let config = parse_config_from_args(cli).unwrap();

        assert_eq!(config.processor.num_threads, 6);
        assert_eq!(config.workload.num_keys, 5);
    }

    /// Tests that missing files and dangling flags are reported
    #[test]
    fn test_config_file_errors() {
        assert!(parse_config_from_file("/nonexistent/config.toml").is_err());
        assert!(config_file_args(&["node".to_string(), "--config-file".to_string()]).is_err());
    }
}
