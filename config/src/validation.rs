//! Validation of a parsed node config

use crate::{NodeConfig, ProcessorKind};

/// Validate a parsed config
pub(crate) fn validate_config(config: &NodeConfig) -> Result<(), String> {
    let processor = &config.processor;
    if processor.name.is_empty() {
        return Err("processor name must not be empty".to_string());
    }
    if processor.num_threads == 0 {
        return Err("number of threads must be positive".to_string());
    }
    if processor.kind == ProcessorKind::Striped && processor.max_threads < processor.num_threads {
        return Err(format!(
            "max threads ({}) must not be less than the number of threads ({})",
            processor.max_threads, processor.num_threads
        ));
    }
    if config.workload.num_keys == 0 {
        return Err("the workload needs at least one key".to_string());
    }

    Ok(())
}
