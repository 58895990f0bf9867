//! Semantic validation for parsed job configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{DataSourceSettings, IngestionConfig, JobConfig};

fn validate_ingestion(config: &IngestionConfig, errors: &mut Vec<String>) {
    if config.worker_threads == 0 {
        errors.push("ingestion.worker_threads must be at least 1".to_string());
    }
    if config.payload_size_bytes_threshold == 0 {
        errors.push("ingestion.payload_size_bytes_threshold must be at least 1".to_string());
    }
    if config.payloads_queue_size == 0 {
        errors.push("ingestion.payloads_queue_size must be at least 1".to_string());
    }
    if config.objects_queue_size == 0 {
        errors.push("ingestion.objects_queue_size must be at least 1".to_string());
    }
    let timeout = config.payload_aggregator_timeout_seconds;
    if !timeout.is_finite() || timeout <= 0.0 {
        errors.push(format!(
            "ingestion.payload_aggregator_timeout_seconds must be a positive number, got {timeout}"
        ));
    }
}

fn validate_data_source(settings: &DataSourceSettings, errors: &mut Vec<String>) {
    if settings.max_parallel_streams == 0 {
        errors.push("data_source.max_parallel_streams must be at least 1".to_string());
    }
}

fn validate_sequence(name: &str, methods: &[String], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (i, method) in methods.iter().enumerate() {
        if method.trim().is_empty() {
            errors.push(format!("{name}[{i}] has an empty method name"));
        } else if !seen.insert(method.as_str()) {
            errors.push(format!("{name} lists method '{method}' more than once"));
        }
    }
}

/// Validate a parsed job configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// Method names are only checked for shape here; whether they are
/// registered is checked when the router is built.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the job config.
pub fn validate_job_config(config: &JobConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.job_name.trim().is_empty() {
        errors.push("job_name must not be empty".to_string());
    }
    if config.op_id.trim().is_empty() {
        errors.push("op_id must not be empty".to_string());
    }
    if let Some(method) = &config.method_default {
        if method.trim().is_empty() {
            errors.push("method_default must not be blank when set".to_string());
        }
    }

    validate_sequence(
        "payload_preprocess_sequence",
        &config.payload_preprocess_sequence,
        &mut errors,
    );
    validate_sequence(
        "payload_postprocess_sequence",
        &config.payload_postprocess_sequence,
        &mut errors,
    );
    validate_ingestion(&config.ingestion, &mut errors);
    validate_data_source(&config.data_source, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Job validation failed:\n  - {}", errors.join("\n  - "));
    }
}
