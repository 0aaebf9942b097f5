//! Output formatting for CLI commands
//!
//! Health data can be printed as a table for operators or as JSON/YAML for
//! tooling.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::health::HealthRecord;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
}

impl OutputFormat {
    /// Parse output format from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            "table" => Ok(OutputFormat::Table),
            _ => anyhow::bail!("Unsupported output format: '{}'. Use 'json', 'yaml', or 'table'.", s),
        }
    }
}

/// Print data as JSON or YAML
pub fn print_structured<T: Serialize>(data: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(data),
        OutputFormat::Yaml => print_yaml(data),
        OutputFormat::Table => anyhow::bail!("Table format is only available for 'check'"),
    }
}

pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{}", yaml);
    Ok(())
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn print_table_header(columns: &[(&str, usize)]) {
    println!();
    let mut header = String::new();
    for (name, width) in columns {
        header.push_str(&format!("{:<width$} ", name, width = width));
    }
    println!("{}", header.trim());

    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    println!("{}", "-".repeat(total_width.saturating_sub(1)));
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One table row per descriptor, followed by its drift and last error.
pub fn print_health_table(records: &[HealthRecord]) {
    print_table_header(&[
        ("Name", 28),
        ("Kind", 17),
        ("Status", 8),
        ("Version", 8),
        ("Next rotation", 21),
        ("Failures", 8),
    ]);

    for record in records {
        let (version, next) = match &record.metadata {
            Some(meta) => (meta.current_version.to_string(), timestamp(meta.next_rotation_at)),
            None => ("-".to_string(), "never rotated".to_string()),
        };
        println!(
            "{:<28} {:<17} {:<8} {:<8} {:<21} {}",
            truncate(&record.name, 28),
            record.kind.as_str(),
            record.status.as_str(),
            version,
            next,
            record.consecutive_failures
        );
        if let Some(pending) = record.pending {
            println!("    pending: {:?}", pending);
        }
        for drift in &record.drift {
            println!("    drift: {}", drift);
        }
        if let Some(error) = &record.last_error {
            println!("    last error: {}", truncate(error, 120));
        }
    }
    println!();
}
