//! Output format module implementation

mod json;
mod csv;

use std::fmt::{self, Write};
use std::str::FromStr;

use clap::ValueEnum;

use crate::sweep::{Mode, ModifierDecodeTable, Report};
use crate::ProbeError;

/// Supported output formats for probing reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    #[value(name = "jsonl")]
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for probing reports
pub trait ReportFormatter {
    /// Format a report
    fn format(&self, report: &Report) -> Result<String, ProbeError>;
}

/// Format reports in plain text
pub struct TextFormatter;

/// Format reports in JSON
pub struct JsonFormatter;

/// Format reports in JSON Lines
pub struct JsonLinesFormatter;

/// Format reports in CSV
pub struct CsvFormatter;

fn join_bits<'a>(bits: impl IntoIterator<Item = &'a u8>) -> String {
    bits.into_iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn space_label(table: &ModifierDecodeTable) -> String {
    match table.space() {
        Some(space) => space.to_string(),
        None => format!("2^{}", table.positions.len()),
    }
}

fn write_table(out: &mut String, table: &ModifierDecodeTable) -> fmt::Result {
    writeln!(
        out,
        "line {}: {} modifier bits: [{}]",
        table.line,
        table.opcode,
        join_bits(&table.positions)
    )?;
    if table.skipped {
        writeln!(out, "  enumeration skipped ({} assignments)", space_label(table))?;
        return Ok(());
    }
    let header: Vec<String> = table.positions.iter().rev().map(|p| p.to_string()).collect();
    writeln!(out, "  bits [{}]", header.join(" "))?;
    for (value, rendering) in &table.entries {
        writeln!(out, "  {}  {}", table.assignment_label(*value), rendering)?;
    }
    writeln!(
        out,
        "  {} of {} assignments decoded{}",
        table.entries.len(),
        space_label(table),
        if table.aborted { " (oracle failed, partial)" } else { "" }
    )
}

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &Report) -> Result<String, ProbeError> {
        let mut output = String::new();
        let fmt_err = |e: fmt::Error| ProbeError::Generic(format!("text formatting error: {}", e));

        writeln!(output, "Architecture: {} ({})", report.architecture, report.mode).map_err(fmt_err)?;
        writeln!(
            output,
            "Instructions: {} probed, {} skipped\n",
            report.sweeps.len(),
            report.skipped.len()
        )
        .map_err(fmt_err)?;

        for sweep in &report.sweeps {
            writeln!(output, "line {}: {}", sweep.line, sweep.text).map_err(fmt_err)?;
            writeln!(
                output,
                "  63 {} 0{}",
                sweep.bitmap,
                if sweep.aborted { "  (aborted)" } else { "" }
            )
            .map_err(fmt_err)?;
        }
        output.push('\n');

        match report.mode {
            Mode::Opcode => {
                writeln!(output, "Opcode changes:").map_err(fmt_err)?;
                for change in &report.discovery.opcode_changes {
                    writeln!(
                        output,
                        "  {} => {} when bit [{}] is flipped",
                        change.old, change.new, change.bit
                    )
                    .map_err(fmt_err)?;
                }
                writeln!(
                    output,
                    "Opcode bit positions: [{}]",
                    join_bits(&report.discovery.opcode_bit_positions)
                )
                .map_err(fmt_err)?;
            }
            Mode::Modifier => {
                for table in &report.tables {
                    write_table(&mut output, table).map_err(fmt_err)?;
                }
                for (line, bits) in &report.discovery.modifier_bit_positions {
                    if !report.tables.iter().any(|t| t.line == *line) {
                        writeln!(
                            output,
                            "line {}: {} modifier bits: [{}] (not enumerated)",
                            line,
                            bits.opcode,
                            join_bits(&bits.positions)
                        )
                        .map_err(fmt_err)?;
                    }
                }
            }
        }

        if !report.skipped.is_empty() {
            writeln!(output, "\nSkipped lines:").map_err(fmt_err)?;
            for skipped in &report.skipped {
                writeln!(output, "  line {}: {}: {}", skipped.line, skipped.error, skipped.text)
                    .map_err(fmt_err)?;
            }
        }

        Ok(output)
    }
}
