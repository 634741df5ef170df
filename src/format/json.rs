//! JSON and JSON Lines output formatters

use serde_json::json;

use super::ReportFormatter;
use crate::sweep::Report;
use crate::ProbeError;

fn json_error(e: serde_json::Error) -> ProbeError {
    ProbeError::Generic(format!("JSON serialization error: {}", e))
}

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, report: &Report) -> Result<String, ProbeError> {
        serde_json::to_string_pretty(report).map_err(json_error)
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, report: &Report) -> Result<String, ProbeError> {
        let mut records = Vec::new();

        for sweep in &report.sweeps {
            records.push(json!({
                "type": "sweep",
                "line": sweep.line,
                "opcode": sweep.opcode,
                "encoding": sweep.encoding.to_string(),
                "bitmap": sweep.bitmap,
                "aborted": sweep.aborted,
            }));
        }

        for change in &report.discovery.opcode_changes {
            records.push(json!({
                "type": "opcode_change",
                "old": change.old,
                "new": change.new,
                "bit": change.bit,
            }));
        }

        for (line, bits) in &report.discovery.modifier_bit_positions {
            records.push(json!({
                "type": "modifier_bits",
                "line": line,
                "opcode": bits.opcode,
                "positions": bits.positions,
            }));
        }

        for table in &report.tables {
            for (value, rendering) in &table.entries {
                records.push(json!({
                    "type": "decode",
                    "line": table.line,
                    "opcode": table.opcode,
                    "positions": table.positions,
                    "assignment": table.assignment_bits(*value),
                    "rendering": rendering,
                }));
            }
        }

        for skipped in &report.skipped {
            records.push(json!({
                "type": "skipped",
                "line": skipped.line,
                "error": skipped.error.to_string(),
                "text": skipped.text,
            }));
        }

        records.push(json!({
            "type": "summary",
            "architecture": report.architecture.to_string(),
            "mode": report.mode,
            "opcode_bit_positions": report.discovery.opcode_bit_positions,
        }));

        let mut output = String::new();
        for record in &records {
            output.push_str(&serde_json::to_string(record).map_err(json_error)?);
            output.push('\n');
        }
        Ok(output)
    }
}
