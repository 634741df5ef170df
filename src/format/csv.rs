//! CSV output formatter

use super::ReportFormatter;
use crate::sweep::Report;
use crate::ProbeError;

const HEADER: [&str; 8] = [
    "record", "line", "opcode", "bit", "old", "new", "assignment", "rendering",
];

type Writer = ::csv::Writer<Vec<u8>>;

fn csv_error(e: impl std::fmt::Display) -> ProbeError {
    ProbeError::Generic(format!("CSV serialization error: {}", e))
}

fn row(writer: &mut Writer, fields: [&str; 8]) -> Result<(), ProbeError> {
    writer.write_record(fields).map_err(csv_error)
}

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, report: &Report) -> Result<String, ProbeError> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER).map_err(csv_error)?;

        for change in &report.discovery.opcode_changes {
            row(
                &mut writer,
                [
                    "opcode_change",
                    "",
                    &change.old,
                    &change.bit.to_string(),
                    &change.old,
                    &change.new,
                    "",
                    "",
                ],
            )?;
        }

        for bit in &report.discovery.opcode_bit_positions {
            row(&mut writer, ["opcode_bit", "", "", &bit.to_string(), "", "", "", ""])?;
        }

        for (line, bits) in &report.discovery.modifier_bit_positions {
            for bit in &bits.positions {
                row(
                    &mut writer,
                    [
                        "modifier_bit",
                        &line.to_string(),
                        &bits.opcode,
                        &bit.to_string(),
                        "",
                        "",
                        "",
                        "",
                    ],
                )?;
            }
        }

        for table in &report.tables {
            for (value, rendering) in &table.entries {
                row(
                    &mut writer,
                    [
                        "decode",
                        &table.line.to_string(),
                        &table.opcode,
                        "",
                        "",
                        "",
                        &table.assignment_label(*value),
                        rendering,
                    ],
                )?;
            }
        }

        for skipped in &report.skipped {
            row(
                &mut writer,
                [
                    "skipped",
                    &skipped.line.to_string(),
                    "",
                    "",
                    "",
                    "",
                    "",
                    &skipped.text,
                ],
            )?;
        }

        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
