#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use std::time::Instant;

    use crate::config::ProbeConfig;
    use crate::corpus::Corpus;
    use crate::format::OutputFormat;
    use crate::oracle::fixture::FixtureOracle;
    use crate::sweep::{Mode, Prober};
    use crate::{Architecture, BitClassification, Encoding, OracleError};

    const ATOM_ENCODING: u64 = 0x68380000001c0802;
    const ATOM: &str = "ATOM.E.ADD.F32.FTZ.RN R0, [R2], R0; /* 0x68380000001c0802 */";
    const MOV_ENCODING: u64 = 0x2800400000000006;
    const MOV: &str = "MOV R1, R0; /* 0x2800400000000006 */";

    fn corpus(text: &str) -> Corpus {
        Corpus::from_reader(Cursor::new(text.to_string()), 100).unwrap()
    }

    /// A made-up ISA: for ATOM, bit 5 turns it into IADD, bit 6 into RED,
    /// bits 3 and 7 change its modifiers and bits 20..=23 are rejected.
    /// MOV is untouched by everything except bit 62.
    fn isa(enc: Encoding) -> Result<String, OracleError> {
        let raw = enc.raw();
        let diff = raw ^ ATOM_ENCODING;
        if diff.count_ones() <= 2 {
            let rz = diff & (1 << 3) != 0;
            let min = diff & (1 << 7) != 0;
            let rest = diff & !(1 << 3 | 1 << 7);
            let text = match rest.trailing_zeros() {
                5 => "IADD R0, R2, R0;".to_string(),
                6 => "RED.E.ADD.F32.FTZ.RN [R2], R0;".to_string(),
                20 | 21 => "ATOM.E.ADD.F32.FTZ.?? R0, [R2], R0;".to_string(),
                22 => "error : unrecognized encoding".to_string(),
                23 => return Err(OracleError::Fault("illegal instruction".into())),
                _ => format!(
                    "ATOM.E.{}.F32.FTZ.{} R0, [R2], R0;",
                    if min { "MIN" } else { "ADD" },
                    if rz { "RZ" } else { "RN" }
                ),
            };
            return Ok(text);
        }
        if (raw ^ MOV_ENCODING) == 1 << 62 {
            return Ok("SEL R1, R0, RZ, P0;".to_string());
        }
        Ok("MOV R1, R0;".to_string())
    }

    #[test]
    fn test_opcode_discovery_kepler() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Kepler);
        let oracle = FixtureOracle::new(isa);
        let prober = Prober::new(&oracle, &profile, &config);

        let start = Instant::now();
        let report = prober.run(&corpus(ATOM), Mode::Opcode);
        println!("Opcode run took {:?}", start.elapsed());

        let sweep = &report.sweeps[0];
        assert_eq!(sweep.opcode, "ATOM");
        // modifiers keep their source order
        assert_eq!(sweep.text, ATOM);
        assert!(report.discovery.opcode_bit_positions.contains(&5));
        // RED is an alias of ATOM
        assert!(!report.discovery.opcode_bit_positions.contains(&6));
        assert_eq!(report.discovery.opcode_bit_positions, BTreeSet::from([5]));
        assert_eq!(report.discovery.opcode_changes.len(), 1);
        assert_eq!(report.discovery.opcode_changes[0].new, "IADD");
        assert!(report.tables.is_empty());
        assert_eq!(oracle.calls(), 64);
    }

    #[test]
    fn test_modifier_discovery_maxwell() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Maxwell);
        let oracle = FixtureOracle::new(isa);
        let prober = Prober::new(&oracle, &profile, &config);

        let report = prober.run(&corpus(ATOM), Mode::Modifier);

        let bits = report.discovery.modifier_bits(1).unwrap();
        assert_eq!(bits.positions, vec![3, 7]);
        assert_eq!(report.tables.len(), 1);

        let table = &report.tables[0];
        assert_eq!(table.queries, 4);
        assert!(table.entries.len() <= 4);
        assert_eq!(oracle.calls(), 64 + 4);
        assert!(table.entries[&0].starts_with("ATOM.E.ADD.F32.FTZ.RN"));
        assert!(table.entries[&1].starts_with("ATOM.E.ADD.F32.FTZ.RZ"));
        assert!(table.entries[&2].starts_with("ATOM.E.MIN.F32.FTZ.RN"));
        assert!(table.entries[&3].starts_with("ATOM.E.MIN.F32.FTZ.RZ"));
    }

    #[test]
    fn test_rejected_decodes_are_invalid() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Kepler);
        let oracle = FixtureOracle::new(isa);
        let report = Prober::new(&oracle, &profile, &config).run(&corpus(ATOM), Mode::Opcode);

        let sweep = &report.sweeps[0];
        for bit in 20..=23 {
            assert_eq!(sweep.classes[bit], BitClassification::Invalid, "bit {}", bit);
            assert!(!report.discovery.opcode_bit_positions.contains(&(bit as u8)));
        }
    }

    #[test]
    fn test_multi_line_corpus() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Kepler);
        let oracle = FixtureOracle::new(isa);
        let text = format!("{}\n\nnot an instruction\n{}\n", ATOM, MOV);
        let report = Prober::new(&oracle, &profile, &config).run(&corpus(&text), Mode::Modifier);

        assert_eq!(report.sweeps.len(), 2);
        assert_eq!(report.sweeps[1].line, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].line, 3);

        // corpus-wide union
        assert_eq!(report.discovery.opcode_bit_positions, BTreeSet::from([5, 62]));
        // MOV has no modifier bits, so only ATOM gets a table
        assert!(report.discovery.modifier_bits(4).is_none());
        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.tables[0].line, 1);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Maxwell);
        let text = format!("{}\n{}\n", ATOM, MOV);

        let first_oracle = FixtureOracle::new(isa);
        let first = Prober::new(&first_oracle, &profile, &config).run(&corpus(&text), Mode::Modifier);

        let parallel_config = ProbeConfig { parallel: true, ..ProbeConfig::default() };
        let second_oracle = FixtureOracle::new(isa);
        let second = Prober::new(&second_oracle, &profile, &parallel_config)
            .run(&corpus(&text), Mode::Modifier);

        assert_eq!(first.sweeps, second.sweeps);
        assert_eq!(first.discovery, second.discovery);
        assert_eq!(first.tables, second.tables);
        assert_eq!(first_oracle.seen(), second_oracle.seen());
    }

    #[test]
    fn test_unreachable_oracle_keeps_report_total() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Pascal);
        let oracle = FixtureOracle::new(|_: Encoding| -> Result<String, OracleError> {
            Err(OracleError::ProcessFailure("no such tool".into()))
        });
        let report = Prober::new(&oracle, &profile, &config).run(&corpus(ATOM), Mode::Modifier);

        let sweep = &report.sweeps[0];
        assert!(sweep.aborted);
        assert_eq!(sweep.classes.len(), 64);
        assert!(sweep.classes.iter().all(|c| *c == BitClassification::Invalid));
        assert!(report.tables.is_empty());
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn test_every_format_renders() {
        let config = ProbeConfig::default();
        let profile = config.profile_for(Architecture::Kepler);
        let oracle = FixtureOracle::new(isa);
        let report = Prober::new(&oracle, &profile, &config).run(&corpus(ATOM), Mode::Modifier);

        for format in OutputFormat::available_formats() {
            let rendered = format.get_formatter().format(&report).unwrap();
            assert!(rendered.contains("ATOM"), "{} output lacks the opcode", format);
        }
    }
}
