//! Corpus-wide merge of per-instruction bit sweeps.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::classify::BitSweep;
use crate::{BitIndex, Encoding, OpcodeChange};

/// Modifier bits discovered for one corpus instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifierBits {
    pub opcode: String,
    pub encoding: Encoding,
    /// Ascending
    pub positions: Vec<BitIndex>,
}

/// Field positions accumulated over a run.
///
/// Opcode positions are a union: one instruction confirming a bit is enough.
/// Modifier positions stay attached to the instruction that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldDiscovery {
    pub opcode_bit_positions: BTreeSet<BitIndex>,
    /// Every `(old, new, bit)` transition seen, in processing order
    pub opcode_changes: Vec<OpcodeChange>,
    /// Keyed by corpus line; instructions without modifier bits are absent
    pub modifier_bit_positions: BTreeMap<usize, ModifierBits>,
}

impl FieldDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sweep into the discovery.
    pub fn record(&mut self, line: usize, sweep: &BitSweep) {
        let before = self.opcode_bit_positions.len();
        self.opcode_bit_positions.extend(sweep.opcode_bits.iter().copied());
        self.opcode_changes.extend(sweep.opcode_changes.iter().cloned());
        if self.opcode_bit_positions.len() > before {
            log::debug!(
                "line {}: {} new opcode bit(s), {} total",
                line,
                self.opcode_bit_positions.len() - before,
                self.opcode_bit_positions.len()
            );
        }

        if !sweep.modifier_bits.is_empty() {
            self.modifier_bit_positions.insert(
                line,
                ModifierBits {
                    opcode: sweep.baseline.opcode.clone(),
                    encoding: sweep.baseline.encoding,
                    positions: sweep.modifier_bits.iter().copied().collect(),
                },
            );
        }
    }

    /// Modifier bits of the instruction on `line`, if any were found.
    pub fn modifier_bits(&self, line: usize) -> Option<&ModifierBits> {
        self.modifier_bit_positions.get(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;
    use crate::BitClassification;

    fn sweep(line: &str, opcode: &[BitIndex], modifier: &[BitIndex]) -> BitSweep {
        let baseline = parse_line(line).unwrap();
        let mut classes = vec![BitClassification::Unclassified; 64];
        for &b in opcode {
            classes[b as usize] = BitClassification::OpcodeField;
        }
        for &b in modifier {
            classes[b as usize] = BitClassification::ModifierField;
        }
        BitSweep {
            opcode_changes: opcode
                .iter()
                .map(|&bit| OpcodeChange {
                    old: baseline.opcode.clone(),
                    new: "NOP".into(),
                    bit,
                })
                .collect(),
            baseline,
            classes,
            opcode_bits: opcode.iter().copied().collect(),
            modifier_bits: modifier.iter().copied().collect(),
            aborted: false,
        }
    }

    #[test]
    fn test_opcode_positions_are_unioned() {
        let mut discovery = FieldDiscovery::new();
        discovery.record(1, &sweep("MOV R1, R2; /* 0x0000000000000001 */", &[58, 59], &[]));
        discovery.record(2, &sweep("IADD R1, R2, R3; /* 0x0000000000000002 */", &[59, 60], &[]));
        discovery.record(3, &sweep("FADD R1, R2, R3; /* 0x0000000000000003 */", &[], &[]));

        assert_eq!(discovery.opcode_bit_positions, BTreeSet::from([58, 59, 60]));
        assert_eq!(discovery.opcode_changes.len(), 4);
        assert!(discovery.modifier_bit_positions.is_empty());
    }

    #[test]
    fn test_modifier_positions_stay_per_instruction() {
        let mut discovery = FieldDiscovery::new();
        discovery.record(1, &sweep("F2F.F32.F16 R1, R2; /* 0x0000000000000001 */", &[], &[3, 7]));
        discovery.record(2, &sweep("FADD.FTZ R1, R2, R3; /* 0x0000000000000002 */", &[], &[7, 9]));

        assert_eq!(discovery.modifier_bits(1).unwrap().positions, vec![3, 7]);
        assert_eq!(discovery.modifier_bits(2).unwrap().positions, vec![7, 9]);
        assert_eq!(discovery.modifier_bits(2).unwrap().opcode, "FADD");
        assert!(discovery.modifier_bits(3).is_none());
    }
}
