//! Exhaustive enumeration of a modifier field's bit assignments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::MODIFIER_BITS_CEILING;
use crate::{ArchitectureProfile, BitIndex, Encoding, Oracle, OracleError};

/// Decoded rendering for every accepted assignment of one instruction's
/// modifier bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifierDecodeTable {
    /// Corpus line of the baseline
    pub line: usize,
    pub opcode: String,
    pub encoding: Encoding,
    /// Modifier bit positions, ascending; `positions[j]` is bit `j` of an
    /// assignment
    pub positions: Vec<BitIndex>,
    /// Oracle calls issued
    pub queries: usize,
    /// Assignment value to decoded text; rejected assignments are absent
    pub entries: BTreeMap<u64, String>,
    /// Too many modifier bits, nothing was enumerated
    pub skipped: bool,
    /// The oracle stopped responding part-way; entries are partial
    pub aborted: bool,
}

impl ModifierDecodeTable {
    fn empty(line: usize, opcode: &str, encoding: Encoding, positions: Vec<BitIndex>) -> Self {
        Self {
            line,
            opcode: opcode.to_string(),
            encoding,
            positions,
            queries: 0,
            entries: BTreeMap::new(),
            skipped: false,
            aborted: false,
        }
    }

    /// Number of assignments in the full search space, `None` when it
    /// does not fit a `u64`.
    pub fn space(&self) -> Option<u64> {
        u32::try_from(self.positions.len())
            .ok()
            .and_then(|k| 1u64.checked_shl(k))
    }

    /// Assignment `value` as one boolean per position, ascending.
    pub fn assignment_bits(&self, value: u64) -> Vec<bool> {
        (0..self.positions.len()).map(|j| (value >> j) & 1 == 1).collect()
    }

    /// Assignment `value` as a binary string, highest position first.
    pub fn assignment_label(&self, value: u64) -> String {
        let width = self.positions.len();
        if width == 0 {
            return String::new();
        }
        format!("{:0width$b}", value, width = width)
    }
}

/// Outcome of one assignment.
enum Row {
    /// Not queried, the oracle had already failed
    NotIssued,
    Rejected,
    Decoded(String),
}

/// Walks all `2^k` assignments of `k` modifier bits.
pub struct Enumerator<'a> {
    oracle: &'a dyn Oracle,
    profile: &'a ArchitectureProfile,
    min_tokens: usize,
    max_bits: usize,
    parallel: bool,
}

impl<'a> Enumerator<'a> {
    /// `max_bits` is clamped to [`MODIFIER_BITS_CEILING`].
    pub fn new(
        oracle: &'a dyn Oracle,
        profile: &'a ArchitectureProfile,
        min_tokens: usize,
        max_bits: usize,
    ) -> Self {
        Self {
            oracle,
            profile,
            min_tokens,
            max_bits: max_bits.min(MODIFIER_BITS_CEILING),
            parallel: false,
        }
    }

    /// Query assignments on the rayon pool instead of one after another.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Build the decode table for `positions` of `encoding`.
    pub fn enumerate(
        &self,
        line: usize,
        opcode: &str,
        encoding: Encoding,
        positions: &[BitIndex],
    ) -> ModifierDecodeTable {
        let mut positions = positions.to_vec();
        positions.sort_unstable();
        positions.dedup();

        let mut table = ModifierDecodeTable::empty(line, opcode, encoding, positions);
        let k = table.positions.len();
        if k > self.max_bits {
            log::warn!(
                "line {}: {} has {} modifier bits (limit {}), skipping enumeration",
                line,
                opcode,
                k,
                self.max_bits
            );
            table.skipped = true;
            return table;
        }

        let start_time = Instant::now();
        let abort = AtomicBool::new(false);
        // k <= MODIFIER_BITS_CEILING here
        let space = 1u64 << k;
        let rows: Vec<Row> = if self.parallel {
            (0..space)
                .into_par_iter()
                .map(|v| self.query(&table, v, &abort))
                .collect()
        } else {
            (0..space).map(|v| self.query(&table, v, &abort)).collect()
        };

        for (value, row) in (0..space).zip(rows) {
            match row {
                Row::NotIssued => {}
                Row::Rejected => table.queries += 1,
                Row::Decoded(text) => {
                    table.queries += 1;
                    table.entries.insert(value, text);
                }
            }
        }
        table.aborted = abort.load(Ordering::SeqCst);

        log::debug!(
            "line {}: enumerated {} assignments of {} in {:?}, {} decoded",
            line,
            table.queries,
            opcode,
            start_time.elapsed(),
            table.entries.len()
        );
        table
    }

    fn query(&self, table: &ModifierDecodeTable, value: u64, abort: &AtomicBool) -> Row {
        if abort.load(Ordering::SeqCst) {
            return Row::NotIssued;
        }
        let probe = table.encoding.with_assignment(&table.positions, value);
        match self.oracle.disassemble(probe, self.profile) {
            Ok(output) => match self.profile.line.tokens(&output) {
                Some(tokens) if tokens.len() >= self.min_tokens => Row::Decoded(tokens.join(" ")),
                _ => Row::Rejected,
            },
            Err(OracleError::ProcessFailure(msg)) => {
                log::warn!(
                    "{}: oracle unavailable during enumeration ({}), keeping partial table",
                    table.encoding,
                    msg
                );
                abort.store(true, Ordering::SeqCst);
                Row::Rejected
            }
            Err(e) => {
                log::trace!("{}: {}", probe, e);
                Row::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::fixture::FixtureOracle;
    use crate::Architecture;

    const BASE: u64 = 0x68380000001c0802;

    fn rounding(enc: Encoding) -> Result<String, OracleError> {
        let text = match ((enc.raw() >> 3) & 1, (enc.raw() >> 7) & 1) {
            (0, 0) => "FADD.RN R0, R1, R2;",
            (1, 0) => "FADD.RM R0, R1, R2;",
            (0, 1) => "FADD.RP R0, R1, R2;",
            _ => "FADD.?? R0, R1, R2;",
        };
        Ok(text.to_string())
    }

    #[test]
    fn test_enumerates_every_assignment() {
        let oracle = FixtureOracle::new(rounding);
        let profile = Architecture::Maxwell.default_profile();
        let table = Enumerator::new(&oracle, &profile, 4, 12).enumerate(
            1,
            "FADD",
            Encoding::new(BASE),
            &[7, 3],
        );

        assert_eq!(oracle.calls(), 4);
        assert_eq!(table.queries, 4);
        assert_eq!(table.positions, vec![3, 7]);
        assert_eq!(table.entries.len(), 3);
        assert!(table.entries[&0].starts_with("FADD.RN R0, R1, R2;"));
        assert!(table.entries[&1].starts_with("FADD.RM"));
        assert!(table.entries[&2].starts_with("FADD.RP"));
        assert!(!table.entries.contains_key(&3));

        let probes = oracle.seen();
        let base = Encoding::new(BASE).clear(&[3, 7]).raw();
        assert_eq!(
            probes.iter().map(|e| e.raw()).collect::<Vec<_>>(),
            {
                let mut v = vec![base, base | 1 << 3, base | 1 << 7, base | 1 << 3 | 1 << 7];
                v.sort();
                v
            }
        );
    }

    #[test]
    fn test_assignment_labels() {
        let oracle = FixtureOracle::new(rounding);
        let profile = Architecture::Maxwell.default_profile();
        let table = Enumerator::new(&oracle, &profile, 4, 12).enumerate(
            1,
            "FADD",
            Encoding::new(BASE),
            &[3, 7],
        );
        assert_eq!(table.assignment_bits(2), vec![false, true]);
        assert_eq!(table.assignment_label(2), "10");
        assert_eq!(table.space(), Some(4));
    }

    #[test]
    fn test_short_decodes_are_omitted() {
        let oracle = FixtureOracle::new(|enc: Encoding| {
            if enc.raw() & 1 == 1 {
                Ok(String::new())
            } else {
                Ok("MOV R0, R1;".to_string())
            }
        });
        let profile = Architecture::Kepler.default_profile();
        let table = Enumerator::new(&oracle, &profile, 4, 12).enumerate(
            1,
            "MOV",
            Encoding::new(0),
            &[0, 1, 2],
        );
        assert_eq!(table.queries, 8);
        assert_eq!(table.entries.len(), 4);
        assert!(table.entries.keys().all(|v| v & 1 == 0));
    }

    #[test]
    fn test_too_many_bits_is_skipped() {
        let oracle = FixtureOracle::new(rounding);
        let profile = Architecture::Kepler.default_profile();
        let positions: Vec<BitIndex> = (0..5).collect();
        let table = Enumerator::new(&oracle, &profile, 4, 4).enumerate(
            1,
            "FADD",
            Encoding::new(BASE),
            &positions,
        );
        assert!(table.skipped);
        assert_eq!(oracle.calls(), 0);
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_full_width_is_skipped_despite_large_limit() {
        let oracle = FixtureOracle::new(rounding);
        let profile = Architecture::Kepler.default_profile();
        let positions: Vec<BitIndex> = (0..64).collect();
        let table = Enumerator::new(&oracle, &profile, 4, 64).enumerate(
            1,
            "FADD",
            Encoding::new(BASE),
            &positions,
        );
        assert!(table.skipped);
        assert_eq!(oracle.calls(), 0);
        assert_eq!(table.space(), None);

        let table = Enumerator::new(&oracle, &profile, 4, usize::MAX).enumerate(
            1,
            "FADD",
            Encoding::new(BASE),
            &positions[..33],
        );
        assert!(table.skipped);
        assert_eq!(table.space(), Some(1 << 33));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn test_process_failure_keeps_partial_table() {
        let oracle = FixtureOracle::new(|enc: Encoding| {
            if enc.raw() >= 4 {
                Err(OracleError::ProcessFailure("gone".into()))
            } else {
                Ok("MOV R0, R1;".to_string())
            }
        });
        let profile = Architecture::Kepler.default_profile();
        let table = Enumerator::new(&oracle, &profile, 4, 12).enumerate(
            1,
            "MOV",
            Encoding::new(0),
            &[0, 1, 2, 3],
        );
        assert!(table.aborted);
        assert_eq!(table.entries.len(), 4);
        assert_eq!(table.queries, 5);
        assert_eq!(oracle.calls(), 5);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let oracle = FixtureOracle::new(rounding);
        let profile = Architecture::Maxwell.default_profile();
        let sequential = Enumerator::new(&oracle, &profile, 4, 12)
            .enumerate(1, "FADD", Encoding::new(BASE), &[3, 7, 20]);
        let parallel = Enumerator::new(&oracle, &profile, 4, 12)
            .parallel(true)
            .enumerate(1, "FADD", Encoding::new(BASE), &[3, 7, 20]);
        assert_eq!(sequential, parallel);
    }
}
