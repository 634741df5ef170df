//! Single-bit differential classification with optional parallel processing

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::parser;
use crate::{
    AliasTable, ArchitectureProfile, BitClassification, BitIndex, Instruction, OpcodeChange,
    Oracle, OracleError, ENCODING_BITS,
};

/// Result of sweeping all 64 bits of one baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSweep {
    pub baseline: Instruction,
    /// One verdict per bit, indexed by bit position
    pub classes: Vec<BitClassification>,
    /// Opcode transitions in bit order
    pub opcode_changes: Vec<OpcodeChange>,
    pub opcode_bits: BTreeSet<BitIndex>,
    pub modifier_bits: BTreeSet<BitIndex>,
    /// The oracle stopped responding part-way; later bits are `Invalid`
    pub aborted: bool,
}

impl BitSweep {
    /// Verdict for one bit.
    pub fn classification(&self, bit: BitIndex) -> BitClassification {
        self.classes[bit as usize]
    }

    /// How many bits received `class`.
    pub fn count(&self, class: BitClassification) -> usize {
        self.classes.iter().filter(|&&c| c == class).count()
    }

    /// One character per bit, bit 63 first: `O`pcode, `M`odifier, `.`
    /// unclassified, `x` invalid.
    pub fn bitmap(&self) -> String {
        self.classes
            .iter()
            .rev()
            .map(|c| match c {
                BitClassification::OpcodeField => 'O',
                BitClassification::ModifierField => 'M',
                BitClassification::Unclassified => '.',
                BitClassification::Invalid => 'x',
            })
            .collect()
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BitOutcome {
    class: BitClassification,
    new_opcode: Option<String>,
}

impl BitOutcome {
    fn plain(class: BitClassification) -> Self {
        Self { class, new_opcode: None }
    }
}

/// Flips each bit of a baseline and compares the oracle's decode with it.
pub struct Classifier<'a> {
    oracle: &'a dyn Oracle,
    profile: &'a ArchitectureProfile,
    aliases: &'a AliasTable,
    min_tokens: usize,
    parallel: bool,
}

impl<'a> Classifier<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        profile: &'a ArchitectureProfile,
        aliases: &'a AliasTable,
        min_tokens: usize,
    ) -> Self {
        Self {
            oracle,
            profile,
            aliases,
            min_tokens,
            parallel: false,
        }
    }

    /// Probe bits on the rayon pool instead of one after another.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Classify all 64 bits of `baseline`.
    pub fn sweep(&self, baseline: &Instruction) -> BitSweep {
        let start_time = Instant::now();
        let abort = AtomicBool::new(false);

        let outcomes: Vec<BitOutcome> = if self.parallel {
            (0..ENCODING_BITS)
                .into_par_iter()
                .map(|bit| self.classify_bit(baseline, bit, &abort))
                .collect()
        } else {
            (0..ENCODING_BITS)
                .map(|bit| self.classify_bit(baseline, bit, &abort))
                .collect()
        };

        let mut sweep = BitSweep {
            baseline: baseline.clone(),
            classes: Vec::with_capacity(ENCODING_BITS as usize),
            opcode_changes: Vec::new(),
            opcode_bits: BTreeSet::new(),
            modifier_bits: BTreeSet::new(),
            aborted: abort.load(Ordering::SeqCst),
        };
        for (bit, outcome) in (0..ENCODING_BITS).zip(outcomes) {
            match outcome.class {
                BitClassification::OpcodeField => {
                    sweep.opcode_bits.insert(bit);
                    if let Some(new) = outcome.new_opcode {
                        log::debug!(
                            "opcode changes: {} => {} when bit [{}] is flipped",
                            baseline.opcode,
                            new,
                            bit
                        );
                        sweep.opcode_changes.push(OpcodeChange {
                            old: baseline.opcode.clone(),
                            new,
                            bit,
                        });
                    }
                }
                BitClassification::ModifierField => {
                    sweep.modifier_bits.insert(bit);
                }
                BitClassification::Unclassified | BitClassification::Invalid => {}
            }
            sweep.classes.push(outcome.class);
        }

        log::debug!(
            "Swept {} in {:?}: {} opcode, {} modifier, {} unclassified, {} invalid",
            baseline.encoding,
            start_time.elapsed(),
            sweep.opcode_bits.len(),
            sweep.modifier_bits.len(),
            sweep.count(BitClassification::Unclassified),
            sweep.count(BitClassification::Invalid)
        );
        sweep
    }

    fn classify_bit(&self, baseline: &Instruction, bit: BitIndex, abort: &AtomicBool) -> BitOutcome {
        if abort.load(Ordering::SeqCst) {
            return BitOutcome::plain(BitClassification::Invalid);
        }

        let probe = baseline.encoding.flip(bit);
        match self.oracle.disassemble(probe, self.profile) {
            Ok(output) => self.compare(baseline, &output),
            Err(OracleError::ProcessFailure(msg)) => {
                log::warn!(
                    "{}: oracle unavailable at bit {} ({}), abandoning sweep",
                    baseline.encoding,
                    bit,
                    msg
                );
                abort.store(true, Ordering::SeqCst);
                BitOutcome::plain(BitClassification::Invalid)
            }
            Err(e) => {
                log::trace!("{} bit {}: {}", baseline.encoding, bit, e);
                BitOutcome::plain(BitClassification::Invalid)
            }
        }
    }

    /// Compare a decoded probe with the baseline.
    fn compare(&self, baseline: &Instruction, output: &str) -> BitOutcome {
        let tokens = match self.profile.line.tokens(output) {
            Some(tokens) if tokens.len() >= self.min_tokens => tokens,
            _ => return BitOutcome::plain(BitClassification::Unclassified),
        };
        let parsed = match parser::parse(&tokens) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::trace!("{}: unparsable decode ({})", baseline.encoding, e);
                return BitOutcome::plain(BitClassification::Unclassified);
            }
        };

        if !self.aliases.equivalent(&parsed.opcode, &baseline.opcode) {
            BitOutcome {
                class: BitClassification::OpcodeField,
                new_opcode: Some(parsed.opcode),
            }
        } else if parsed.modifiers != baseline.modifiers {
            BitOutcome::plain(BitClassification::ModifierField)
        } else {
            BitOutcome::plain(BitClassification::Unclassified)
        }
    }
}
