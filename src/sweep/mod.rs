//! Probing runs over a corpus

use std::fmt;
use std::time::Instant;

use clap::ValueEnum;
use serde::Serialize;

use crate::config::ProbeConfig;
use crate::corpus::{Corpus, CorpusEntry, SkippedLine};
use crate::{AliasTable, Architecture, ArchitectureProfile, BitClassification, Encoding, Oracle};

pub use self::aggregate::{FieldDiscovery, ModifierBits};
pub use self::classify::{BitSweep, Classifier};
pub use self::enumerate::{Enumerator, ModifierDecodeTable};

/// What a run is trying to discover.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Which bits select the opcode
    Opcode,
    /// Which bits select modifiers, plus their decode tables
    Modifier,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Opcode => write!(f, "opcode discovery"),
            Mode::Modifier => write!(f, "modifier discovery"),
        }
    }
}

/// Per-instruction record kept in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub line: usize,
    /// Corpus line as written
    pub text: String,
    pub opcode: String,
    pub encoding: Encoding,
    pub classes: Vec<BitClassification>,
    /// `O`/`M`/`.`/`x` per bit, bit 63 first
    pub bitmap: String,
    pub aborted: bool,
}

impl SweepSummary {
    fn new(entry: &CorpusEntry, sweep: &BitSweep) -> Self {
        Self {
            line: entry.line,
            text: entry.text.clone(),
            opcode: sweep.baseline.opcode.clone(),
            encoding: sweep.baseline.encoding,
            classes: sweep.classes.clone(),
            bitmap: sweep.bitmap(),
            aborted: sweep.aborted,
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub architecture: Architecture,
    pub mode: Mode,
    pub sweeps: Vec<SweepSummary>,
    pub discovery: FieldDiscovery,
    /// Empty for opcode runs
    pub tables: Vec<ModifierDecodeTable>,
    pub skipped: Vec<SkippedLine>,
}

/// Drives classifier, aggregator and enumerator over a corpus.
pub struct Prober<'a> {
    oracle: &'a dyn Oracle,
    profile: &'a ArchitectureProfile,
    config: &'a ProbeConfig,
    aliases: AliasTable,
}

impl<'a> Prober<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        profile: &'a ArchitectureProfile,
        config: &'a ProbeConfig,
    ) -> Self {
        Self {
            oracle,
            profile,
            config,
            aliases: config.alias_table(),
        }
    }

    pub fn classifier(&self) -> Classifier<'_> {
        Classifier::new(self.oracle, self.profile, &self.aliases, self.config.min_tokens)
            .parallel(self.config.parallel)
    }

    pub fn enumerator(&self) -> Enumerator<'_> {
        Enumerator::new(
            self.oracle,
            self.profile,
            self.config.min_tokens,
            self.config.max_modifier_bits,
        )
        .parallel(self.config.parallel)
    }

    /// Sweep every corpus instruction; in modifier mode also enumerate
    /// each instruction's modifier bits.
    pub fn run(&self, corpus: &Corpus, mode: Mode) -> Report {
        log::info!(
            "Starting {} on {} instructions ({})",
            mode,
            corpus.len(),
            self.profile.architecture
        );
        let start_time = Instant::now();

        let classifier = self.classifier();
        let enumerator = self.enumerator();
        let mut discovery = FieldDiscovery::new();
        let mut sweeps = Vec::with_capacity(corpus.len());
        let mut tables = Vec::new();

        for entry in &corpus.entries {
            let sweep = classifier.sweep(&entry.instruction);
            discovery.record(entry.line, &sweep);

            match mode {
                Mode::Opcode => log::info!(
                    "line {}: {} opcode bits {:?}",
                    entry.line,
                    sweep.baseline.opcode,
                    sweep.opcode_bits
                ),
                Mode::Modifier => log::info!(
                    "line {}: {} modifier bits {:?}",
                    entry.line,
                    sweep.baseline.opcode,
                    sweep.modifier_bits
                ),
            }

            if mode == Mode::Modifier && !sweep.modifier_bits.is_empty() {
                if sweep.aborted {
                    log::warn!(
                        "line {}: sweep was cut short, not enumerating {}",
                        entry.line,
                        sweep.baseline.opcode
                    );
                } else {
                    let positions: Vec<_> = sweep.modifier_bits.iter().copied().collect();
                    tables.push(enumerator.enumerate(
                        entry.line,
                        &sweep.baseline.opcode,
                        sweep.baseline.encoding,
                        &positions,
                    ));
                }
            }

            sweeps.push(SweepSummary::new(entry, &sweep));
        }

        log::info!(
            "Done in {:?}: opcode bits {:?}, {} instructions with modifier bits",
            start_time.elapsed(),
            discovery.opcode_bit_positions,
            discovery.modifier_bit_positions.len()
        );

        Report {
            architecture: self.profile.architecture,
            mode,
            sweeps,
            discovery,
            tables,
            skipped: corpus.skipped.clone(),
        }
    }
}

pub mod classify;
pub mod aggregate;
pub mod enumerate;
