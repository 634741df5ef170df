//! Core IR, traits, and architecture profiles for bitsieve.
//!
//! bitsieve recovers the field layout of undocumented fixed-width (64-bit)
//! instruction encodings by differential probing. A known-good encoding is
//! mutated one bit at a time, every mutant is handed to an external
//! disassembler (the *oracle*), and the decoded text is compared against the
//! baseline to decide whether the bit belongs to the opcode, to a modifier
//! field, or to neither. Modifier bits are then enumerated exhaustively to
//! produce a raw value-to-text decode table.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use bitsieve::{
//!     config::ProbeConfig,
//!     corpus::Corpus,
//!     oracle::ProcessOracle,
//!     sweep::{Mode, Prober},
//!     Architecture,
//! };
//!
//! let config = ProbeConfig::default();
//! let arch: Architecture = "Kepler".parse().unwrap();
//! let profile = config.profile_for(arch);
//!
//! let oracle = ProcessOracle::new(&config);
//! let corpus = Corpus::from_path("sm35.sass", config.max_lines).unwrap();
//!
//! let prober = Prober::new(&oracle, &profile, &config);
//! let report = prober.run(&corpus, Mode::Opcode);
//! println!("opcode bits: {:?}", report.discovery.opcode_bit_positions);
//! ```

pub mod parser;
pub mod oracle;
pub mod sweep;
pub mod format;
pub mod config;
pub mod corpus;
mod large_tests;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use crate::oracle::OracleError;
pub use crate::parser::ParseError;

/// Index of one bit inside an [`Encoding`], always in `0..64`.
pub type BitIndex = u8;

/// Number of bits in every instruction word.
pub const ENCODING_BITS: BitIndex = 64;

/// An immutable 64-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding(u64);

impl Encoding {
    /// Wrap a raw instruction word.
    pub const fn new(raw: u64) -> Self {
        Encoding(raw)
    }

    /// The raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns a copy with bit `bit` inverted.
    pub fn flip(self, bit: BitIndex) -> Self {
        debug_assert!(bit < ENCODING_BITS);
        Encoding(self.0 ^ (1u64 << bit))
    }

    /// Returns a copy with every listed bit cleared.
    pub fn clear(self, positions: &[BitIndex]) -> Self {
        let mask = positions.iter().fold(0u64, |m, &p| m | (1u64 << p));
        Encoding(self.0 & !mask)
    }

    /// Clears `positions` and then sets `positions[j]` whenever bit `j` of
    /// `assignment` is one.
    pub fn with_assignment(self, positions: &[BitIndex], assignment: u64) -> Self {
        let base = self.clear(positions);
        let set = positions
            .iter()
            .enumerate()
            .filter(|(j, _)| (assignment >> j) & 1 == 1)
            .fold(0u64, |m, (_, &p)| m | (1u64 << p));
        Encoding(base.0 | set)
    }

    /// Little-endian byte image, as written into scratch files and templates.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for Encoding {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            return Err(ParseError::InvalidEncoding(s.to_string()));
        }
        u64::from_str_radix(digits, 16)
            .map(Encoding)
            .map_err(|_| ParseError::InvalidEncoding(s.to_string()))
    }
}

/// One decoded instruction, as produced by [`parser::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Guard predicate such as `@P0` or `@!P1`
    pub predicate: Option<String>,
    /// Instruction mnemonic without modifiers (e.g. `ATOM`)
    pub opcode: String,
    /// Dot-separated qualifiers following the mnemonic
    pub modifiers: BTreeSet<String>,
    /// Operands in source order, separators stripped
    pub operands: Vec<String>,
    /// Encoding this text was decoded from
    pub encoding: Encoding,
    /// Number of tokens in the line the record was parsed from
    pub token_count: usize,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pred) = &self.predicate {
            write!(f, "{} ", pred)?;
        }
        write!(f, "{}", self.opcode)?;
        for m in &self.modifiers {
            write!(f, ".{}", m)?;
        }
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands.join(", "))?;
        }
        write!(f, "; /* {} */", self.encoding)
    }
}

/// Per-bit verdict of the differential classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitClassification {
    /// Flipping the bit changes the (alias-normalised) mnemonic
    OpcodeField,
    /// Flipping the bit keeps the mnemonic but changes the modifier set
    ModifierField,
    /// The oracle decoded the mutant but nothing we compare changed
    Unclassified,
    /// The oracle rejected the mutant
    Invalid,
}

impl fmt::Display for BitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitClassification::OpcodeField => write!(f, "opcode"),
            BitClassification::ModifierField => write!(f, "modifier"),
            BitClassification::Unclassified => write!(f, "unclassified"),
            BitClassification::Invalid => write!(f, "invalid"),
        }
    }
}

/// One observed opcode transition: flipping `bit` turned `old` into `new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpcodeChange {
    pub old: String,
    pub new: String,
    pub bit: BitIndex,
}

/// Mnemonic pairs that decode differently but denote one field value.
///
/// Equivalence is closed transitively: every mnemonic maps onto a canonical
/// representative and two mnemonics are equal when their representatives are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    canonical: HashMap<String, String>,
    pairs: Vec<(String, String)>,
}

impl AliasTable {
    /// Create an empty table (no aliases).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from mnemonic pairs.
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut table = Self::new();
        for (a, b) in pairs {
            table.insert(a, b);
        }
        table
    }

    /// Declare `a` and `b` equivalent.
    pub fn insert(&mut self, a: impl Into<String>, b: impl Into<String>) {
        let (a, b) = (a.into(), b.into());
        let ra = self.normalize(&a).to_string();
        let rb = self.normalize(&b).to_string();
        if ra != rb {
            for target in self.canonical.values_mut() {
                if *target == rb {
                    *target = ra.clone();
                }
            }
            self.canonical.insert(rb.clone(), ra.clone());
        }
        self.canonical.entry(a.clone()).or_insert_with(|| ra.clone());
        self.canonical.insert(b.clone(), ra);
        self.pairs.push((a, b));
    }

    /// Canonical representative of `mnemonic`.
    pub fn normalize<'a>(&'a self, mnemonic: &'a str) -> &'a str {
        self.canonical
            .get(mnemonic)
            .map(String::as_str)
            .unwrap_or(mnemonic)
    }

    /// Whether two mnemonics denote the same field value.
    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    /// The pairs as configured.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

/// Supported architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    /// SM21
    Fermi,
    /// SM35
    Kepler,
    /// SM52
    Maxwell,
    /// SM60
    Pascal,
}

impl Architecture {
    /// Every accepted name, grouped by family.
    pub const NAMES: &'static [(&'static str, Architecture)] = &[
        ("SM21", Architecture::Fermi),
        ("Fermi", Architecture::Fermi),
        ("SM35", Architecture::Kepler),
        ("Kepler", Architecture::Kepler),
        ("SM52", Architecture::Maxwell),
        ("Maxwell", Architecture::Maxwell),
        ("SM60", Architecture::Pascal),
        ("Pascal", Architecture::Pascal),
    ];

    /// Built-in oracle profile for this family.
    pub fn default_profile(self) -> ArchitectureProfile {
        match self {
            Architecture::Fermi => ArchitectureProfile::raw(self, "SM21"),
            Architecture::Kepler => ArchitectureProfile::raw(self, "SM35"),
            Architecture::Maxwell => {
                ArchitectureProfile::templated(self, "sm_52", "test_sm52.cubin", 808)
            }
            Architecture::Pascal => {
                ArchitectureProfile::templated(self, "sm_60", "test_sm60.cubin", 904)
            }
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Fermi => write!(f, "Fermi"),
            Architecture::Kepler => write!(f, "Kepler"),
            Architecture::Maxwell => write!(f, "Maxwell"),
            Architecture::Pascal => write!(f, "Pascal"),
        }
    }
}

impl FromStr for Architecture {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, arch)| *arch)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::NAMES.iter().map(|(n, _)| *n).collect();
                ProbeError::Config(format!(
                    "unknown architecture '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// How the oracle receives a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Invocation {
    /// The 8 encoding bytes are written to a standalone scratch file.
    RawBinary,
    /// The 8 encoding bytes are patched into a copy of a container template.
    Templated { template: PathBuf, patch_offset: u64 },
}

/// Which output line carries the decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineSelection {
    /// Zero-based line number in the oracle output
    pub index: usize,
}

impl LineSelection {
    /// Tokens of the selected line, with a leading `/*addr*/` token dropped.
    pub fn tokens<'a>(&self, output: &'a str) -> Option<Vec<&'a str>> {
        let line = output.lines().nth(self.index)?;
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens
            .first()
            .is_some_and(|t| is_address_token(t))
        {
            tokens.remove(0);
        }
        if tokens.is_empty() {
            None
        } else {
            Some(tokens)
        }
    }
}

fn is_address_token(token: &str) -> bool {
    token
        .strip_prefix("/*")
        .and_then(|t| t.strip_suffix("*/"))
        .is_some_and(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Everything the oracle adapter needs to know about one architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchitectureProfile {
    pub architecture: Architecture,
    /// Disassembler executable
    pub tool: String,
    /// Arguments placed before the scratch file path
    pub tool_args: Vec<String>,
    pub invocation: Invocation,
    pub line: LineSelection,
}

impl ArchitectureProfile {
    /// A raw-binary profile driving `nvdisasm -b <flag>`.
    pub fn raw(architecture: Architecture, flag: &str) -> Self {
        Self {
            architecture,
            tool: "nvdisasm".to_string(),
            tool_args: vec!["-b".to_string(), flag.to_string()],
            invocation: Invocation::RawBinary,
            line: LineSelection { index: 1 },
        }
    }

    /// A templated profile driving `cuobjdump` on a patched container.
    pub fn templated(
        architecture: Architecture,
        gpu: &str,
        template: impl Into<PathBuf>,
        patch_offset: u64,
    ) -> Self {
        Self {
            architecture,
            tool: "cuobjdump".to_string(),
            tool_args: vec![
                "--gpu-architecture".to_string(),
                gpu.to_string(),
                "--dump-sass".to_string(),
            ],
            invocation: Invocation::Templated {
                template: template.into(),
                patch_offset,
            },
            line: LineSelection { index: 5 },
        }
    }

    /// Check that a templated profile has a usable template.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if let Invocation::Templated { template, patch_offset } = &self.invocation {
            let meta = std::fs::metadata(template).map_err(|e| {
                ProbeError::Config(format!(
                    "{} requires a container template, cannot read {}: {}",
                    self.architecture,
                    template.display(),
                    e
                ))
            })?;
            if meta.len() < patch_offset.saturating_add(8) {
                return Err(ProbeError::Config(format!(
                    "template {} is {} bytes, too short to patch at offset {}",
                    template.display(),
                    meta.len(),
                    patch_offset
                )));
            }
        }
        Ok(())
    }
}

/// Oracle trait: the external disassembler, seen as a pure function.
pub trait Oracle: Send + Sync {
    /// Decode one probe.
    ///
    /// Semantically invalid encodings are answered with
    /// [`OracleError::Ambiguous`] or [`OracleError::Fault`]; only launch
    /// failures and timeouts yield [`OracleError::ProcessFailure`].
    fn disassemble(
        &self,
        encoding: Encoding,
        profile: &ArchitectureProfile,
    ) -> Result<String, OracleError>;
}

/// Error type for probing runs
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Malformed instruction text
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Oracle failure
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Bad architecture name, missing template, invalid config file
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
