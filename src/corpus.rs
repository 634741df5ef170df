//! Corpus loading: one known-good instruction per line.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Serialize, Serializer};

use crate::parser::{self, ParseError};
use crate::{Instruction, ProbeError};

/// A successfully parsed corpus line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    /// One-based line number
    pub line: usize,
    /// The line as written, trimmed
    pub text: String,
    pub instruction: Instruction,
}

/// A corpus line that could not be parsed and was left out of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLine {
    pub line: usize,
    pub text: String,
    #[serde(serialize_with = "as_display")]
    pub error: ParseError,
}

/// Baseline instructions for one run.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub entries: Vec<CorpusEntry>,
    pub skipped: Vec<SkippedLine>,
}

impl Corpus {
    /// Read at most `max_lines` lines from `path`.
    pub fn from_path(path: impl AsRef<Path>, max_lines: usize) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ProbeError::Config(format!("cannot open corpus {}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file), max_lines)
    }

    /// Read at most `max_lines` lines from `reader`.
    ///
    /// Blank lines count towards the limit but are otherwise ignored. Lines
    /// that are not UTF-8 are skipped like any other malformed line.
    pub fn from_reader<R: BufRead>(reader: R, max_lines: usize) -> Result<Self, ProbeError> {
        let mut corpus = Corpus::default();
        for (idx, bytes) in reader.split(b'\n').take(max_lines).enumerate() {
            let mut bytes = bytes?;
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            let line = match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(e) => {
                    let text = String::from_utf8_lossy(e.as_bytes()).trim().to_string();
                    corpus.skip(idx + 1, text, ParseError::InvalidUtf8);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            corpus.push(idx + 1, &line);
        }
        log::info!(
            "Corpus: {} instructions, {} malformed lines skipped",
            corpus.entries.len(),
            corpus.skipped.len()
        );
        Ok(corpus)
    }

    fn push(&mut self, line: usize, text: &str) {
        let text = text.trim().to_string();
        match parser::parse_line(&text) {
            Ok(instruction) => self.entries.push(CorpusEntry {
                line,
                text,
                instruction,
            }),
            Err(error) => self.skip(line, text, error),
        }
    }

    fn skip(&mut self, line: usize, text: String, error: ParseError) {
        log::warn!("line {}: {} ({})", line, error, text);
        self.skipped.push(SkippedLine { line, text, error });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn as_display<T: fmt::Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}
