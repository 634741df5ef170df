//! Tokenizer turning one line of disassembly into an [`Instruction`].
//!
//! Accepted shape (whitespace separated):
//!
//! ```text
//! [{] [@pred] OPCODE[.MOD]*[;] operand, operand, ...; /* 0x<16 hex digits> */
//! ```

use std::collections::BTreeSet;

use crate::{Encoding, Instruction};

/// Opens a dual-issue bundle.
const BUNDLE_MARKER: &str = "{";
/// First character of a guard predicate.
const PREDICATE_MARKER: char = '@';
/// Separates the mnemonic from its modifiers.
const FIELD_DELIMITER: char = '.';
/// Ends a statement.
const TERMINATOR: char = ';';
const COMMENT_OPEN: &str = "/*";
const COMMENT_CLOSE: &str = "*/";

/// Errors that can occur while parsing an instruction line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// No tokens at all
    #[error("empty instruction line")]
    Empty,

    /// Nothing left where the mnemonic should be
    #[error("no opcode token")]
    MissingOpcode,

    /// No trailing `/* 0x... */` token
    #[error("no trailing encoding token")]
    MissingEncoding,

    /// A trailing token that is not a 64-bit hex value
    #[error("invalid encoding token '{0}'")]
    InvalidEncoding(String),

    /// The line is not valid UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Split a raw line on whitespace and parse it.
pub fn parse_line(line: &str) -> Result<Instruction, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    parse(&tokens)
}

/// Parse a whitespace-tokenised instruction.
pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Instruction, ParseError> {
    let tokens: Vec<&str> = tokens.iter().map(AsRef::as_ref).collect();
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let (comment_start, encoding) = trailing_encoding(&tokens)?;

    let mut at = 0;
    if tokens[at] == BUNDLE_MARKER {
        at += 1;
    }

    let mut predicate = None;
    if at < comment_start && tokens[at].starts_with(PREDICATE_MARKER) {
        predicate = Some(tokens[at].to_string());
        at += 1;
    }

    if at >= comment_start {
        return Err(ParseError::MissingOpcode);
    }
    let head = tokens[at].strip_suffix(TERMINATOR).unwrap_or(tokens[at]);
    let mut fields = head.split(FIELD_DELIMITER);
    let opcode = match fields.next() {
        Some(op) if !op.is_empty() => op.to_string(),
        _ => return Err(ParseError::MissingOpcode),
    };
    let modifiers: BTreeSet<String> = fields
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    let operands = tokens[at + 1..comment_start]
        .iter()
        .map(|t| t.trim_end_matches([',', TERMINATOR]))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    Ok(Instruction {
        predicate,
        opcode,
        modifiers,
        operands,
        encoding,
        token_count: tokens.len(),
    })
}

/// Locate the encoding comment at the end of the line.
///
/// Returns the index of the first token belonging to the comment together
/// with the decoded value. Both `/* 0x.. */` and `/*0x..*/` are accepted.
fn trailing_encoding(tokens: &[&str]) -> Result<(usize, Encoding), ParseError> {
    let mut end = tokens.len();
    if tokens[end - 1] == COMMENT_CLOSE {
        end -= 1;
    }
    if end == 0 {
        return Err(ParseError::MissingEncoding);
    }

    let raw = tokens[end - 1];
    let hex = raw
        .trim_start_matches(COMMENT_OPEN)
        .trim_end_matches(COMMENT_CLOSE);
    if !(hex.starts_with("0x") || hex.starts_with("0X")) {
        return Err(ParseError::MissingEncoding);
    }
    let encoding: Encoding = hex.parse()?;

    let mut start = end - 1;
    if start > 0 && tokens[start - 1] == COMMENT_OPEN {
        start -= 1;
    }
    Ok((start, encoding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_atom_line() {
        let insn =
            parse_line("ATOM.E.ADD.F32.FTZ.RN R0, [R2], R0; /* 0x68380000001c0802 */").unwrap();
        assert_eq!(insn.opcode, "ATOM");
        let expected: BTreeSet<String> = ["E", "ADD", "F32", "FTZ", "RN"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(insn.modifiers, expected);
        assert_eq!(insn.operands, vec!["R0", "[R2]", "R0"]);
        assert_eq!(insn.encoding, Encoding::new(0x68380000001c0802));
        assert_eq!(insn.predicate, None);
        assert_eq!(insn.token_count, 7);
    }

    #[test]
    fn test_parse_predicate_and_bundle() {
        let insn = parse_line("{ @!P0 BRA `(.L_1); /* 0xe2400000000000f0 */").unwrap();
        assert_eq!(insn.predicate.as_deref(), Some("@!P0"));
        assert_eq!(insn.opcode, "BRA");
        assert!(insn.modifiers.is_empty());
        assert_eq!(insn.operands, vec!["`(.L_1)"]);
    }

    #[test]
    fn test_parse_terminated_opcode() {
        let insn = parse_line("NOP; /* 0x50b0000000070f00 */").unwrap();
        assert_eq!(insn.opcode, "NOP");
        assert!(insn.operands.is_empty());
        assert_eq!(insn.token_count, 4);
    }

    #[test]
    fn test_parse_glued_comment() {
        let insn = parse_line("EXIT.KEEPREFCOUNT; /*0xe30000000007000f*/").unwrap();
        assert_eq!(insn.opcode, "EXIT");
        assert!(insn.modifiers.contains("KEEPREFCOUNT"));
        assert_eq!(insn.encoding.raw(), 0xe30000000007000f);
    }

    #[test]
    fn test_modifier_order_is_irrelevant() {
        let a = parse_line("F2F.F32.F16.RN R0, R1; /* 0x0000000000000001 */").unwrap();
        let b = parse_line("F2F.RN.F16.F32 R0, R1; /* 0x0000000000000001 */").unwrap();
        assert_eq!(a.modifiers, b.modifiers);
    }

    #[rstest]
    #[case("", ParseError::Empty)]
    #[case("MOV R1, R2;", ParseError::MissingEncoding)]
    #[case("/* 0x0000000000000001 */", ParseError::MissingOpcode)]
    #[case("@P0 /* 0x0000000000000001 */", ParseError::MissingOpcode)]
    #[case(".F32 R0; /* 0x0000000000000001 */", ParseError::MissingOpcode)]
    #[case("MOV R1; /* 0xnothex */", ParseError::InvalidEncoding("0xnothex".to_string()))]
    fn test_parse_errors(#[case] line: &str, #[case] expected: ParseError) {
        assert_eq!(parse_line(line).unwrap_err(), expected);
    }
}
