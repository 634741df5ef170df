//! Run configuration: limits, alias table, and per-architecture overrides.
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AliasTable, Architecture, ArchitectureProfile, Invocation, ProbeError};

/// Hard ceiling on `max_modifier_bits`; assignments are indexed by `u64`.
pub const MODIFIER_BITS_CEILING: usize = 32;

/// Tunables for one probing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Corpus lines read per run
    pub max_lines: usize,
    /// Wall-clock limit for one oracle call
    pub timeout_ms: u64,
    /// Extra attempts after a process failure
    pub retries: u32,
    /// Decoded lines with fewer tokens are treated as garbage
    pub min_tokens: usize,
    /// Enumeration is skipped for instructions with more modifier bits
    pub max_modifier_bits: usize,
    /// Sweep bits and assignments on the rayon pool
    pub parallel: bool,
    /// Mnemonic pairs denoting one opcode value
    pub aliases: Vec<(String, String)>,
    /// Per-architecture profile tweaks
    pub profiles: Vec<ProfileOverride>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_lines: 100,
            timeout_ms: 10_000,
            retries: 2,
            min_tokens: 4,
            max_modifier_bits: 12,
            parallel: false,
            aliases: vec![
                ("LDG".to_string(), "TEX".to_string()),
                ("RED".to_string(), "ATOM".to_string()),
            ],
            profiles: Vec::new(),
        }
    }
}

/// Replaces selected fields of a built-in [`ArchitectureProfile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileOverride {
    /// Any accepted architecture name (`SM52`, `Maxwell`, ...)
    pub architecture: String,
    pub tool: Option<String>,
    pub tool_args: Option<Vec<String>>,
    /// Container template (templated architectures only)
    pub template: Option<PathBuf>,
    /// Byte offset of the first instruction in the template
    pub patch_offset: Option<u64>,
    /// Zero-based output line carrying the instruction
    pub line_index: Option<usize>,
}

impl ProbeConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ProbeError> {
        let text = std::fs::read_to_string(path)?;
        let config: ProbeConfig = serde_json::from_str(&text).map_err(|e| {
            ProbeError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the sweeps cannot work with.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.max_lines == 0 {
            return Err(ProbeError::Config("max_lines must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ProbeError::Config("timeout_ms must be at least 1".into()));
        }
        if self.max_modifier_bits > MODIFIER_BITS_CEILING {
            return Err(ProbeError::Config(format!(
                "max_modifier_bits {} exceeds ceiling {}",
                self.max_modifier_bits, MODIFIER_BITS_CEILING
            )));
        }
        for o in &self.profiles {
            let arch: Architecture = o.architecture.parse()?;
            let templated = matches!(arch.default_profile().invocation, Invocation::Templated { .. });
            if !templated && (o.template.is_some() || o.patch_offset.is_some()) {
                return Err(ProbeError::Config(format!(
                    "{} uses raw-binary mode and takes no template or patch offset",
                    arch
                )));
            }
        }
        Ok(())
    }

    /// The configured alias table.
    pub fn alias_table(&self) -> AliasTable {
        AliasTable::from_pairs(self.aliases.iter().cloned())
    }

    /// Built-in profile for `arch` with every matching override applied in order.
    pub fn profile_for(&self, arch: Architecture) -> ArchitectureProfile {
        let mut profile = arch.default_profile();
        let matching = self
            .profiles
            .iter()
            .filter(|o| o.architecture.parse::<Architecture>().ok() == Some(arch));
        for o in matching {
            if let Some(tool) = &o.tool {
                profile.tool = tool.clone();
            }
            if let Some(args) = &o.tool_args {
                profile.tool_args = args.clone();
            }
            if let Some(index) = o.line_index {
                profile.line.index = index;
            }
            if let Invocation::Templated { template, patch_offset } = &mut profile.invocation {
                if let Some(t) = &o.template {
                    *template = t.clone();
                }
                if let Some(off) = o.patch_offset {
                    *patch_offset = off;
                }
            }
        }
        profile
    }
}
