//! bitsieve command line
//!
//! ```bash
//! # which bits select the opcode of every Kepler instruction in a listing
//! bitsieve sm35.sass Kepler
//!
//! # modifier bits and their decode tables, as JSON
//! bitsieve sm52.sass SM52 --mode modifier --format json --template test_sm52.cubin
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use bitsieve::config::{ProbeConfig, ProfileOverride};
use bitsieve::corpus::Corpus;
use bitsieve::format::OutputFormat;
use bitsieve::oracle::ProcessOracle;
use bitsieve::sweep::{Mode, Prober};
use bitsieve::Architecture;

/// bitsieve - differential bit probing of 64-bit instruction encodings
#[derive(Parser, Debug)]
#[command(name = "bitsieve", version, about)]
struct Args {
    /// Disassembly listing with one instruction and its encoding per line
    corpus: PathBuf,

    /// Architecture name (SM21/Fermi, SM35/Kepler, SM52/Maxwell, SM60/Pascal)
    arch: String,

    /// What to discover
    #[arg(short, long, value_enum, default_value_t = Mode::Opcode)]
    mode: Mode,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Container template for templated architectures
    #[arg(long)]
    template: Option<PathBuf>,

    /// Byte offset of the instruction inside the template
    #[arg(long)]
    patch_offset: Option<u64>,

    /// Corpus lines to read
    #[arg(long)]
    max_lines: Option<usize>,

    /// Per-call oracle timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run bit sweeps and enumerations on all cores
    #[arg(long)]
    parallel: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Fold command-line overrides into the loaded config.
    fn apply(&self, config: &mut ProbeConfig) {
        if let Some(max_lines) = self.max_lines {
            config.max_lines = max_lines;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if self.parallel {
            config.parallel = true;
        }
        if self.template.is_some() || self.patch_offset.is_some() {
            config.profiles.push(ProfileOverride {
                architecture: self.arch.clone(),
                template: self.template.clone(),
                patch_offset: self.patch_offset,
                ..Default::default()
            });
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let mut config = match &args.config {
        Some(path) => ProbeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ProbeConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let arch: Architecture = args.arch.parse()?;
    let profile = config.profile_for(arch);
    profile
        .validate()
        .with_context(|| format!("Unusable {} profile", arch))?;

    let oracle = ProcessOracle::new(&config);
    oracle
        .check(&profile)
        .with_context(|| format!("Disassembler '{}' is not usable", profile.tool))?;
    info!("Using {} via {} for {}", oracle, profile.tool, arch);

    let corpus = Corpus::from_path(&args.corpus, config.max_lines)
        .with_context(|| format!("Failed to read corpus {}", args.corpus.display()))?;
    if corpus.is_empty() {
        anyhow::bail!(
            "No usable instructions in {} ({} lines skipped)",
            args.corpus.display(),
            corpus.skipped.len()
        );
    }
    info!(
        "Loaded {} instructions from {} ({} skipped)",
        corpus.len(),
        args.corpus.display(),
        corpus.skipped.len()
    );

    let prober = Prober::new(&oracle, &profile, &config);
    let report = prober.run(&corpus, args.mode);

    let rendered = args
        .format
        .get_formatter()
        .format(&report)
        .with_context(|| format!("Failed to render {} report", args.format))?;

    match &args.output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => print!("{}", rendered),
    }

    Ok(())
}
