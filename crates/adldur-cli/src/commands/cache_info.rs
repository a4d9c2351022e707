//! Cache-info command implementation.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::Colorize;

/// Prints the generation and entry count of a duration cache file.
pub fn run(cache_path: &str) -> Result<ExitCode> {
    let (generation, entries) = adldur_measure::probe(Path::new(cache_path))
        .with_context(|| format!("failed to inspect cache file {}", cache_path))?;

    println!("{} {}", "Cache file:".cyan().bold(), cache_path);
    println!("  {} {}", "Format:".dimmed(), generation);
    println!("  {} {}", "Entries:".dimmed(), entries);
    Ok(ExitCode::SUCCESS)
}
