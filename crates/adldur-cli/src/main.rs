//! adldur - offline duration measurement for FM instrument banks
//!
//! This binary measures, for every instrument in a bank database, how long
//! its note stays audible after key-on and key-off, caching results so
//! repeated runs skip redundant simulation.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod chip;
mod commands;

/// adldur - FM instrument duration measurement
#[derive(Parser)]
#[command(name = "adldur")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure every instrument in a bank database and write the durations
    /// back
    Measure {
        /// Path to the bank database (JSON)
        #[arg(short, long)]
        db: String,

        /// Output database path (default: overwrite the input)
        #[arg(short, long)]
        out: Option<String>,

        /// Duration cache file path
        #[arg(short, long, default_value = "adldur-cache.dat")]
        cache: String,

        /// Maximum simultaneous measurement jobs (default: 2x hardware
        /// threads)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Abort when a measured silence verdict disagrees with the
        /// instrument's declared silence flag
        #[arg(long)]
        strict_silence: bool,
    },

    /// Inspect a duration cache file without loading a database
    CacheInfo {
        /// Duration cache file path
        #[arg(short, long)]
        cache: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Measure {
            db,
            out,
            cache,
            jobs,
            strict_silence,
        } => commands::measure::run(&db, out.as_deref(), &cache, jobs, strict_silence),
        Commands::CacheInfo { cache } => commands::cache_info::run(&cache),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
