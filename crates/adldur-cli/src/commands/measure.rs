//! Measure command implementation.
//!
//! Loads a bank database, measures every instrument through the bundled
//! chip (reusing whatever the duration cache already knows), writes the
//! measured durations back into the database, and refreshes the cache in
//! the current format.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;

use adldur_bank::{BankDb, LegacyBank, OperatorKey};
use adldur_measure::{
    apply_to_db, AnalyzerOptions, ChipFactory, DurationCache, MeasureJob, MeasureScheduler,
    MismatchPolicy, NoteProgram, OplChip,
};

use crate::chip::LiteOpl;

/// Runs the measure command.
///
/// # Arguments
/// * `db_path` - Bank database to measure (JSON)
/// * `out_path` - Where to write the updated database (default: in place)
/// * `cache_path` - Duration cache file, read and rewritten
/// * `jobs` - Concurrency bound override
/// * `strict_silence` - Abort on silence-verdict mismatches instead of
///   warning
pub fn run(
    db_path: &str,
    out_path: Option<&str>,
    cache_path: &str,
    jobs: Option<usize>,
    strict_silence: bool,
) -> Result<ExitCode> {
    println!("{} {}", "Loading database:".cyan().bold(), db_path);
    let mut db = BankDb::load(Path::new(db_path))
        .with_context(|| format!("failed to load bank database {}", db_path))?;
    println!(
        "  {} instruments, {} operators",
        db.instruments.len(),
        db.operators.len()
    );

    let cache = Arc::new(DurationCache::new());
    let cache_file = Path::new(cache_path);
    if cache_file.exists() {
        match cache.load(cache_file, &LegacyBank::from_db(&db)) {
            Ok(generation) => println!(
                "{} {} ({}, {} entries)",
                "Cache loaded:".cyan().bold(),
                cache_path,
                generation,
                cache.keyed_len() + cache.legacy_len()
            ),
            Err(err) => eprintln!(
                "{} discarding cache, everything will be measured from scratch: {}",
                "warning:".yellow().bold(),
                err
            ),
        }
    } else {
        println!(
            "{}",
            "No cache file; everything will be measured from scratch.".dimmed()
        );
    }

    let jobs = jobs.unwrap_or_else(MeasureScheduler::default_concurrency);
    println!(
        "{} up to {} simultaneous jobs",
        "Measuring:".cyan().bold(),
        jobs
    );

    let chips: ChipFactory = Arc::new(|| Box::new(LiteOpl::new()) as Box<dyn OplChip>);
    let mut scheduler =
        MeasureScheduler::new(Arc::clone(&cache), chips, AnalyzerOptions::default(), jobs);

    let mut unresolvable = 0usize;
    for (index, inst) in db.instruments.iter().enumerate() {
        match NoteProgram::from_entry(&db, inst) {
            Ok(program) => scheduler.submit(MeasureJob::Keyed {
                key: OperatorKey::from_entry(inst),
                program,
            }),
            Err(err) => {
                unresolvable += 1;
                eprintln!(
                    "{} skipping instrument {}: {}",
                    "warning:".yellow().bold(),
                    index,
                    err
                );
            }
        }
    }
    scheduler.wait_all();

    let progress = scheduler.progress();
    println!(
        "{} {} jobs completed, {} cache hits, {} distinct measurements",
        "Done:".green().bold(),
        progress.done(),
        progress.cache_hits(),
        cache.keyed_len()
    );
    if progress.clamped_notes() > 0 {
        eprintln!(
            "{} {} notes exceeded the chip's frequency ceiling and were clamped",
            "warning:".yellow().bold(),
            progress.clamped_notes()
        );
    }
    if progress.failures() > 0 || unresolvable > 0 {
        eprintln!(
            "{} {} instruments could not be measured",
            "warning:".yellow().bold(),
            progress.failures() + unresolvable
        );
    }

    let mismatches = apply_to_db(&mut db, &cache);
    for mismatch in &mismatches {
        eprintln!(
            "{} instrument {} measured {}, declared {} (peak {:.3}, flags {:#04x}, fbconn {:#06x})",
            "silence mismatch:".yellow().bold(),
            mismatch.instrument,
            if mismatch.measured_nosound {
                "silent"
            } else {
                "audible"
            },
            if mismatch.declared_silent {
                "silent"
            } else {
                "audible"
            },
            mismatch.peak_amplitude,
            mismatch.inst_flags,
            mismatch.fb_conn
        );
    }
    let policy = if strict_silence {
        MismatchPolicy::Fatal
    } else {
        MismatchPolicy::Warn
    };
    policy
        .enforce(&mismatches)
        .context("silence consistency check failed")?;

    cache
        .save_keyed(cache_file)
        .with_context(|| format!("failed to save cache file {}", cache_path))?;

    let out = out_path.unwrap_or(db_path);
    db.save(Path::new(out))
        .with_context(|| format!("failed to write database {}", out))?;
    println!("{} {}", "Database updated:".green().bold(), out);

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adldur_bank::{flags, InstrumentEntry, OperatorPatch};

    fn test_db() -> BankDb {
        let entry = |ops: [i32; 4]| InstrumentEntry {
            ops,
            fb_conn: 0x06,
            note_offset1: 0,
            note_offset2: 0,
            percussion_key: 0,
            inst_flags: 0,
            second_voice_detune: 0,
            delay_on_ms: 0,
            delay_off_ms: 0,
        };
        BankDb {
            operators: vec![
                // Percussive, audible.
                OperatorPatch {
                    e862: 0x008F_FA01,
                    ksl_level: 0x18,
                },
                OperatorPatch {
                    e862: 0x008F_FA01,
                    ksl_level: 0x00,
                },
                // Fully attenuated carrier: silent by construction.
                OperatorPatch {
                    e862: 0x008F_FA01,
                    ksl_level: 0x3F,
                },
            ],
            instruments: vec![entry([0, 1, -1, -1]), entry([0, 2, -1, -1])],
        }
    }

    #[test]
    fn test_measure_roundtrip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("bank.json");
        let out_path = dir.path().join("bank-out.json");
        let cache_path = dir.path().join("cache.dat");

        test_db().save(&db_path).unwrap();

        run(
            db_path.to_str().unwrap(),
            Some(out_path.to_str().unwrap()),
            cache_path.to_str().unwrap(),
            Some(2),
            false,
        )
        .unwrap();

        let measured = BankDb::load(&out_path).unwrap();
        assert!(measured.instruments[0].delay_on_ms > 0);
        assert_eq!(measured.instruments[0].inst_flags & flags::IS_BLANK, 0);
        assert_ne!(measured.instruments[1].inst_flags & flags::IS_BLANK, 0);
        assert!(cache_path.exists());

        // A second run over the measured database is pure cache hits and
        // leaves the results unchanged.
        run(
            out_path.to_str().unwrap(),
            None,
            cache_path.to_str().unwrap(),
            Some(2),
            false,
        )
        .unwrap();
        let remeasured = BankDb::load(&out_path).unwrap();
        assert_eq!(
            remeasured.instruments[0].delay_on_ms,
            measured.instruments[0].delay_on_ms
        );
    }
}
