//! adldur measurement engine.
//!
//! This crate computes, for every FM instrument in a bank database, how long
//! its note stays audible after key-on and after key-off, by simulating the
//! note on a register-programmable OPL3-style device and analyzing the
//! generated audio's RMS envelope. Results are cached in a versioned binary
//! file keyed on structural instrument identity, so repeated runs skip
//! redundant simulation.
//!
//! # Overview
//!
//! - [`chip`] - the device contract the engine programs against; emulator
//!   cores are pluggable and live outside this crate.
//! - [`program`] / [`synth`] - resolving an instrument into a register
//!   program and driving one owned chip through `reset`, `program`,
//!   `key_on`, `key_off`.
//! - [`history`] / [`window`] - the sliding sample buffer and Hann-window
//!   RMS underneath the analyzer.
//! - [`analysis`] - the two-phase envelope measurement itself.
//! - [`cache`] - the two-generation persistent duration cache.
//! - [`scheduler`] - semaphore-bounded worker threads, one chip per job,
//!   plus the post-barrier write-back into the database.
//!
//! # Determinism
//!
//! Measurement is deterministic for a deterministic chip: the same
//! instrument always yields the same [`DurationInfo`], which is what makes
//! the cache sound.

pub mod analysis;
pub mod cache;
pub mod chip;
pub mod error;
pub mod history;
pub mod program;
pub mod scheduler;
pub mod synth;
pub mod sync;
pub mod window;

pub use analysis::{measure_durations, AnalyzerOptions, DurationInfo};
pub use cache::{probe, CacheGeneration, DurationCache, CACHE_MAGIC_V1, CACHE_MAGIC_V2};
pub use chip::OplChip;
pub use error::{MeasureError, MeasureResult};
pub use program::NoteProgram;
pub use scheduler::{
    apply_to_db, ChipFactory, MeasureJob, MeasureScheduler, MismatchPolicy, SilenceMismatch,
};
pub use synth::NoteSynth;
