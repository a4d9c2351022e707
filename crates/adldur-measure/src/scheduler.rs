//! The concurrent measurement scheduler.
//!
//! One worker thread is spawned per submitted job, bounded by a counting
//! semaphore so at most a small multiple of the hardware thread count is ever
//! simulating at once. Submission blocks on the semaphore; already-finished
//! workers are reaped lazily before each spawn, and
//! [`MeasureScheduler::wait_all`] is the final barrier.
//!
//! Each job owns a freshly built chip; the only cross-thread state is the
//! duration cache behind its mutex and the atomic progress counters, so
//! measurement order never affects results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use adldur_bank::{is_silent, BankDb, LegacyIdentity, OperatorKey};

use crate::analysis::{measure_durations, AnalyzerOptions};
use crate::cache::DurationCache;
use crate::chip::OplChip;
use crate::error::{MeasureError, MeasureResult};
use crate::program::NoteProgram;
use crate::synth::NoteSynth;
use crate::sync::Semaphore;

/// Builds one chip instance per cache miss. Every job owns its chip; the
/// factory itself is shared across worker threads.
pub type ChipFactory = Arc<dyn Fn() -> Box<dyn OplChip> + Send + Sync>;

/// One unit of measurement work.
#[derive(Debug, Clone)]
pub enum MeasureJob {
    /// Measurement keyed on the structural operator key.
    Keyed {
        /// Cache key.
        key: OperatorKey,
        /// Resolved register program.
        program: NoteProgram,
    },
    /// Measurement keyed on the legacy identity.
    Legacy {
        /// Cache key.
        identity: LegacyIdentity,
        /// Resolved register program.
        program: NoteProgram,
    },
}

impl MeasureJob {
    fn program(&self) -> &NoteProgram {
        match self {
            MeasureJob::Keyed { program, .. } => program,
            MeasureJob::Legacy { program, .. } => program,
        }
    }
}

/// Shared progress counters, updated atomically outside the cache mutex.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicUsize,
    cache_hits: AtomicUsize,
    clamped_notes: AtomicUsize,
    failures: AtomicUsize,
}

impl Progress {
    /// Jobs completed, hit or miss.
    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    /// Jobs satisfied from the cache without simulation.
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Notes whose frequency had to be clamped to the chip's ceiling.
    pub fn clamped_notes(&self) -> usize {
        self.clamped_notes.load(Ordering::Relaxed)
    }

    /// Jobs that failed to measure (unresolvable programs).
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Fans measurement jobs out across worker threads with a bounded
/// concurrency budget.
pub struct MeasureScheduler {
    cache: Arc<DurationCache>,
    chips: ChipFactory,
    options: AnalyzerOptions,
    semaphore: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
    progress: Arc<Progress>,
}

impl MeasureScheduler {
    /// The default in-flight bound: twice the hardware thread count.
    pub fn default_concurrency() -> usize {
        num_cpus::get() * 2
    }

    /// Creates a scheduler allowing `max_in_flight` simultaneous jobs.
    pub fn new(
        cache: Arc<DurationCache>,
        chips: ChipFactory,
        options: AnalyzerOptions,
        max_in_flight: usize,
    ) -> Self {
        Self {
            cache,
            chips,
            options,
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            workers: Vec::new(),
            progress: Arc::new(Progress::default()),
        }
    }

    /// The scheduler's progress counters.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Submits one job, blocking until a concurrency slot is free.
    pub fn submit(&mut self, job: MeasureJob) {
        self.semaphore.acquire();
        self.reap_finished();

        let cache = Arc::clone(&self.cache);
        let chips = Arc::clone(&self.chips);
        let options = self.options;
        let semaphore = Arc::clone(&self.semaphore);
        let progress = Arc::clone(&self.progress);
        let handle = thread::spawn(move || {
            run_job(&job, &cache, &chips, &options, &progress);
            semaphore.release();
            progress.done.fetch_add(1, Ordering::Relaxed);
        });
        self.workers.push(handle);
    }

    /// Joins every outstanding worker.
    pub fn wait_all(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn reap_finished(&mut self) {
        let mut index = 0;
        while index < self.workers.len() {
            if self.workers[index].is_finished() {
                let handle = self.workers.remove(index);
                let _ = handle.join();
            } else {
                index += 1;
            }
        }
    }
}

impl Drop for MeasureScheduler {
    fn drop(&mut self) {
        self.wait_all();
    }
}

fn run_job(
    job: &MeasureJob,
    cache: &DurationCache,
    chips: &ChipFactory,
    options: &AnalyzerOptions,
    progress: &Progress,
) {
    let hit = match job {
        MeasureJob::Keyed { key, .. } => cache.lookup_keyed(key).is_some(),
        MeasureJob::Legacy { identity, .. } => cache.lookup_legacy(identity).is_some(),
    };
    if hit {
        progress.cache_hits.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let make_chip = chips.as_ref();
    let mut synth = NoteSynth::new(make_chip());
    match measure_durations(&mut synth, job.program(), options) {
        Ok(info) => match job {
            MeasureJob::Keyed { key, .. } => cache.insert_keyed(*key, info),
            MeasureJob::Legacy { identity, .. } => cache.insert_legacy(*identity, info),
        },
        Err(_) => {
            progress.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    progress
        .clamped_notes
        .fetch_add(synth.clamped_notes(), Ordering::Relaxed);
}

/// How to respond when the measured no-sound verdict disagrees with the
/// declared silence prediction. Detection always runs; only the response is
/// configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Report the mismatches and continue.
    Warn,
    /// Abort the run.
    Fatal,
}

impl MismatchPolicy {
    /// Applies the policy to the detected mismatches.
    pub fn enforce(self, mismatches: &[SilenceMismatch]) -> MeasureResult<()> {
        if self == MismatchPolicy::Fatal && !mismatches.is_empty() {
            return Err(MeasureError::SilenceMismatch {
                count: mismatches.len(),
            });
        }
        Ok(())
    }
}

/// Diagnostic record for one silence disagreement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceMismatch {
    /// Index of the instrument in the database.
    pub instrument: usize,
    /// The analyzer's verdict.
    pub measured_nosound: bool,
    /// The register-level prediction.
    pub declared_silent: bool,
    /// Peak RMS the analyzer saw.
    pub peak_amplitude: f64,
    /// The instrument's flag bits.
    pub inst_flags: u32,
    /// The instrument's feedback/connection bytes.
    pub fb_conn: u16,
}

/// Copies measured durations onto their instrument records and flags blank
/// instruments, returning any silence disagreements found along the way.
///
/// Runs after [`MeasureScheduler::wait_all`], so the database never crosses
/// a thread boundary.
pub fn apply_to_db(db: &mut BankDb, cache: &DurationCache) -> Vec<SilenceMismatch> {
    let mut mismatches = Vec::new();
    for index in 0..db.instruments.len() {
        let entry = db.instruments[index];
        let info = match cache.lookup_keyed(&OperatorKey::from_entry(&entry)) {
            Some(info) => info,
            None => continue,
        };

        let declared_silent = is_silent(db, &entry);
        if info.nosound != declared_silent {
            mismatches.push(SilenceMismatch {
                instrument: index,
                measured_nosound: info.nosound,
                declared_silent,
                peak_amplitude: info.peak_amplitude,
                inst_flags: entry.inst_flags,
                fb_conn: entry.fb_conn,
            });
        }

        let record = &mut db.instruments[index];
        record.delay_on_ms = info.ms_sound_kon.clamp(0, i64::from(u16::MAX)) as u16;
        record.delay_off_ms = info.ms_sound_koff.clamp(0, i64::from(u16::MAX)) as u16;
        if info.nosound {
            record.inst_flags |= adldur_bank::flags::IS_BLANK;
        }
    }
    mismatches
}
