//! The envelope measurement algorithm.
//!
//! One measurement simulates a single note twice over: an attack phase after
//! key-on, locating the RMS peak and the decay below the attack threshold,
//! and a release phase after key-off, locating the decay below the release
//! threshold. Audio is analyzed in fixed windows against a sliding history
//! buffer, so a decay point is found without retaining the whole take.
//!
//! The attack loop usually exits early at silence; the release phase must
//! still begin exactly at the recorded peak, so the note is re-simulated
//! from a fresh reset up to the peak window before key-off is issued. That
//! replay is cheap next to the full attack cap.

use crate::chip::OplChip;
use crate::error::MeasureResult;
use crate::history::AudioHistory;
use crate::program::NoteProgram;
use crate::synth::NoteSynth;
use crate::window::{hann_window, windowed_rms};

/// Frames generated per chip call.
const AUDIO_BLOCK: usize = 256;

/// Tunable analysis constants. The defaults are the production values; tests
/// shrink them to steer scenarios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerOptions {
    /// Generation rate in Hz.
    pub sample_rate: u32,
    /// Analysis windows per second.
    pub windows_per_second: u32,
    /// Sliding history length in seconds.
    pub history_seconds: f64,
    /// Attack phase cap in seconds.
    pub max_on_seconds: u32,
    /// Release phase cap in seconds.
    pub max_off_seconds: u32,
    /// Seconds before the silence early-exit may trigger.
    pub silent_grace_seconds: u32,
    /// Attack decay threshold as a fraction of peak RMS.
    pub on_threshold: f64,
    /// Release decay threshold as a fraction of peak RMS.
    pub off_threshold: f64,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            sample_rate: 49_716,
            windows_per_second: 150,
            history_seconds: 0.1,
            max_on_seconds: 40,
            max_off_seconds: 60,
            silent_grace_seconds: 6,
            on_threshold: 0.008,
            off_threshold: 0.2,
        }
    }
}

impl AnalyzerOptions {
    /// Samples generated per analysis window.
    pub fn samples_per_window(&self) -> usize {
        (self.sample_rate / self.windows_per_second) as usize
    }

    /// Sliding history capacity in samples.
    pub fn history_capacity(&self) -> usize {
        (self.history_seconds * f64::from(self.sample_rate)).ceil() as usize
    }

    /// Attack phase cap in windows.
    pub fn max_on_windows(&self) -> usize {
        (self.max_on_seconds * self.windows_per_second) as usize
    }

    /// Release phase cap in windows.
    pub fn max_off_windows(&self) -> usize {
        (self.max_off_seconds * self.windows_per_second) as usize
    }

    /// Windows before the silence early-exit may trigger.
    pub fn silent_grace_windows(&self) -> usize {
        (self.silent_grace_seconds * self.windows_per_second) as usize
    }

    fn window_to_ms(&self, window: usize) -> i64 {
        (window as f64 * 1000.0 / f64::from(self.windows_per_second)) as i64
    }
}

/// The result of measuring one instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationInfo {
    /// RMS amplitude of the first window.
    pub begin_amplitude: f64,
    /// Highest RMS amplitude reached during the attack phase.
    pub peak_amplitude: f64,
    /// Window index of the peak.
    pub peak_time: usize,
    /// Window index where the attack phase decayed below threshold.
    pub quarter_amplitude_time: usize,
    /// Window index where the release phase decayed below threshold.
    pub keyoff_out_time: usize,
    /// Audible milliseconds after key-on.
    pub ms_sound_kon: i64,
    /// Audible milliseconds after key-off.
    pub ms_sound_koff: i64,
    /// The note never produced meaningful output.
    pub nosound: bool,
}

impl DurationInfo {
    /// Rebuilds the subset of a measurement that cache files persist. The
    /// amplitude diagnostics are not stored and read back as zero.
    pub fn from_cached(ms_sound_kon: i64, ms_sound_koff: i64, nosound: bool) -> Self {
        Self {
            begin_amplitude: 0.0,
            peak_amplitude: 0.0,
            peak_time: 0,
            quarter_amplitude_time: 0,
            keyoff_out_time: 0,
            ms_sound_kon,
            ms_sound_koff,
            nosound,
        }
    }
}

/// Running min/max of the raw left-channel samples, for the near-silence
/// classification.
#[derive(Debug, Clone, Copy, Default)]
struct SampleBounds {
    min: i16,
    max: i16,
}

impl SampleBounds {
    fn update(&mut self, sample: i16) {
        if sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
    }

    /// The canonical near-silence band: every raw sample within one LSB.
    fn is_silent(&self) -> bool {
        self.min >= -1 && self.max <= 1
    }
}

/// Generates one analysis window of audio, recording the left channel into
/// the history buffer.
fn generate_window<C: OplChip>(
    synth: &mut NoteSynth<C>,
    history: &mut AudioHistory,
    samples_per_window: usize,
    bounds: Option<&mut SampleBounds>,
) {
    let mut block = [0i16; 2 * AUDIO_BLOCK];
    let mut bounds = bounds;
    let mut remaining = samples_per_window;
    while remaining > 0 {
        let frames = remaining.min(AUDIO_BLOCK);
        let buffer = &mut block[..2 * frames];
        synth.generate(buffer);
        for frame in buffer.chunks_exact(2) {
            let sample = frame[0];
            history.add(f64::from(sample));
            if let Some(b) = bounds.as_deref_mut() {
                b.update(sample);
            }
        }
        remaining -= frames;
    }
}

/// Measures how long `program` stays audible after key-on and key-off on the
/// synthesizer's chip.
pub fn measure_durations<C: OplChip>(
    synth: &mut NoteSynth<C>,
    program: &NoteProgram,
    options: &AnalyzerOptions,
) -> MeasureResult<DurationInfo> {
    let samples_per_window = options.samples_per_window();
    let max_on = options.max_on_windows();
    let max_off = options.max_off_windows();
    let silent_grace = options.silent_grace_windows();

    let mut history = AudioHistory::new(options.history_capacity());
    let mut coeffs = vec![0.0; history.capacity()];
    let mut coeff_len = 0usize;

    synth.reset(options.sample_rate);
    synth.program(program)?;
    synth.key_on()?;

    let mut bounds = SampleBounds::default();
    let mut begin_amplitude = 0.0;
    let mut peak_amplitude = 0.0;
    let mut peak_time = 0usize;
    let mut quarter_time = max_on;
    let mut quarter_found = false;
    let mut highest_so_far = 0.0;
    let mut windows_passed_on = 0usize;

    for period in 0..max_on {
        generate_window(synth, &mut history, samples_per_window, Some(&mut bounds));

        if coeff_len != history.len() {
            coeff_len = history.len();
            hann_window(&mut coeffs[..coeff_len]);
        }
        let rms = windowed_rms(history.latest(), &coeffs[..coeff_len]);

        if period == 0 {
            begin_amplitude = rms;
            peak_amplitude = rms;
            peak_time = 0;
        } else if rms > peak_amplitude {
            peak_amplitude = rms;
            peak_time = period;
            // The decay point must be re-searched relative to the new peak.
            quarter_found = false;
        } else if !quarter_found && rms <= peak_amplitude * options.on_threshold {
            quarter_time = period;
            quarter_found = true;
        }

        if rms > highest_so_far {
            highest_so_far = rms;
        }

        if period > silent_grace
            && (rms < highest_so_far * options.on_threshold || bounds.is_silent())
        {
            break;
        }
        windows_passed_on += 1;
    }

    if !quarter_found {
        quarter_time = windows_passed_on;
    }

    if windows_passed_on >= max_on {
        synth.key_off()?;
    } else {
        // The attack loop exited early, so the buffered audio does not end at
        // the peak. Re-simulate from scratch up to the peak window, then
        // release from there.
        synth.reset(options.sample_rate);
        synth.program(program)?;
        synth.key_on()?;
        history.clear();
        let replay = peak_time.max(1).min(max_on);
        for _ in 0..replay {
            generate_window(synth, &mut history, samples_per_window, None);
        }
        synth.key_off()?;
    }

    let mut keyoff_time = 0usize;
    let mut keyoff_found = false;

    for period in 0..max_off {
        generate_window(synth, &mut history, samples_per_window, Some(&mut bounds));

        if coeff_len != history.len() {
            coeff_len = history.len();
            hann_window(&mut coeffs[..coeff_len]);
        }
        let rms = windowed_rms(history.latest(), &coeffs[..coeff_len]);

        if !keyoff_found && rms <= peak_amplitude * options.off_threshold {
            keyoff_time = period;
            keyoff_found = true;
        }

        if rms < highest_so_far * options.off_threshold {
            break;
        }
        if period > silent_grace && bounds.is_silent() {
            break;
        }
    }

    Ok(DurationInfo {
        begin_amplitude,
        peak_amplitude,
        peak_time,
        quarter_amplitude_time: quarter_time,
        keyoff_out_time: keyoff_time,
        ms_sound_kon: options.window_to_ms(quarter_time),
        ms_sound_koff: options.window_to_ms(keyoff_time),
        nosound: peak_amplitude < 0.5 || bounds.is_silent(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::regs;
    use crate::program::VoiceProgram;
    use adldur_bank::OperatorPatch;

    fn plain_program() -> NoteProgram {
        NoteProgram {
            voices: vec![VoiceProgram {
                modulator: OperatorPatch {
                    e862: 0x0001_F121,
                    ksl_level: 0x10,
                },
                carrier: OperatorPatch {
                    e862: 0x0002_E222,
                    ksl_level: 0x00,
                },
                fb_conn: 0x0E,
                note_offset: 0,
            }],
            play_note: 60,
            real_4op: false,
            pseudo_4op: false,
            detune: 0.0,
        }
    }

    /// Tracks key-on state from register writes, like a real device would.
    #[derive(Default)]
    struct KeyGate {
        keyed: bool,
        position: u64,
    }

    impl KeyGate {
        fn observe(&mut self, addr: u16, value: u8) {
            if addr & 0xFF0 == regs::CH_KEYON_BLOCK {
                let keyed = value & regs::KEYON_BIT != 0;
                if keyed && !self.keyed {
                    self.position = 0;
                }
                self.keyed = keyed;
            }
        }
    }

    /// Emits a loud first window, a quiet plateau, then exact silence.
    struct SteppedChip {
        gate: KeyGate,
        samples_per_window: u64,
    }

    impl OplChip for SteppedChip {
        fn set_rate(&mut self, _rate: u32) {}

        fn write_reg(&mut self, addr: u16, value: u8) {
            self.gate.observe(addr, value);
        }

        fn generate(&mut self, buffer: &mut [i16]) {
            for frame in buffer.chunks_exact_mut(2) {
                let mut sample = 0i16;
                if self.gate.keyed {
                    let window = self.gate.position / self.samples_per_window;
                    let amplitude = match window {
                        0 => 10_000,
                        1..=4 => 1_000,
                        _ => 0,
                    };
                    sample = if self.gate.position % 2 == 0 {
                        amplitude
                    } else {
                        -amplitude
                    };
                    self.gate.position += 1;
                }
                frame[0] = sample;
                frame[1] = sample;
            }
        }
    }

    /// Exponentially decaying tone; faster decay after key-off.
    struct DecayingChip {
        gate: KeyGate,
        released_at: u64,
    }

    impl DecayingChip {
        fn new() -> Self {
            Self {
                gate: KeyGate::default(),
                released_at: 0,
            }
        }
    }

    impl OplChip for DecayingChip {
        fn set_rate(&mut self, _rate: u32) {}

        fn write_reg(&mut self, addr: u16, value: u8) {
            let was_keyed = self.gate.keyed;
            self.gate.observe(addr, value);
            if was_keyed && !self.gate.keyed {
                self.released_at = self.gate.position;
            }
        }

        fn generate(&mut self, buffer: &mut [i16]) {
            for frame in buffer.chunks_exact_mut(2) {
                let n = self.gate.position;
                let mut envelope = (-(n as f64) / 49_716.0).exp();
                if !self.gate.keyed {
                    if self.released_at == 0 && n == 0 {
                        envelope = 0.0;
                    } else {
                        envelope *= (-((n - self.released_at) as f64) / 4_971.0).exp();
                    }
                }
                let tone = (n as f64 * 0.2).sin();
                let sample = (16_000.0 * envelope * tone) as i16;
                if self.gate.keyed || self.released_at > 0 {
                    self.gate.position += 1;
                }
                frame[0] = sample;
                frame[1] = sample;
            }
        }
    }

    /// Never exceeds one LSB of output: a tick every hundredth sample.
    struct TickChip {
        gate: KeyGate,
    }

    impl OplChip for TickChip {
        fn set_rate(&mut self, _rate: u32) {}

        fn write_reg(&mut self, addr: u16, value: u8) {
            self.gate.observe(addr, value);
        }

        fn generate(&mut self, buffer: &mut [i16]) {
            for frame in buffer.chunks_exact_mut(2) {
                let mut sample = 0i16;
                if self.gate.keyed {
                    if self.gate.position % 200 == 0 {
                        sample = 1;
                    } else if self.gate.position % 200 == 100 {
                        sample = -1;
                    }
                    self.gate.position += 1;
                }
                frame[0] = sample;
                frame[1] = sample;
            }
        }
    }

    fn fast_options() -> AnalyzerOptions {
        AnalyzerOptions {
            // One-window history so the per-window RMS tracks the signal's
            // amplitude steps exactly.
            history_seconds: 0.006,
            ..AnalyzerOptions::default()
        }
    }

    #[test]
    fn test_immediate_decay_scenario_yields_33_ms() {
        let options = fast_options();
        let chip = SteppedChip {
            gate: KeyGate::default(),
            samples_per_window: options.samples_per_window() as u64,
        };
        let mut synth = NoteSynth::new(chip);
        let info = measure_durations(&mut synth, &plain_program(), &options).unwrap();

        assert_eq!(info.peak_time, 0);
        assert_eq!(info.quarter_amplitude_time, 5);
        assert_eq!(info.ms_sound_kon, 33);
        assert!(!info.nosound);
    }

    #[test]
    fn test_measurement_is_idempotent() {
        let options = AnalyzerOptions::default();
        let program = plain_program();

        let mut first = NoteSynth::new(DecayingChip::new());
        let mut second = NoteSynth::new(DecayingChip::new());
        let a = measure_durations(&mut first, &program, &options).unwrap();
        let b = measure_durations(&mut second, &program, &options).unwrap();

        assert_eq!(a, b);
        assert!(!a.nosound);
        assert!(a.peak_amplitude > 0.5);
        assert!(a.ms_sound_kon > 0);
        assert!(a.keyoff_out_time <= options.max_off_windows());
    }

    #[test]
    fn test_sub_lsb_output_is_classified_nosound() {
        let options = AnalyzerOptions::default();
        let mut synth = NoteSynth::new(TickChip {
            gate: KeyGate::default(),
        });
        let info = measure_durations(&mut synth, &plain_program(), &options).unwrap();

        assert!(info.nosound);
        assert!(info.peak_amplitude < 0.5);
    }

    #[test]
    fn test_defaults_match_production_constants() {
        let options = AnalyzerOptions::default();
        assert_eq!(options.samples_per_window(), 331);
        assert_eq!(options.history_capacity(), 4972);
        assert_eq!(options.max_on_windows(), 6000);
        assert_eq!(options.max_off_windows(), 9000);
        assert_eq!(options.silent_grace_windows(), 900);
    }
}
