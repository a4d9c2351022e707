//! The instrument programmer.
//!
//! [`NoteSynth`] owns one chip and drives it through the only call sequence
//! that produces a clean measurement: `reset`, `program`, `key_on`,
//! `key_off`. Out-of-order calls are rejected instead of silently
//! mis-programming registers.

use crate::chip::{regs, OplChip, CHANNEL_OFFSETS, CHANNEL_OPERATOR_OFFSETS};
use crate::error::{MeasureError, MeasureResult};
use crate::program::NoteProgram;

/// Pitch constants for the chip's logarithmic frequency encoding:
/// `hertz = FREQ_BASE * exp(FREQ_STEP * note)`, with `FREQ_STEP` one
/// equal-tempered semitone.
const FREQ_BASE: f64 = 172.00093;
const FREQ_STEP: f64 = 0.057762265;
/// Highest frequency the block/F-number encoding can express.
const FREQ_CEILING: f64 = 131_071.0;
/// F-number range limit per octave block.
const BLOCK_LIMIT: f64 = 1023.5;

/// Register writes that finish a reset: settle the timers, pulse OPL3 mode
/// (leaving it disabled), enable waveform select, and force melodic mode.
const RESET_SEQUENCE: [(u16, u8); 7] = [
    (regs::TIMER_CONTROL, 96),
    (regs::TIMER_CONTROL, 128),
    (regs::OPL3_MODE, 0),
    (regs::OPL3_MODE, 1),
    (regs::OPL3_MODE, 0),
    (regs::WAVEFORM_ENABLE, 32),
    (regs::RHYTHM_MODE, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynthState {
    /// Fresh or used-up device; only `reset` is meaningful.
    Idle,
    /// Reset done, no instrument programmed.
    Ready,
    /// Instrument registers written.
    Programmed,
    /// Note sounding.
    KeyedOn,
    /// Note released; a reset is required before reuse.
    KeyedOff,
}

impl SynthState {
    fn name(self) -> &'static str {
        match self {
            SynthState::Idle => "Idle",
            SynthState::Ready => "Ready",
            SynthState::Programmed => "Programmed",
            SynthState::KeyedOn => "KeyedOn",
            SynthState::KeyedOff => "KeyedOff",
        }
    }
}

/// Drives one owned chip to produce exactly one note of one instrument.
pub struct NoteSynth<C: OplChip> {
    chip: C,
    state: SynthState,
    program: Option<NoteProgram>,
    /// Block/F-number words written at key-on, kept for key-off.
    keyed: [u32; 2],
    clamped_notes: usize,
}

impl<C: OplChip> NoteSynth<C> {
    /// Wraps a chip. The device is unusable until [`reset`](Self::reset).
    pub fn new(chip: C) -> Self {
        Self {
            chip,
            state: SynthState::Idle,
            program: None,
            keyed: [0; 2],
            clamped_notes: 0,
        }
    }

    /// Silences every channel and re-initializes the device's global state.
    ///
    /// Must precede every fresh measurement so no state leaks between
    /// instruments. Valid from any state.
    pub fn reset(&mut self, sample_rate: u32) {
        self.chip.set_rate(sample_rate);
        for &ch in &CHANNEL_OFFSETS {
            self.chip.write_reg(regs::CH_KEYON_BLOCK + ch, 0x00);
        }
        for &(addr, value) in &RESET_SEQUENCE {
            self.chip.write_reg(addr, value);
        }
        self.program = None;
        self.keyed = [0; 2];
        self.state = SynthState::Ready;
    }

    /// Writes the instrument's operator and connection registers.
    ///
    /// Voice `n` occupies channel `3n`, so a second voice never shares
    /// operator slots with the first.
    pub fn program(&mut self, program: &NoteProgram) -> MeasureResult<()> {
        if self.state != SynthState::Ready {
            return Err(self.out_of_order("program", "Ready"));
        }

        self.chip.write_reg(
            regs::FOUR_OP_CONN,
            if program.real_4op { 0x3F } else { 0x00 },
        );

        for (n, voice) in program.voices.iter().enumerate() {
            let channel = (n * 3) as u16;
            let [mod_slot, car_slot] = CHANNEL_OPERATOR_OFFSETS[channel as usize];
            for (base, mod_byte, car_byte) in [
                (
                    regs::OP_CHARACTERISTIC,
                    voice.modulator.reg_20(),
                    voice.carrier.reg_20(),
                ),
                (
                    regs::OP_ATTACK_DECAY,
                    voice.modulator.reg_60(),
                    voice.carrier.reg_60(),
                ),
                (
                    regs::OP_SUSTAIN_RELEASE,
                    voice.modulator.reg_80(),
                    voice.carrier.reg_80(),
                ),
                (
                    regs::OP_WAVEFORM,
                    voice.modulator.reg_e0(),
                    voice.carrier.reg_e0(),
                ),
            ] {
                self.chip.write_reg(base + mod_slot, mod_byte);
                self.chip.write_reg(base + car_slot, car_byte);
            }
            self.chip
                .write_reg(regs::CH_FB_CONN + channel, voice.fb_conn | regs::OUTPUT_BOTH);
            self.chip
                .write_reg(regs::OP_LEVEL + mod_slot, voice.modulator.ksl_level);
            self.chip
                .write_reg(regs::OP_LEVEL + car_slot, voice.carrier.ksl_level);
        }

        self.program = Some(program.clone());
        self.state = SynthState::Programmed;
        Ok(())
    }

    /// Keys on each constituent note at its computed pitch.
    ///
    /// The note number maps to hertz logarithmically, then folds into the
    /// chip's block/F-number encoding by halving until the frequency fits
    /// under the per-octave limit. Frequencies above the representable
    /// ceiling are clamped and counted in
    /// [`clamped_notes`](Self::clamped_notes): bad bank data, not a fatal
    /// condition.
    pub fn key_on(&mut self) -> MeasureResult<()> {
        if self.state != SynthState::Programmed {
            return Err(self.out_of_order("key_on", "Programmed"));
        }
        let program = self.program.as_ref().expect("programmed state has a program");

        self.keyed = [0; 2];
        let mut clamped = 0;
        for n in 0..program.keyed_notes() {
            let mut note = f64::from(program.play_note) + f64::from(program.voices[n].note_offset);
            if n == 1 && program.pseudo_4op {
                note += program.detune;
            }
            let mut hertz = FREQ_BASE * (FREQ_STEP * note).exp();
            if hertz > FREQ_CEILING {
                clamped += 1;
                hertz = FREQ_CEILING;
            }

            let mut word = 0x2000u32;
            while hertz >= BLOCK_LIMIT {
                hertz /= 2.0;
                word += 0x400;
            }
            word += (hertz + 0.5) as u32;
            self.keyed[n] = word;

            let channel = (n * 3) as u16;
            self.chip
                .write_reg(regs::CH_FNUM_LOW + channel, (word & 0xFF) as u8);
            self.chip
                .write_reg(regs::CH_KEYON_BLOCK + channel, ((word >> 8) & 0xFF) as u8);
        }

        self.clamped_notes += clamped;
        self.state = SynthState::KeyedOn;
        Ok(())
    }

    /// Releases each constituent note, clearing only the key-on bit so the
    /// block/F-number fields keep driving the release envelope.
    pub fn key_off(&mut self) -> MeasureResult<()> {
        if self.state != SynthState::KeyedOn {
            return Err(self.out_of_order("key_off", "KeyedOn"));
        }
        let program = self.program.as_ref().expect("keyed state has a program");

        for n in 0..program.keyed_notes() {
            let channel = (n * 3) as u16;
            let value = ((self.keyed[n] >> 8) & 0xFF) as u8 & !regs::KEYON_BIT;
            self.chip.write_reg(regs::CH_KEYON_BLOCK + channel, value);
        }

        self.state = SynthState::KeyedOff;
        Ok(())
    }

    /// Generates interleaved stereo samples from the chip.
    pub fn generate(&mut self, buffer: &mut [i16]) {
        self.chip.generate(buffer);
    }

    /// Notes whose frequency exceeded the representable ceiling so far.
    pub fn clamped_notes(&self) -> usize {
        self.clamped_notes
    }

    fn out_of_order(&self, call: &'static str, requires: &'static str) -> MeasureError {
        MeasureError::OutOfOrder {
            call,
            requires,
            found: self.state.name(),
        }
    }
}
