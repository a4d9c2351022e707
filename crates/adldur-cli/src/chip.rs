//! A bundled register-compatible software FM device.
//!
//! The measurement engine is emulator-agnostic; this module supplies the
//! default device so the binary runs without an external OPL3 core wired in.
//! `LiteOpl` decodes the registers the instrument programmer actually
//! writes - operator characteristics, levels, envelope rates, waveforms,
//! feedback/connection, and the block/F-number key-on encoding - and renders
//! them with two-operator phase-modulation voices and programmed ADSR
//! envelopes. It is an approximation of the real chip's sound, not a
//! fidelity target; envelope shape and register behavior are what the
//! analyzer cares about.

use adldur_measure::chip::{regs, OplChip, CHANNEL_OPERATOR_OFFSETS};

const CHANNELS: usize = 9;
const TWO_PI: f64 = std::f64::consts::TAU;

/// Base time constant for envelope rate 0-shifted scaling: rate 15 is near
/// instant, each step down halves the speed.
const RATE_BASE_SECONDS: f64 = 600.0;

/// Frequency multiplier table indexed by the low nibble of register 0x20.
const MULTIPLIERS: [f64; 16] = [
    0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 10.0, 12.0, 12.0, 15.0, 15.0,
];

/// Phase-modulation depth applied by the modulator, in radians at full level.
const MODULATION_INDEX: f64 = 4.0;

/// Mix gain from the unit-level voice sum to 16-bit output.
const OUTPUT_GAIN: f64 = 8000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum EnvState {
    #[default]
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone, Copy, Default)]
struct Operator {
    reg_20: u8,
    reg_40: u8,
    reg_60: u8,
    reg_80: u8,
    reg_e0: u8,
    state: EnvState,
    level: f64,
    phase: f64,
    feedback: [f64; 2],
}

impl Operator {
    fn key_on(&mut self) {
        self.state = EnvState::Attack;
        self.level = 0.0;
        self.phase = 0.0;
        self.feedback = [0.0; 2];
    }

    fn key_off(&mut self) {
        if self.state != EnvState::Off {
            self.state = EnvState::Release;
        }
    }

    fn sustain_gain(&self) -> f64 {
        // 3 dB of attenuation per sustain-level step.
        let sl = f64::from(self.reg_80 >> 4);
        10f64.powf(-3.0 * sl / 20.0)
    }

    fn advance_envelope(&mut self, dt: f64) {
        match self.state {
            EnvState::Off | EnvState::Sustain => {}
            EnvState::Attack => {
                let rate = self.reg_60 >> 4;
                if rate != 0 {
                    self.level += dt / rate_seconds(rate);
                    if self.level >= 1.0 {
                        self.level = 1.0;
                        self.state = EnvState::Decay;
                    }
                }
            }
            EnvState::Decay => {
                let rate = self.reg_60 & 0x0F;
                if rate != 0 {
                    self.level *= decay_multiplier(rate, dt);
                }
                let sustain = self.sustain_gain();
                if self.level <= sustain || rate == 0 {
                    self.level = self.level.min(sustain);
                    // Without the sustaining-envelope bit the sound keeps
                    // decaying at the release rate.
                    self.state = if self.reg_20 & 0x20 != 0 {
                        EnvState::Sustain
                    } else {
                        EnvState::Release
                    };
                }
            }
            EnvState::Release => {
                let rate = self.reg_80 & 0x0F;
                if rate != 0 {
                    self.level *= decay_multiplier(rate, dt);
                }
                if self.level < 1e-4 {
                    self.level = 0.0;
                    self.state = EnvState::Off;
                }
            }
        }
    }

    fn tick(&mut self, base_freq: f64, dt: f64, feedback_depth: u8, phase_mod: f64) -> f64 {
        self.advance_envelope(dt);
        if self.state == EnvState::Off {
            return 0.0;
        }

        let mult = MULTIPLIERS[(self.reg_20 & 0x0F) as usize];
        self.phase = (self.phase + base_freq * mult * dt).fract();

        let feedback = if feedback_depth != 0 {
            let depth = (1u32 << (feedback_depth - 1)) as f64 / 16.0;
            (self.feedback[0] + self.feedback[1]) * 0.5 * depth
        } else {
            0.0
        };

        let angle = TWO_PI * self.phase + phase_mod + feedback;
        // Full attenuation mutes the operator outright.
        let tl = self.reg_40 & 0x3F;
        let gain = if tl == 0x3F {
            0.0
        } else {
            10f64.powf(-0.75 * f64::from(tl) / 20.0)
        };
        let out = waveform(self.reg_e0 & 0x07, angle) * self.level * gain;

        self.feedback = [self.feedback[1], out];
        out
    }
}

fn rate_seconds(rate: u8) -> f64 {
    RATE_BASE_SECONDS / f64::from(1u32 << rate)
}

fn decay_multiplier(rate: u8, dt: f64) -> f64 {
    (-dt / rate_seconds(rate)).exp()
}

/// The OPL2 waveform variants; anything else falls back to a sine.
fn waveform(select: u8, angle: f64) -> f64 {
    let sine = angle.sin();
    match select {
        1 => sine.max(0.0),
        2 => sine.abs(),
        3 => {
            let quarter = angle.rem_euclid(TWO_PI);
            if quarter < TWO_PI / 4.0 || (quarter >= TWO_PI / 2.0 && quarter < 3.0 * TWO_PI / 4.0) {
                sine.abs()
            } else {
                0.0
            }
        }
        _ => sine,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    fnum: u16,
    block: u8,
    keyed: bool,
    fb_conn: u8,
}

impl Channel {
    /// Hz from the block/F-number encoding at the chip's nominal clock.
    fn frequency(&self) -> f64 {
        f64::from(self.fnum) * 49_716.0 / f64::from(1u32 << (20 - self.block))
    }
}

/// The bundled approximate OPL3-style device.
#[derive(Debug)]
pub struct LiteOpl {
    rate: f64,
    operators: [Operator; CHANNELS * 2],
    channels: [Channel; CHANNELS],
}

impl LiteOpl {
    /// Creates a silent device at a nominal rate; callers configure the real
    /// rate through [`OplChip::set_rate`].
    pub fn new() -> Self {
        Self {
            rate: 49_716.0,
            operators: [Operator::default(); CHANNELS * 2],
            channels: [Channel::default(); CHANNELS],
        }
    }

    fn operator_slot(offset: u16) -> Option<usize> {
        for (channel, slots) in CHANNEL_OPERATOR_OFFSETS.iter().enumerate() {
            if slots[0] == offset {
                return Some(channel * 2);
            }
            if slots[1] == offset {
                return Some(channel * 2 + 1);
            }
        }
        None
    }

    fn write_operator(&mut self, base: u16, offset: u16, value: u8) {
        let slot = match Self::operator_slot(offset) {
            Some(slot) => slot,
            None => return,
        };
        let op = &mut self.operators[slot];
        match base {
            regs::OP_CHARACTERISTIC => op.reg_20 = value,
            regs::OP_LEVEL => op.reg_40 = value,
            regs::OP_ATTACK_DECAY => op.reg_60 = value,
            regs::OP_SUSTAIN_RELEASE => op.reg_80 = value,
            regs::OP_WAVEFORM => op.reg_e0 = value,
            _ => {}
        }
    }

    fn write_channel_key(&mut self, channel: usize, value: u8) {
        let ch = &mut self.channels[channel];
        ch.block = (value >> 2) & 0x07;
        ch.fnum = (ch.fnum & 0x00FF) | (u16::from(value & 0x03) << 8);

        let keyed = value & regs::KEYON_BIT != 0;
        if keyed && !ch.keyed {
            self.operators[channel * 2].key_on();
            self.operators[channel * 2 + 1].key_on();
        } else if !keyed && ch.keyed {
            self.operators[channel * 2].key_off();
            self.operators[channel * 2 + 1].key_off();
        }
        ch.keyed = keyed;
    }
}

impl Default for LiteOpl {
    fn default() -> Self {
        Self::new()
    }
}

impl OplChip for LiteOpl {
    fn set_rate(&mut self, rate: u32) {
        self.rate = f64::from(rate.max(1));
    }

    fn write_reg(&mut self, addr: u16, value: u8) {
        // The second register page only carries the global 4-op/OPL3 mode
        // registers, which this approximation does not model.
        match addr {
            0xA0..=0xA8 => {
                let ch = &mut self.channels[(addr - 0xA0) as usize];
                ch.fnum = (ch.fnum & 0x0300) | u16::from(value);
            }
            0xB0..=0xB8 => self.write_channel_key((addr - 0xB0) as usize, value),
            0xC0..=0xC8 => self.channels[(addr - 0xC0) as usize].fb_conn = value,
            0x20..=0x35 => self.write_operator(regs::OP_CHARACTERISTIC, addr - 0x20, value),
            0x40..=0x55 => self.write_operator(regs::OP_LEVEL, addr - 0x40, value),
            0x60..=0x75 => self.write_operator(regs::OP_ATTACK_DECAY, addr - 0x60, value),
            0x80..=0x95 => self.write_operator(regs::OP_SUSTAIN_RELEASE, addr - 0x80, value),
            0xE0..=0xF5 => self.write_operator(regs::OP_WAVEFORM, addr - 0xE0, value),
            _ => {}
        }
    }

    fn generate(&mut self, buffer: &mut [i16]) {
        let dt = 1.0 / self.rate;
        for frame in buffer.chunks_exact_mut(2) {
            let mut mix = 0.0;
            for channel in 0..CHANNELS {
                let state = self.channels[channel];
                let mod_slot = channel * 2;
                let car_slot = channel * 2 + 1;
                if self.operators[mod_slot].state == EnvState::Off
                    && self.operators[car_slot].state == EnvState::Off
                {
                    continue;
                }

                let base_freq = state.frequency();
                let feedback_depth = (state.fb_conn >> 1) & 0x07;
                let mod_out =
                    self.operators[mod_slot].tick(base_freq, dt, feedback_depth, 0.0);

                if state.fb_conn & 0x01 != 0 {
                    // Additive connection: both operators reach the output.
                    let car_out = self.operators[car_slot].tick(base_freq, dt, 0, 0.0);
                    mix += mod_out + car_out;
                } else {
                    let car_out = self.operators[car_slot].tick(
                        base_freq,
                        dt,
                        0,
                        mod_out * MODULATION_INDEX,
                    );
                    mix += car_out;
                }
            }

            let sample = (mix * OUTPUT_GAIN).clamp(-32_768.0, 32_767.0) as i16;
            frame[0] = sample;
            frame[1] = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adldur_bank::OperatorPatch;
    use adldur_measure::program::VoiceProgram;
    use adldur_measure::{NoteProgram, NoteSynth};

    fn percussive_program() -> NoteProgram {
        // Fast attack, moderate decay, fast release, no sustaining envelope:
        // the note dies on its own.
        let operator = |tl: u8| OperatorPatch {
            e862: 0x008F_FA01,
            ksl_level: tl,
        };
        NoteProgram {
            voices: vec![VoiceProgram {
                modulator: operator(0x18),
                carrier: operator(0x00),
                fb_conn: 0x06,
                note_offset: 0,
            }],
            play_note: 60,
            real_4op: false,
            pseudo_4op: false,
            detune: 0.0,
        }
    }

    fn generate_frames(synth: &mut NoteSynth<LiteOpl>, frames: usize) -> Vec<i16> {
        let mut buffer = vec![0i16; frames * 2];
        synth.generate(&mut buffer);
        buffer
    }

    #[test]
    fn test_keyed_note_produces_audio() {
        let mut synth = NoteSynth::new(LiteOpl::new());
        synth.reset(49_716);
        synth.program(&percussive_program()).unwrap();

        let silent = generate_frames(&mut synth, 1024);
        assert!(silent.iter().all(|&s| s == 0));

        synth.key_on().unwrap();
        let audible = generate_frames(&mut synth, 4096);
        let peak = audible.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 500, "peak was only {}", peak);
    }

    #[test]
    fn test_release_decays_to_silence() {
        let mut synth = NoteSynth::new(LiteOpl::new());
        synth.reset(49_716);
        synth.program(&percussive_program()).unwrap();
        synth.key_on().unwrap();
        generate_frames(&mut synth, 4096);
        synth.key_off().unwrap();

        // Two seconds of release is far beyond the programmed release rate.
        let mut tail = Vec::new();
        for _ in 0..25 {
            tail = generate_frames(&mut synth, 4096);
        }
        assert!(tail.iter().all(|&s| s.unsigned_abs() <= 1));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let render = || {
            let mut synth = NoteSynth::new(LiteOpl::new());
            synth.reset(49_716);
            synth.program(&percussive_program()).unwrap();
            synth.key_on().unwrap();
            generate_frames(&mut synth, 8192)
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn test_zero_attack_rate_stays_silent() {
        let mut program = percussive_program();
        program.voices[0].carrier.e862 &= !0x0000_F000;
        program.voices[0].modulator.e862 &= !0x0000_F000;

        let mut synth = NoteSynth::new(LiteOpl::new());
        synth.reset(49_716);
        synth.program(&program).unwrap();
        synth.key_on().unwrap();
        let audio = generate_frames(&mut synth, 8192);
        assert!(audio.iter().all(|&s| s == 0));
    }
}
