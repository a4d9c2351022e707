//! Resolved register-level note programs.
//!
//! Both instrument schemas (the indexed operator table and the legacy raw
//! payloads) lower into a [`NoteProgram`]: one or two voices, each a
//! modulator/carrier pair plus a feedback/connection byte, together with the
//! pitch metadata the programmer needs at key-on. Resolving up front keeps
//! the synthesizer schema-agnostic and makes the mid-measurement replay
//! (reset, reprogram, key on again) a pure repetition.

use adldur_bank::{BankDb, InstrumentEntry, LegacyIdentity, OperatorPatch, RawPatch};

use crate::error::{MeasureError, MeasureResult};

/// Default note for melodic instruments in the indexed schema.
const DEFAULT_NOTE: i32 = 60;
/// Default note the legacy schema used before percussion keys were stored.
const LEGACY_DEFAULT_NOTE: i32 = 25;

/// One voice's register payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceProgram {
    /// Modulator operator registers.
    pub modulator: OperatorPatch,
    /// Carrier operator registers.
    pub carrier: OperatorPatch,
    /// Feedback/connection byte for this voice.
    pub fb_conn: u8,
    /// Semitone offset applied to the played note.
    pub note_offset: i16,
}

/// A complete, schema-independent program for one note of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteProgram {
    /// One entry per register voice (two for 4-op and pseudo-4op).
    pub voices: Vec<VoiceProgram>,
    /// Note number to play.
    pub play_note: i32,
    /// Real four-operator voice: both register voices form a single note.
    pub real_4op: bool,
    /// Pseudo-four-operator: two independently pitched notes.
    pub pseudo_4op: bool,
    /// Extra detune applied to the second note's pitch, in semitones.
    pub detune: f64,
}

impl NoteProgram {
    /// Resolves an indexed instrument entry against its operator table.
    ///
    /// Tremolo and vibrato bits are cleared on every operator; their periodic
    /// modulation would corrupt the envelope measurement.
    pub fn from_entry(db: &BankDb, inst: &InstrumentEntry) -> MeasureResult<Self> {
        let voice_count = inst.op_count() / 2;
        let mut voices = Vec::with_capacity(voice_count);
        for voice in 0..voice_count {
            let modulator = resolve_operator(db, inst.ops[voice * 2])?;
            let carrier = resolve_operator(db, inst.ops[voice * 2 + 1])?;
            let note_offset = if voice == 0 {
                i16::from(inst.note_offset1)
            } else {
                i16::from(inst.note_offset2)
            };
            voices.push(VoiceProgram {
                modulator: modulator.without_modulation(),
                carrier: carrier.without_modulation(),
                fb_conn: inst.fb_conn_byte(voice),
                note_offset,
            });
        }

        let play_note = play_note_from_key(inst.percussion_key, DEFAULT_NOTE);
        Ok(Self {
            voices,
            play_note,
            real_4op: inst.is_real_4op(),
            pseudo_4op: inst.is_pseudo_4op(),
            detune: if inst.is_pseudo_4op() {
                f64::from(inst.second_voice_detune)
            } else {
                0.0
            },
        })
    }

    /// Builds a program from a legacy identity's embedded raw payloads.
    pub fn from_raw(identity: &LegacyIdentity) -> Self {
        let mut voices = Vec::with_capacity(identity.voice_count());
        voices.push(voice_from_raw(&identity.patch1));
        if identity.voice_count() == 2 {
            voices.push(voice_from_raw(&identity.patch2));
        }

        let real_4op = identity.real4op && !identity.pseudo4op;
        Self {
            voices,
            play_note: play_note_from_key(identity.note_num, LEGACY_DEFAULT_NOTE),
            real_4op,
            pseudo_4op: identity.pseudo4op,
            detune: if identity.pseudo4op {
                identity.detune()
            } else {
                0.0
            },
        }
    }

    /// Number of notes actually keyed on: a real 4-op voice pair sounds as a
    /// single note.
    pub fn keyed_notes(&self) -> usize {
        if self.real_4op {
            1
        } else {
            self.voices.len()
        }
    }
}

fn resolve_operator(db: &BankDb, index: i32) -> MeasureResult<OperatorPatch> {
    db.operator(index)
        .copied()
        .ok_or(MeasureError::UnknownOperator { index })
}

fn voice_from_raw(patch: &RawPatch) -> VoiceProgram {
    let op = |b20: u8, b60: u8, b80: u8, be0: u8, ksl: u8| OperatorPatch {
        e862: u32::from(b20)
            | (u32::from(b60) << 8)
            | (u32::from(b80) << 16)
            | (u32::from(be0) << 24),
        ksl_level: ksl,
    };
    let d = &patch.data;
    VoiceProgram {
        modulator: op(d[0], d[2], d[4], d[6], d[8]).without_modulation(),
        carrier: op(d[1], d[3], d[5], d[7], d[9]).without_modulation(),
        fb_conn: d[10],
        note_offset: i16::from(patch.finetune),
    }
}

/// Percussion keys above 127 wrap into note range; key 0 plays the schema's
/// default note.
fn play_note_from_key(key: u8, default: i32) -> i32 {
    let note = if key >= 128 {
        i32::from(key) - 128
    } else {
        i32::from(key)
    };
    if note == 0 {
        default
    } else {
        note
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adldur_bank::flags;

    fn db() -> BankDb {
        BankDb {
            operators: vec![
                OperatorPatch {
                    e862: 0x0001_F1C1,
                    ksl_level: 0x10,
                },
                OperatorPatch {
                    e862: 0x0002_E2C2,
                    ksl_level: 0x00,
                },
                OperatorPatch {
                    e862: 0x0003_D303,
                    ksl_level: 0x20,
                },
                OperatorPatch {
                    e862: 0x0004_C404,
                    ksl_level: 0x30,
                },
            ],
            instruments: vec![],
        }
    }

    fn entry(ops: [i32; 4], inst_flags: u32) -> InstrumentEntry {
        InstrumentEntry {
            ops,
            fb_conn: 0x020E,
            note_offset1: 12,
            note_offset2: -12,
            percussion_key: 0,
            inst_flags,
            second_voice_detune: 1,
            delay_on_ms: 0,
            delay_off_ms: 0,
        }
    }

    #[test]
    fn test_two_op_resolves_one_voice() {
        let program = NoteProgram::from_entry(&db(), &entry([0, 1, -1, -1], 0)).unwrap();
        assert_eq!(program.voices.len(), 1);
        assert_eq!(program.keyed_notes(), 1);
        assert_eq!(program.play_note, 60);
        assert_eq!(program.voices[0].fb_conn, 0x0E);
        assert_eq!(program.voices[0].note_offset, 12);
        assert_eq!(program.detune, 0.0);
    }

    #[test]
    fn test_real_4op_keys_one_note_across_two_voices() {
        let program =
            NoteProgram::from_entry(&db(), &entry([0, 1, 2, 3], flags::FOUR_OP)).unwrap();
        assert_eq!(program.voices.len(), 2);
        assert_eq!(program.keyed_notes(), 1);
        assert!(program.real_4op);
        assert_eq!(program.voices[1].fb_conn, 0x02);
        assert_eq!(program.voices[1].note_offset, -12);
    }

    #[test]
    fn test_pseudo_4op_keys_two_detuned_notes() {
        let program = NoteProgram::from_entry(
            &db(),
            &entry([0, 1, 2, 3], flags::FOUR_OP | flags::PSEUDO_FOUR_OP),
        )
        .unwrap();
        assert_eq!(program.keyed_notes(), 2);
        assert!(!program.real_4op);
        assert!(program.pseudo_4op);
        assert_eq!(program.detune, 1.0);
    }

    #[test]
    fn test_modulation_bits_cleared() {
        let mut tremolo_db = db();
        tremolo_db.operators[0].e862 |= 0xC0;
        let program = NoteProgram::from_entry(&tremolo_db, &entry([0, 1, -1, -1], 0)).unwrap();
        assert_eq!(program.voices[0].modulator.reg_20() & 0xC0, 0);
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let err = NoteProgram::from_entry(&db(), &entry([0, 9, -1, -1], 0)).unwrap_err();
        assert!(matches!(err, MeasureError::UnknownOperator { index: 9 }));
    }

    #[test]
    fn test_percussion_key_wraps_above_127() {
        let mut inst = entry([0, 1, -1, -1], 0);
        inst.percussion_key = 128 + 35;
        let program = NoteProgram::from_entry(&db(), &inst).unwrap();
        assert_eq!(program.play_note, 35);
    }

    #[test]
    fn test_raw_program_mirrors_payload_layout() {
        let patch = RawPatch {
            data: [
                0xC1, 0xB2, 0x61, 0x72, 0xF2, 0xA3, 0x04, 0x01, 0x8F, 0x40, 0x0E,
            ],
            finetune: -7,
            diff: false,
        };
        let identity = LegacyIdentity {
            insno1: 0,
            insno2: 0,
            patch1: patch,
            patch2: patch,
            note_num: 0,
            real4op: false,
            pseudo4op: false,
            detune_micro: 0,
        };
        let program = NoteProgram::from_raw(&identity);
        assert_eq!(program.voices.len(), 1);
        assert_eq!(program.play_note, 25);
        let voice = &program.voices[0];
        assert_eq!(voice.modulator.reg_20(), 0xC1 & 0x3F);
        assert_eq!(voice.carrier.reg_20(), 0xB2 & 0x3F);
        assert_eq!(voice.modulator.reg_60(), 0x61);
        assert_eq!(voice.carrier.reg_e0(), 0x01);
        assert_eq!(voice.carrier.ksl_level, 0x40);
        assert_eq!(voice.fb_conn, 0x0E);
        assert_eq!(voice.note_offset, -7);
    }
}
