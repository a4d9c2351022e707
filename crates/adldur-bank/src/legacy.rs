//! Legacy (generation-1) instrument schema.
//!
//! Before the indexed operator table existed, instruments were identified by
//! one or two raw 11-byte register payloads plus pitch metadata. The
//! generation-1 duration-cache format still speaks this schema, so the model
//! is kept alive for cache reconciliation and for the raw programming path.
//!
//! Payload byte order, alternating between the voice's two operators:
//! 0x20, 0x20, 0x60, 0x60, 0x80, 0x80, 0xE0, 0xE0, 0x40, 0x40, then the
//! shared 0xC0 feedback/connection byte.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::{BankDb, InstrumentEntry, OperatorPatch};

/// Scale factor between the stored integer detune and semitones.
pub const DETUNE_SCALE: i64 = 1_000_000;

/// Raw two-operator register payload for one voice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawPatch {
    /// The 11 register bytes described in the module docs.
    pub data: [u8; 11],
    /// Semitone offset applied to the voice's note.
    pub finetune: i8,
    /// Marks a percussion variant that differs from its melodic twin.
    pub diff: bool,
}

impl RawPatch {
    /// Builds the raw payload from a pair of operator patches and the voice's
    /// feedback/connection byte.
    pub fn from_operators(op1: &OperatorPatch, op2: &OperatorPatch, fb_conn: u8, finetune: i8) -> Self {
        Self {
            data: [
                op1.reg_20(),
                op2.reg_20(),
                op1.reg_60(),
                op2.reg_60(),
                op1.reg_80(),
                op2.reg_80(),
                op1.reg_e0(),
                op2.reg_e0(),
                op1.ksl_level,
                op2.ksl_level,
                fb_conn,
            ],
            finetune,
            diff: false,
        }
    }
}

/// Full structural identity of a legacy instrument. Used as the generation-1
/// cache key; the detune is stored scaled by [`DETUNE_SCALE`] so the identity
/// stays hashable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LegacyIdentity {
    /// Patch-table index of the first voice.
    pub insno1: u64,
    /// Patch-table index of the second voice (equal to `insno1` for
    /// single-voice instruments).
    pub insno2: u64,
    /// Raw payload of the first voice, embedded for verification.
    pub patch1: RawPatch,
    /// Raw payload of the second voice, embedded for verification.
    pub patch2: RawPatch,
    /// Note number to play (percussion key, or 0 for the default).
    pub note_num: u8,
    /// Real four-operator voice.
    pub real4op: bool,
    /// Pseudo-four-operator voice pair.
    pub pseudo4op: bool,
    /// Second-voice detune in millionths of a semitone.
    pub detune_micro: i64,
}

impl LegacyIdentity {
    /// Second-voice detune in semitones.
    pub fn detune(&self) -> f64 {
        self.detune_micro as f64 / DETUNE_SCALE as f64
    }

    /// Number of distinct voices this identity programs.
    pub fn voice_count(&self) -> usize {
        if self.insno1 == self.insno2 {
            1
        } else {
            2
        }
    }
}

/// Legacy view of the current instrument data, used to reconcile generation-1
/// cache records after instruments have been renumbered between runs.
#[derive(Debug, Clone, Default)]
pub struct LegacyBank {
    /// Patch content by legacy index.
    pub patches: Vec<RawPatch>,
    /// Every instrument identity currently known.
    pub instruments: HashSet<LegacyIdentity>,
}

impl LegacyBank {
    /// Looks up patch content by legacy index.
    pub fn patch(&self, index: u64) -> Option<&RawPatch> {
        usize::try_from(index).ok().and_then(|i| self.patches.get(i))
    }

    /// Finds the current index of a patch by content, tolerating renumbering.
    pub fn find_patch(&self, content: &RawPatch) -> Option<u64> {
        self.patches.iter().position(|p| p == content).map(|i| i as u64)
    }

    /// True if the identity matches an instrument currently in the bank.
    pub fn contains(&self, identity: &LegacyIdentity) -> bool {
        self.instruments.contains(identity)
    }

    /// Lowers an indexed database into the legacy tables. Instruments with
    /// unresolvable operator references are skipped; they cannot have valid
    /// cache entries either.
    pub fn from_db(db: &BankDb) -> Self {
        let mut bank = LegacyBank::default();
        for inst in &db.instruments {
            if let Some(identity) = bank.intern_instrument(db, inst) {
                bank.instruments.insert(identity);
            }
        }
        bank
    }

    fn intern_instrument(&mut self, db: &BankDb, inst: &InstrumentEntry) -> Option<LegacyIdentity> {
        let voices = inst.op_count() / 2;
        let mut patches = [RawPatch::default(); 2];
        let mut indices = [0u64; 2];
        for voice in 0..voices {
            let op1 = db.operator(inst.ops[voice * 2])?;
            let op2 = db.operator(inst.ops[voice * 2 + 1])?;
            let finetune = if voice == 0 {
                inst.note_offset1
            } else {
                inst.note_offset2
            };
            let patch = RawPatch::from_operators(op1, op2, inst.fb_conn_byte(voice), finetune);
            indices[voice] = self.intern_patch(patch);
            patches[voice] = patch;
        }
        if voices == 1 {
            indices[1] = indices[0];
            patches[1] = patches[0];
        }

        Some(LegacyIdentity {
            insno1: indices[0],
            insno2: indices[1],
            patch1: patches[0],
            patch2: patches[1],
            note_num: inst.percussion_key,
            real4op: inst.is_real_4op(),
            pseudo4op: inst.is_pseudo_4op(),
            detune_micro: inst.second_voice_detune as i64 * DETUNE_SCALE,
        })
    }

    fn intern_patch(&mut self, patch: RawPatch) -> u64 {
        match self.find_patch(&patch) {
            Some(i) => i,
            None => {
                self.patches.push(patch);
                (self.patches.len() - 1) as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flags;

    fn sample_db() -> BankDb {
        BankDb {
            operators: vec![
                OperatorPatch {
                    e862: 0x0001_F101,
                    ksl_level: 0x10,
                },
                OperatorPatch {
                    e862: 0x0002_E202,
                    ksl_level: 0x00,
                },
                OperatorPatch {
                    e862: 0x0003_D303,
                    ksl_level: 0x20,
                },
            ],
            instruments: vec![
                InstrumentEntry {
                    ops: [0, 1, -1, -1],
                    fb_conn: 0x0E,
                    note_offset1: 12,
                    note_offset2: 0,
                    percussion_key: 0,
                    inst_flags: 0,
                    second_voice_detune: 0,
                    delay_on_ms: 0,
                    delay_off_ms: 0,
                },
                InstrumentEntry {
                    ops: [0, 1, 2, 1],
                    fb_conn: 0x0E_02,
                    note_offset1: 0,
                    note_offset2: -12,
                    percussion_key: 35,
                    inst_flags: flags::PSEUDO_FOUR_OP,
                    second_voice_detune: 1,
                    delay_on_ms: 0,
                    delay_off_ms: 0,
                },
            ],
        }
    }

    #[test]
    fn test_raw_patch_layout() {
        let op1 = OperatorPatch {
            e862: 0x04F2_61C1,
            ksl_level: 0x8F,
        };
        let op2 = OperatorPatch {
            e862: 0x01A3_72B2,
            ksl_level: 0x40,
        };
        let patch = RawPatch::from_operators(&op1, &op2, 0x0E, 12);
        assert_eq!(
            patch.data,
            [0xC1, 0xB2, 0x61, 0x72, 0xF2, 0xA3, 0x04, 0x01, 0x8F, 0x40, 0x0E]
        );
        assert_eq!(patch.finetune, 12);
    }

    #[test]
    fn test_from_db_interns_shared_patches() {
        let db = sample_db();
        let bank = LegacyBank::from_db(&db);

        // Instrument 0's single voice and instrument 1's first voice share
        // operator content but differ in finetune and therefore intern apart.
        assert_eq!(bank.instruments.len(), 2);
        for identity in &bank.instruments {
            assert_eq!(bank.patch(identity.insno1), Some(&identity.patch1));
            assert_eq!(bank.patch(identity.insno2), Some(&identity.patch2));
        }
    }

    #[test]
    fn test_find_patch_by_content() {
        let db = sample_db();
        let bank = LegacyBank::from_db(&db);

        for (i, patch) in bank.patches.iter().enumerate() {
            assert_eq!(bank.find_patch(patch), Some(i as u64));
        }
        let missing = RawPatch {
            data: [0xFF; 11],
            finetune: 0,
            diff: false,
        };
        assert_eq!(bank.find_patch(&missing), None);
    }

    #[test]
    fn test_single_voice_identity_repeats_patch() {
        let db = sample_db();
        let bank = LegacyBank::from_db(&db);
        let two_op = bank
            .instruments
            .iter()
            .find(|i| !i.pseudo4op)
            .expect("two-op instrument present");
        assert_eq!(two_op.insno1, two_op.insno2);
        assert_eq!(two_op.voice_count(), 1);
        assert_eq!(two_op.patch1, two_op.patch2);
    }
}
