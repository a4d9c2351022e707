//! Canonical structural instrument fingerprint.
//!
//! The generation-2 duration cache is keyed on this fingerprint rather than
//! on bank/program positions, so instruments renumbered between runs still
//! hit the cache, and identical instruments referenced from many slots share
//! one measurement.

use serde::{Deserialize, Serialize};

use crate::model::{flags, InstrumentEntry};

/// Flag bits that affect how an instrument renders. `IS_BLANK` is a
/// measurement *result* and must never feed back into identity.
const VOICING_FLAGS: u32 = flags::FOUR_OP | flags::PSEUDO_FOUR_OP | flags::RHYTHM_MASK;

/// Order-independent cache key: two instruments sharing an `OperatorKey` are
/// guaranteed to render identically.
///
/// On disk the key is exactly eight little-endian signed 32-bit words (see
/// [`OperatorKey::to_words`]); the two per-voice note offsets share a word,
/// as do the voicing flags and the second-voice detune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorKey {
    /// Operator table indices, -1 for unused slots.
    pub ops: [i32; 4],
    /// Feedback/connection bytes for both voices.
    pub fb_conn: i32,
    /// Voice-1 note offset in the low half, voice-2 in the high half, both as
    /// raw byte values.
    pub note_offsets: i32,
    /// Percussion key number.
    pub percussion_key: i32,
    /// Rendering-relevant flags in the low half, second-voice detune byte in
    /// the high half.
    pub voicing: i32,
}

impl OperatorKey {
    /// Derives the key from an instrument entry.
    pub fn from_entry(inst: &InstrumentEntry) -> Self {
        Self {
            ops: inst.ops,
            fb_conn: i32::from(inst.fb_conn),
            note_offsets: i32::from(inst.note_offset1 as u8)
                | (i32::from(inst.note_offset2 as u8) << 16),
            percussion_key: i32::from(inst.percussion_key),
            voicing: (inst.inst_flags & VOICING_FLAGS) as i32
                | (i32::from(inst.second_voice_detune as u8) << 16),
        }
    }

    /// The key as its eight-word wire representation.
    pub fn to_words(&self) -> [i32; 8] {
        [
            self.ops[0],
            self.ops[1],
            self.ops[2],
            self.ops[3],
            self.fb_conn,
            self.note_offsets,
            self.percussion_key,
            self.voicing,
        ]
    }

    /// Rebuilds a key from its wire representation.
    pub fn from_words(words: [i32; 8]) -> Self {
        Self {
            ops: [words[0], words[1], words[2], words[3]],
            fb_conn: words[4],
            note_offsets: words[5],
            percussion_key: words[6],
            voicing: words[7],
        }
    }
}
