//! Declared-silence heuristic.
//!
//! Some bank formats ship placeholder instruments that can never produce
//! audible output. The measurement engine cross-checks its computed no-sound
//! verdict against this register-level prediction, so silent placeholders
//! that measure as audible (or vice versa) surface as data-quality anomalies.

use crate::model::{BankDb, InstrumentEntry, OperatorPatch};

/// Connection bit in the 0xC0 feedback/connection byte: set = additive (both
/// operators are carriers), clear = FM (only the second operator is heard).
const CONN_ADDITIVE: u8 = 0x01;

fn operator_is_audible(op: &OperatorPatch) -> bool {
    // A fully attenuated or never-attacking carrier contributes nothing.
    op.total_level() != 0x3F && op.attack_rate() != 0
}

fn voice_is_audible(db: &BankDb, inst: &InstrumentEntry, voice: usize) -> bool {
    let op1 = db.operator(inst.ops[voice * 2]);
    let op2 = db.operator(inst.ops[voice * 2 + 1]);
    let (op1, op2) = match (op1, op2) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    if inst.fb_conn_byte(voice) & CONN_ADDITIVE != 0 {
        operator_is_audible(op1) || operator_is_audible(op2)
    } else {
        operator_is_audible(op2)
    }
}

/// Predicts, from register content alone, whether the instrument is silent.
///
/// Real four-operator topologies route carriers across both pairs; this
/// treats each pair independently, which is exact for two-op and pseudo-4op
/// instruments and conservative for the four 4-op connection modes.
pub fn is_silent(db: &BankDb, inst: &InstrumentEntry) -> bool {
    let voices = inst.op_count() / 2;
    (0..voices).all(|v| !voice_is_audible(db, inst, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with(ops: Vec<OperatorPatch>, fb_conn: u16) -> (BankDb, InstrumentEntry) {
        let inst = InstrumentEntry {
            ops: [0, 1, -1, -1],
            fb_conn,
            note_offset1: 0,
            note_offset2: 0,
            percussion_key: 0,
            inst_flags: 0,
            second_voice_detune: 0,
            delay_on_ms: 0,
            delay_off_ms: 0,
        };
        (
            BankDb {
                operators: ops,
                instruments: vec![inst],
            },
            inst,
        )
    }

    fn audible_op() -> OperatorPatch {
        OperatorPatch {
            e862: 0x0000_F100,
            ksl_level: 0x10,
        }
    }

    fn muted_op() -> OperatorPatch {
        OperatorPatch {
            e862: 0x0000_F100,
            ksl_level: 0x3F,
        }
    }

    #[test]
    fn test_fm_voice_silent_when_carrier_muted() {
        let (db, inst) = db_with(vec![audible_op(), muted_op()], 0x00);
        assert!(is_silent(&db, &inst));
    }

    #[test]
    fn test_fm_voice_audible_when_carrier_live() {
        let (db, inst) = db_with(vec![muted_op(), audible_op()], 0x00);
        assert!(!is_silent(&db, &inst));
    }

    #[test]
    fn test_additive_voice_audible_if_either_op_live() {
        let (db, inst) = db_with(vec![audible_op(), muted_op()], 0x01);
        assert!(!is_silent(&db, &inst));
    }

    #[test]
    fn test_zero_attack_rate_is_silent() {
        let never_attacks = OperatorPatch {
            e862: 0x0000_0F00,
            ksl_level: 0x00,
        };
        let (db, inst) = db_with(vec![audible_op(), never_attacks], 0x00);
        assert!(is_silent(&db, &inst));
    }
}
