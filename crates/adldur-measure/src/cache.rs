//! The persistent duration cache.
//!
//! Two incompatible file generations coexist. Generation 1 is keyed on the
//! full legacy identity and embeds the raw operator payloads so entries can
//! be reconciled when instruments were renumbered between runs; generation 2
//! is keyed on the structural [`OperatorKey`] and needs no reconciliation.
//! The loader detects the magic header and dispatches to the matching
//! decoder.
//!
//! A missing, truncated or corrupt file is never fatal: the loader reports a
//! recoverable error, leaves the cache empty, and every instrument is simply
//! measured again.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use adldur_bank::{LegacyBank, LegacyIdentity, OperatorKey, RawPatch};

use crate::analysis::DurationInfo;
use crate::error::{MeasureError, MeasureResult};

/// Magic header of generation-1 cache files.
pub const CACHE_MAGIC_V1: &[u8; 32] = b"ADLMIDI-DURATION-CACHE-FILE-V1.0";
/// Magic header of generation-2 cache files.
pub const CACHE_MAGIC_V2: &[u8; 32] = b"ADLMIDI-DURATION-CACHE-FILE-V2.0";

/// Size of one generation-1 record, for entry counting.
const V1_RECORD_SIZE: u64 = 98;
/// Size of one generation-2 record.
const V2_RECORD_SIZE: u64 = 37;

/// Which on-disk format a cache file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheGeneration {
    /// Legacy identity-keyed format with reconciliation payloads.
    V1,
    /// Operator-key format.
    V2,
}

impl std::fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheGeneration::V1 => write!(f, "generation 1"),
            CacheGeneration::V2 => write!(f, "generation 2"),
        }
    }
}

#[derive(Debug, Default)]
struct CacheMaps {
    legacy: HashMap<LegacyIdentity, DurationInfo>,
    keyed: HashMap<OperatorKey, DurationInfo>,
}

/// Process-wide duration cache, shared across worker threads behind one
/// mutex. Insertions are commutative: identical keys always carry identical
/// measurements, so last-writer timing is irrelevant.
#[derive(Debug, Default)]
pub struct DurationCache {
    maps: Mutex<CacheMaps>,
}

impl DurationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a generation-2 entry.
    pub fn lookup_keyed(&self, key: &OperatorKey) -> Option<DurationInfo> {
        self.maps.lock().unwrap().keyed.get(key).copied()
    }

    /// Stores a generation-2 entry.
    pub fn insert_keyed(&self, key: OperatorKey, info: DurationInfo) {
        self.maps.lock().unwrap().keyed.insert(key, info);
    }

    /// Looks up a generation-1 entry.
    pub fn lookup_legacy(&self, identity: &LegacyIdentity) -> Option<DurationInfo> {
        self.maps.lock().unwrap().legacy.get(identity).copied()
    }

    /// Stores a generation-1 entry.
    pub fn insert_legacy(&self, identity: LegacyIdentity, info: DurationInfo) {
        self.maps.lock().unwrap().legacy.insert(identity, info);
    }

    /// Number of generation-2 entries.
    pub fn keyed_len(&self) -> usize {
        self.maps.lock().unwrap().keyed.len()
    }

    /// Number of generation-1 entries.
    pub fn legacy_len(&self) -> usize {
        self.maps.lock().unwrap().legacy.len()
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        let mut maps = self.maps.lock().unwrap();
        maps.legacy.clear();
        maps.keyed.clear();
    }

    /// Loads whichever generation `path` holds, replacing the cache contents.
    ///
    /// Generation-1 records are reconciled against `legacy`; entries that
    /// cannot be confidently remapped to a currently-known instrument are
    /// dropped, forcing a recompute. On any error the cache is left empty.
    pub fn load(&self, path: &Path, legacy: &LegacyBank) -> MeasureResult<CacheGeneration> {
        self.clear();

        let mut reader = BufReader::new(File::open(path)?);
        let generation = read_magic(&mut reader)?;
        let result = match generation {
            CacheGeneration::V1 => self.load_v1(&mut reader, legacy),
            CacheGeneration::V2 => self.load_v2(&mut reader),
        };
        if result.is_err() {
            self.clear();
        }
        result.map(|_| generation)
    }

    /// Saves the operator-keyed entries in the generation-2 format.
    pub fn save_keyed(&self, path: &Path) -> MeasureResult<()> {
        let maps = self.maps.lock().unwrap();
        let mut writer = BufWriter::new(File::create(path)?);

        writer.write_all(CACHE_MAGIC_V2)?;
        writer.write_u32::<LittleEndian>(maps.keyed.len() as u32)?;
        for (key, info) in &maps.keyed {
            for word in key.to_words() {
                writer.write_i32::<LittleEndian>(word)?;
            }
            writer.write_u16::<LittleEndian>(clamp_ms(info.ms_sound_kon))?;
            writer.write_u16::<LittleEndian>(clamp_ms(info.ms_sound_koff))?;
            writer.write_u8(u8::from(info.nosound))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Saves the legacy entries in the generation-1 format.
    pub fn save_legacy(&self, path: &Path) -> MeasureResult<()> {
        let maps = self.maps.lock().unwrap();
        let mut writer = BufWriter::new(File::create(path)?);

        writer.write_all(CACHE_MAGIC_V1)?;
        for (identity, info) in &maps.legacy {
            writer.write_u64::<LittleEndian>(identity.insno1)?;
            writer.write_u64::<LittleEndian>(identity.insno2)?;
            write_patch(&mut writer, &identity.patch1)?;
            write_patch(&mut writer, &identity.patch2)?;
            writer.write_u8(identity.note_num)?;
            writer.write_u8(u8::from(identity.real4op))?;
            writer.write_u8(u8::from(identity.pseudo4op))?;
            writer.write_i64::<LittleEndian>(identity.detune_micro)?;
            // Verification payloads: the identity embeds the operator bytes,
            // so both voices are always available for reconciliation.
            writer.write_all(&[1, 1])?;
            write_patch(&mut writer, &identity.patch1)?;
            write_patch(&mut writer, &identity.patch2)?;
            writer.write_i64::<LittleEndian>(info.ms_sound_kon)?;
            writer.write_i64::<LittleEndian>(info.ms_sound_koff)?;
            writer.write_u8(u8::from(info.nosound))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn load_v1<R: Read>(&self, reader: &mut R, legacy: &LegacyBank) -> MeasureResult<()> {
        loop {
            // A clean end of file lands exactly on a record boundary.
            let insno1 = match reader.read_u64::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let insno2 = record_field(reader.read_u64::<LittleEndian>(), "record identity")?;
            let patch1 = read_patch(reader)?;
            let patch2 = read_patch(reader)?;
            let note_num = record_field(reader.read_u8(), "record note")?;
            let real4op = record_field(reader.read_u8(), "record flags")? != 0;
            let pseudo4op = record_field(reader.read_u8(), "record flags")? != 0;
            let detune_micro = record_field(reader.read_i64::<LittleEndian>(), "record detune")?;

            let mut found_stored = [0u8; 2];
            record_field(reader.read_exact(&mut found_stored), "record found flags")?;
            let found_stored = [found_stored[0] != 0, found_stored[1] != 0];
            let verify1 = read_patch(reader)?;
            let verify2 = read_patch(reader)?;

            let kon = record_field(reader.read_i64::<LittleEndian>(), "record durations")?;
            let koff = record_field(reader.read_i64::<LittleEndian>(), "record durations")?;
            let nosound = record_field(reader.read_u8(), "record durations")? != 0;

            let mut identity = LegacyIdentity {
                insno1,
                insno2,
                patch1,
                patch2,
                note_num,
                real4op,
                pseudo4op,
                detune_micro,
            };

            if reconcile(&mut identity, legacy, found_stored, &verify1, &verify2) {
                self.maps
                    .lock()
                    .unwrap()
                    .legacy
                    .insert(identity, DurationInfo::from_cached(kon, koff, nosound));
            }
        }
        Ok(())
    }

    fn load_v2<R: Read>(&self, reader: &mut R) -> MeasureResult<()> {
        let count = record_field(reader.read_u32::<LittleEndian>(), "entry count")?;
        for _ in 0..count {
            let mut words = [0i32; 8];
            for word in &mut words {
                *word = record_field(reader.read_i32::<LittleEndian>(), "entry key")?;
            }
            let kon = record_field(reader.read_u16::<LittleEndian>(), "entry durations")?;
            let koff = record_field(reader.read_u16::<LittleEndian>(), "entry durations")?;
            let nosound = record_field(reader.read_u8(), "entry durations")? == 0x01;

            self.maps.lock().unwrap().keyed.insert(
                OperatorKey::from_words(words),
                DurationInfo::from_cached(i64::from(kon), i64::from(koff), nosound),
            );
        }
        Ok(())
    }
}

/// Identifies the generation and entry count of a cache file without a bank
/// database.
pub fn probe(path: &Path) -> MeasureResult<(CacheGeneration, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let generation = read_magic(&mut reader)?;
    let count = match generation {
        CacheGeneration::V1 => (len - 32) / V1_RECORD_SIZE,
        CacheGeneration::V2 => u64::from(record_field(
            reader.read_u32::<LittleEndian>(),
            "entry count",
        )?)
        .min((len.saturating_sub(36)) / V2_RECORD_SIZE),
    };
    Ok((generation, count))
}

fn read_magic<R: Read>(reader: &mut R) -> MeasureResult<CacheGeneration> {
    let mut magic = [0u8; 32];
    reader
        .read_exact(&mut magic)
        .map_err(|_| MeasureError::CacheTruncated {
            context: "magic header",
        })?;
    if &magic == CACHE_MAGIC_V1 {
        Ok(CacheGeneration::V1)
    } else if &magic == CACHE_MAGIC_V2 {
        Ok(CacheGeneration::V2)
    } else {
        Err(MeasureError::CacheMagic)
    }
}

fn record_field<T>(result: io::Result<T>, context: &'static str) -> MeasureResult<T> {
    result.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            MeasureError::CacheTruncated { context }
        } else {
            MeasureError::Io(e)
        }
    })
}

fn write_patch<W: Write>(writer: &mut W, patch: &RawPatch) -> io::Result<()> {
    writer.write_all(&patch.data)?;
    writer.write_u8(patch.finetune as u8)?;
    writer.write_u8(u8::from(patch.diff))
}

fn read_patch<R: Read>(reader: &mut R) -> MeasureResult<RawPatch> {
    let mut data = [0u8; 11];
    record_field(reader.read_exact(&mut data), "record operator payload")?;
    let finetune = record_field(reader.read_u8(), "record operator payload")? as i8;
    let diff = record_field(reader.read_u8(), "record operator payload")? != 0;
    Ok(RawPatch {
        data,
        finetune,
        diff,
    })
}

fn clamp_ms(ms: i64) -> u16 {
    ms.clamp(0, i64::from(u16::MAX)) as u16
}

/// Remaps a stored record onto the current bank, tolerating instruments that
/// were renumbered between runs. Returns false when the record cannot be
/// confidently matched to a currently-known instrument.
fn reconcile(
    identity: &mut LegacyIdentity,
    legacy: &LegacyBank,
    found_stored: [bool; 2],
    verify1: &RawPatch,
    verify2: &RawPatch,
) -> bool {
    if !found_stored[0] && !found_stored[1] {
        return false;
    }

    let mut insno = [identity.insno1, identity.insno2];
    let mut found = [
        legacy.patch(identity.insno1) == Some(verify1),
        legacy.patch(identity.insno2) == Some(verify2),
    ];

    let mut matches = if found == found_stored {
        true
    } else {
        // The stored indices no longer point at the stored content; fall back
        // to matching the content itself.
        if found_stored[0] {
            if let Some(index) = legacy.find_patch(verify1) {
                found[0] = true;
                insno[0] = index;
            }
        }
        if found_stored[1] {
            if let Some(index) = legacy.find_patch(verify2) {
                found[1] = true;
                insno[1] = index;
            }
        }
        found[0] && (found[1] || !found_stored[1])
    };

    if matches {
        identity.insno1 = insno[0];
        identity.insno2 = insno[1];
        matches = legacy.contains(identity);
    }
    matches
}
