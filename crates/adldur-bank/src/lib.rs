//! adldur instrument bank model.
//!
//! This crate holds the data the measurement engine operates on:
//!
//! - [`model`] - the indexed database: a deduplicated operator table plus
//!   instrument entries with structural flags and the mutable duration slots
//!   the measurement engine writes back into.
//! - [`key`] - the canonical structural fingerprint the generation-2 duration
//!   cache is keyed on.
//! - [`legacy`] - the raw-payload schema the generation-1 duration cache is
//!   keyed on, with content-based reconciliation lookups.
//! - [`silence`] - the register-level declared-silence prediction used to
//!   cross-check measured no-sound verdicts.
//!
//! Bank-format importers and the instrument-table exporter live outside this
//! workspace; the database crosses those process boundaries as JSON.

pub mod error;
pub mod key;
pub mod legacy;
pub mod model;
pub mod silence;

pub use error::{BankError, BankResult};
pub use key::OperatorKey;
pub use legacy::{LegacyBank, LegacyIdentity, RawPatch, DETUNE_SCALE};
pub use model::{flags, BankDb, InstrumentEntry, OperatorPatch};
pub use silence::is_silent;
