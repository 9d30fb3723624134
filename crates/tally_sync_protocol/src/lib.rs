//! # Tally Sync Protocol
//!
//! Data types shared by every part of the Tally sync engine.
//!
//! This crate provides:
//! - The entity records ([`Challenge`], [`Entry`], [`Follow`]) and the
//!   [`Record`] trait tying each to its [`Collection`]
//! - [`PendingChange`], the closed set of local intents waiting for the
//!   server, and [`Confirmation`], what the server answers
//! - Local payload validation, run before any optimistic write
//! - CBOR encoding of stored values
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod error;
mod model;
mod validate;

pub use change::{ChangeKind, Confirmation, PendingChange};
pub use codec::{from_cbor, to_cbor};
pub use error::{ProtocolError, ProtocolResult};
pub use model::{
    is_provisional_id, provisional_id, Challenge, Collection, Entity, EntityKey, Entry, EntrySet,
    Feeling, Follow, Record, Timeframe, TimeframeUnit, Visibility, PROVISIONAL_PREFIX,
};
pub use validate::{is_valid_color, is_valid_date, MAX_NAME_LEN, MAX_NOTE_LEN};
