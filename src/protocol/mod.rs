//! Protocol module for decoding characteristic payloads.
//!
//! This module contains the implementations for:
//! - Observation payload decoding
//! - Record layouts for firmware-specific sub-fields

pub mod observation;

pub use observation::{decode, ObservationDecoder, ObservationRecord, RecordLayout};
