//! Observation payload decoding.
//!
//! Turns raw characteristic values into [`ObservationRecord`]s. Decoding is
//! total: every byte sequence, including the empty one, yields a record.

use bytes::Bytes;
use std::ops::Range;

use crate::utils::hex_pairs;

/// Byte ranges of the optional sub-fields inside a payload.
///
/// Record layouts differ between firmware revisions, so the offsets are
/// configuration rather than constants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordLayout {
    /// Range holding the reporting device id.
    pub device_id: Option<Range<usize>>,
    /// Range holding the observed data.
    pub observed: Option<Range<usize>>,
}

impl RecordLayout {
    /// A layout with no sub-fields.
    pub fn raw() -> Self {
        Self {
            device_id: None,
            observed: None,
        }
    }

    /// The Helena listed-device layout.
    ///
    /// - Bytes 0-5: Device id (6-byte hardware address)
    /// - Bytes 6-15: Observed data (10 bytes)
    pub fn helena() -> Self {
        Self {
            device_id: Some(0..6),
            observed: Some(6..16),
        }
    }

    /// Set the device id range.
    pub fn with_device_id(mut self, range: Range<usize>) -> Self {
        self.device_id = Some(range);
        self
    }

    /// Set the observed data range.
    pub fn with_observed(mut self, range: Range<usize>) -> Self {
        self.observed = Some(range);
        self
    }
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self::helena()
    }
}

/// A decoded characteristic payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservationRecord {
    raw: Bytes,
    hex: String,
    device_id: Option<Bytes>,
    observed: Option<Bytes>,
}

impl ObservationRecord {
    /// Number of bytes in the payload.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Check if the payload was empty.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The raw payload.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The payload as `"%02X "` hex pairs.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The device id slice, if the payload covers it.
    pub fn device_id(&self) -> Option<&[u8]> {
        self.device_id.as_deref()
    }

    /// The device id formatted as a colon-separated hardware address.
    pub fn device_id_string(&self) -> Option<String> {
        self.device_id().map(|id| {
            id.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":")
        })
    }

    /// The observed data slice, if the payload covers it.
    pub fn observed(&self) -> Option<&[u8]> {
        self.observed.as_deref()
    }

    /// The payload interpreted as UTF-8, with invalid sequences replaced.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Decodes payloads according to a [`RecordLayout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationDecoder {
    layout: RecordLayout,
}

impl ObservationDecoder {
    /// Create a decoder for a layout.
    pub fn new(layout: RecordLayout) -> Self {
        Self { layout }
    }

    /// The layout in use.
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Decode a payload.
    ///
    /// A sub-field is only extracted when the payload covers its whole range.
    pub fn decode(&self, data: &[u8]) -> ObservationRecord {
        let raw = Bytes::copy_from_slice(data);
        let device_id = slice_field(&raw, self.layout.device_id.as_ref());
        let observed = slice_field(&raw, self.layout.observed.as_ref());

        ObservationRecord {
            hex: hex_pairs(data),
            raw,
            device_id,
            observed,
        }
    }
}

/// Decode a payload without extracting sub-fields.
pub fn decode(data: &[u8]) -> ObservationRecord {
    ObservationDecoder::new(RecordLayout::raw()).decode(data)
}

fn slice_field(raw: &Bytes, range: Option<&Range<usize>>) -> Option<Bytes> {
    let range = range?;
    if range.start <= range.end && range.end <= raw.len() {
        Some(raw.slice(range.clone()))
    } else {
        None
    }
}
