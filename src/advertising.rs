//! Advertising frame parser.
//!
//! A BLE advertising payload is a run of `[length][type][payload...]`
//! structures where `length` counts the type byte plus the payload. A zero
//! length byte marks the start of padding. Radio stacks often hand us frames
//! that are padded or cut short, so a structure running past the end of the
//! buffer ends parsing instead of failing the whole frame.

use std::collections::BTreeMap;
use tracing::debug;

/// AD type "Service Data - 16-bit UUID".
pub const AD_TYPE_SERVICE_DATA_16: u8 = 0x16;

/// AD type "Manufacturer Specific Data".
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// One length-prefixed unit of an advertising frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    /// Always `declared_length - 1` bytes.
    pub payload: &'a [u8],
}

impl AdStructure<'_> {
    /// Number of frame bytes this structure occupies, length byte included.
    pub fn encoded_len(&self) -> usize {
        2 + self.payload.len()
    }
}

/// Iterator over the structures of a raw advertising frame.
///
/// Stops at buffer end, at a zero length byte, or at the first structure that
/// does not fit in the buffer. In the last case [`AdStructures::truncated`]
/// reports `true` afterwards.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    data: &'a [u8],
    cursor: usize,
    truncated: bool,
    done: bool,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            truncated: false,
            done: false,
        }
    }

    /// Bytes covered by the structures yielded so far.
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = AdStructure<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.data.len() {
            return None;
        }

        let length = self.data[self.cursor] as usize;
        if length == 0 {
            self.done = true;
            return None;
        }

        let end = self.cursor + 1 + length;
        if end > self.data.len() {
            self.truncated = true;
            self.done = true;
            return None;
        }

        let structure = AdStructure {
            ad_type: self.data[self.cursor + 1],
            payload: &self.data[self.cursor + 2..end],
        };
        self.cursor = end;
        Some(structure)
    }
}

/// Parsed view of one advertising frame, keyed by AD type.
///
/// A type that appears more than once keeps its last payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData<'a> {
    structures: BTreeMap<u8, &'a [u8]>,
    consumed: usize,
    truncated: bool,
}

impl<'a> AdvertisingData<'a> {
    pub fn get(&self, ad_type: u8) -> Option<&'a [u8]> {
        self.structures.get(&ad_type).copied()
    }

    pub fn service_data(&self) -> Option<&'a [u8]> {
        self.get(AD_TYPE_SERVICE_DATA_16)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &'a [u8])> + '_ {
        self.structures.iter().map(|(t, p)| (*t, *p))
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    /// Frame bytes covered by complete structures.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Whether the frame ended in the middle of a structure.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Parse a raw advertising frame into its structures.
///
/// Never fails: malformed tails are dropped and flagged as truncated.
pub fn parse_frame(data: &[u8]) -> AdvertisingData<'_> {
    let mut iter = AdStructures::new(data);
    let structures: BTreeMap<u8, &[u8]> = iter
        .by_ref()
        .map(|s| (s.ad_type, s.payload))
        .collect();

    if iter.truncated() {
        debug!(
            consumed = iter.consumed(),
            len = data.len(),
            "advertising frame truncated mid-structure"
        );
    }

    AdvertisingData {
        structures,
        consumed: iter.consumed(),
        truncated: iter.truncated(),
    }
}

/// Encode structures back into the radio-level frame layout.
///
/// Payloads longer than 254 bytes cannot be represented and are skipped.
pub fn encode_structures<'a, I>(structures: I) -> Vec<u8>
where
    I: IntoIterator<Item = (u8, &'a [u8])>,
{
    let mut frame = Vec::new();
    for (ad_type, payload) in structures {
        let Ok(length) = u8::try_from(payload.len() + 1) else {
            continue;
        };
        frame.push(length);
        frame.push(ad_type);
        frame.extend_from_slice(payload);
    }
    frame
}
