//! Transponder identity and the Danish library data model (DS/INF 163-1).
//!
//! Tag user memory is nine 4-byte blocks. Read responses interleave a
//! security byte before every block and the payload bytes inside each block
//! arrive reversed; the codec below flattens that into the 32-byte logical
//! record and back.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::frame::crc16;

/// Blocks occupied by the library record.
pub const CONTENT_BLOCKS: u8 = 9;
pub const BLOCK_SIZE: u8 = 4;

/// 8-byte transponder UID, rendered MAC-style (`E0:04:01:...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(pub [u8; 8]);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("invalid tag id")]
pub struct ParseUidError;

impl FromStr for Uid {
    type Err = ParseUidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        let mut parts = s.split(':');
        for slot in bytes.iter_mut() {
            let part = parts.next().ok_or(ParseUidError)?;
            if part.len() != 2 {
                return Err(ParseUidError);
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseUidError)?;
        }
        if parts.next().is_some() {
            return Err(ParseUidError);
        }
        Ok(Uid(bytes))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A transponder as observed by an inventory round.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    #[serde(rename = "Mac")]
    pub uid: Uid,
    #[serde(rename = "Trtype")]
    pub trtype: u8,
    #[serde(rename = "Dfsid")]
    pub dfsid: u8,
    #[serde(rename = "Content")]
    pub content: Option<TagContent>,
}

/// The process-wide tag map, keyed by the MAC rendering of the UID.
pub type InventoryMap = HashMap<Uid, Tag>;

/// Decoded library record.
///
/// Layout of the 32 logical bytes:
///
/// ```text
/// [0]      version (high nibble) + type (low nibble), 0x11 on write
/// [1]      number of items in the set
/// [2]      1-based sequence number within the set
/// [3..19)  barcode, ASCII, NUL padded
/// [19..21) CRC-16 over bytes [0..19) and [21..32)
/// [21..23) country code
/// [23..32) library code, ASCII, NUL padded
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagContent {
    pub seq_num: u8,
    pub num_items: u8,
    pub barcode: String,
    pub crc: Option<[u8; 2]>,
    pub country: String,
    pub library: String,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("tag data: not enough bytes")]
    TooShort,
}

/// Strip the framing and security bytes from a block-read response and
/// flatten the blocks into their logical order.
fn flatten_blocks(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    if raw.len() < 9 {
        return Err(CodecError::TooShort);
    }
    let blocks = &raw[2..raw.len() - 2];
    let mut data = Vec::with_capacity(blocks.len() / 5 * 4);
    for chunk in blocks.chunks_exact(5) {
        // chunk[0] is the per-block security byte; the block itself is
        // transmitted low byte first.
        data.extend(chunk[1..].iter().rev());
    }
    Ok(data)
}

impl TagContent {
    /// Decode a block-read response body into a library record.
    pub fn decode(raw: &[u8]) -> Result<TagContent, CodecError> {
        let data = flatten_blocks(raw)?;
        if data.len() < 32 {
            return Err(CodecError::TooShort);
        }
        let mut content = TagContent {
            num_items: data[1],
            seq_num: data[2],
            barcode: trim_padding(&data[3..19]),
            crc: Some([data[19], data[20]]),
            country: String::from_utf8_lossy(&data[21..23]).into_owned(),
            library: trim_padding(&data[23..32]),
        };
        // Deichman items labelled before 2016 carry a leading "10" in a
        // full-width barcode; the circulation system expects it stripped.
        if content.country == "NO"
            && content.barcode.len() == 16
            && content.barcode.starts_with("10")
        {
            content.barcode.drain(..2);
        }
        Ok(content)
    }

    /// Encode the record into the 36-byte write payload (nine reversed
    /// blocks, no security bytes — those only exist on read).
    pub fn to_blocks(&self) -> Vec<u8> {
        let mut bs = [0u8; 36];
        bs[0] = 0x11;
        bs[1] = self.num_items;
        bs[2] = self.seq_num;
        copy_padded(&mut bs[3..19], self.barcode.as_bytes());
        copy_padded(&mut bs[21..23], self.country.as_bytes());
        copy_padded(&mut bs[23..32], self.library.as_bytes());
        // The checksum input skips its own slot but runs two bytes past the
        // 32-byte record, picking up the zero padding after the library
        // field. That is what readers in the field expect, so it stays.
        let mut csum = [0u8; 32];
        csum[..19].copy_from_slice(&bs[..19]);
        csum[19..].copy_from_slice(&bs[21..34]);
        let crc = crc16(&csum);
        bs[19..21].copy_from_slice(&crc);

        let mut out = Vec::with_capacity(36);
        for chunk in bs.chunks_exact(4) {
            out.extend(chunk.iter().rev());
        }
        out
    }
}

fn trim_padding(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}
