// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EXIF item payloads: a TIFF header offset followed by a TIFF stream.
//!
//! Tags are collected into a flat map keyed by IFD and tag number. Values
//! are decoded by type only; tag meanings are left to the caller.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

const EXIF_IFD_POINTER: u16 = 0x8769;
const GPS_IFD_POINTER: u16 = 0x8825;
const INTEROP_IFD_POINTER: u16 = 0xA005;

/// Bytes per entry: tag, type, count, value-or-offset.
const IFD_ENTRY_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifByteOrder {
    /// "II"
    LittleEndian,
    /// "MM"
    BigEndian,
}

/// The directory a tag was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IfdKind {
    /// IFD0, the main image.
    Primary,
    /// IFD1, usually the thumbnail.
    Thumbnail,
    Exif,
    Gps,
    Interop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExifTagId {
    pub ifd: IfdKind,
    pub tag: u16,
}

/// A decoded tag value. TIFF types 1 to 12.
#[derive(Debug, Clone, PartialEq)]
pub enum ExifValue {
    Byte(std::vec::Vec<u8>),
    /// NUL terminators removed.
    Ascii(std::string::String),
    Short(std::vec::Vec<u16>),
    Long(std::vec::Vec<u32>),
    Rational(std::vec::Vec<(u32, u32)>),
    SByte(std::vec::Vec<i8>),
    Undefined(std::vec::Vec<u8>),
    SShort(std::vec::Vec<i16>),
    SLong(std::vec::Vec<i32>),
    SRational(std::vec::Vec<(i32, i32)>),
    Float(std::vec::Vec<f32>),
    Double(std::vec::Vec<f64>),
}

impl ExifValue {
    /// First value as an unsigned integer, for BYTE, SHORT and LONG tags.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Byte(v) => v.first().copied().map(u32::from),
            Self::Short(v) => v.first().copied().map(u32::from),
            Self::Long(v) => v.first().copied(),
            _ => None,
        }
    }
}

/// Size in bytes of one value of TIFF field type `ty`.
fn type_size(ty: u16) -> Option<usize> {
    Some(match ty {
        1 | 2 | 6 | 7 => 1,
        3 | 8 => 2,
        4 | 9 | 11 => 4,
        5 | 10 | 12 => 8,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExifData {
    pub byte_order: ExifByteOrder,
    pub tags: BTreeMap<ExifTagId, ExifValue>,
}

impl ExifData {
    /// Parses an 'Exif' item payload, which starts with the big-endian
    /// offset of the TIFF header from the end of that field.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let offset = crate::reader::be_u32_at(payload, 0)?;
        let start = usize::try_from(offset)?
            .checked_add(4)
            .ok_or(Error::InvalidData("exif tiff header offset overflow"))?;
        let tiff = payload.get(start..).ok_or(Error::InvalidData("exif tiff header offset past the end"))?;
        Self::parse_tiff(tiff)
    }

    /// Parses a bare TIFF stream starting at its byte-order mark.
    pub fn parse_tiff(tiff: &[u8]) -> Result<Self> {
        let byte_order = match tiff.get(..2) {
            Some(b"II") => ExifByteOrder::LittleEndian,
            Some(b"MM") => ExifByteOrder::BigEndian,
            _ => return Err(Error::InvalidData("exif byte order mark must be II or MM")),
        };
        let mut parser = TiffParser {
            data: tiff,
            byte_order,
            visited: BTreeSet::new(),
            tags: BTreeMap::new(),
        };
        if parser.u16_at(2)? != 42 {
            return Err(Error::InvalidData("exif TIFF magic must be 42"));
        }
        let ifd0 = parser.u32_at(4)?;
        let ifd1 = parser.read_ifd(ifd0, IfdKind::Primary)?;
        if ifd1 != 0 {
            let next = parser.read_ifd(ifd1, IfdKind::Thumbnail)?;
            if next != 0 {
                debug!("ignoring exif IFDs after IFD1");
            }
        }
        Ok(Self { byte_order, tags: parser.tags })
    }

    pub fn get(&self, ifd: IfdKind, tag: u16) -> Option<&ExifValue> {
        self.tags.get(&ExifTagId { ifd, tag })
    }

    /// EXIF orientation (tag 0x0112) of the primary image, 1 to 8.
    pub fn orientation(&self) -> Option<u8> {
        let value = self.get(IfdKind::Primary, 0x0112)?.as_u32()?;
        u8::try_from(value).ok().filter(|o| (1..=8).contains(o))
    }
}

/// Whether `blob` already starts with a TIFF header offset field, as an
/// 'Exif' item payload does.
pub(crate) fn has_tiff_header_offset(blob: &[u8]) -> bool {
    let Ok(offset) = crate::reader::be_u32_at(blob, 0) else {
        return false;
    };
    let start = (offset as usize).saturating_add(4);
    matches!(blob.get(start..start.saturating_add(4)), Some(b"II*\0" | b"MM\0*"))
}

struct TiffParser<'a> {
    data: &'a [u8],
    byte_order: ExifByteOrder,
    visited: BTreeSet<u32>,
    tags: BTreeMap<ExifTagId, ExifValue>,
}

impl TiffParser<'_> {
    fn bytes(&self, pos: usize, len: usize) -> Result<&[u8]> {
        pos.checked_add(len)
            .and_then(|end| self.data.get(pos..end))
            .ok_or(Error::InvalidData("exif offset past the end of the TIFF stream"))
    }

    fn u16_at(&self, pos: usize) -> Result<u16> {
        let b = self.bytes(pos, 2)?;
        Ok(match self.byte_order {
            ExifByteOrder::LittleEndian => LittleEndian::read_u16(b),
            ExifByteOrder::BigEndian => BigEndian::read_u16(b),
        })
    }

    fn u32_at(&self, pos: usize) -> Result<u32> {
        let b = self.bytes(pos, 4)?;
        Ok(match self.byte_order {
            ExifByteOrder::LittleEndian => LittleEndian::read_u32(b),
            ExifByteOrder::BigEndian => BigEndian::read_u32(b),
        })
    }

    fn u64_at(&self, pos: usize) -> Result<u64> {
        let b = self.bytes(pos, 8)?;
        Ok(match self.byte_order {
            ExifByteOrder::LittleEndian => LittleEndian::read_u64(b),
            ExifByteOrder::BigEndian => BigEndian::read_u64(b),
        })
    }

    /// Reads one directory and the sub-directories it points at.
    /// Returns the offset of the next directory in the chain, or 0.
    fn read_ifd(&mut self, offset: u32, kind: IfdKind) -> Result<u32> {
        if !self.visited.insert(offset) {
            return Err(Error::InvalidData("exif IFD loop"));
        }
        let pos = offset as usize;
        let count = usize::from(self.u16_at(pos)?);
        let entries = pos + 2;
        // Entries and the next-IFD offset must fit.
        self.bytes(entries, count * IFD_ENTRY_SIZE + 4)?;

        let mut sub_ifds = std::vec::Vec::new();
        for i in 0..count {
            let entry = entries + i * IFD_ENTRY_SIZE;
            let tag = self.u16_at(entry)?;
            let ty = self.u16_at(entry + 2)?;
            let Some(value) = self.read_value(entry, ty)? else {
                debug!("exif tag {tag:#06x} has unknown type {ty}");
                continue;
            };
            let sub_kind = match (kind, tag) {
                (IfdKind::Primary, EXIF_IFD_POINTER) => Some(IfdKind::Exif),
                (IfdKind::Primary, GPS_IFD_POINTER) => Some(IfdKind::Gps),
                (IfdKind::Exif, INTEROP_IFD_POINTER) => Some(IfdKind::Interop),
                _ => None,
            };
            if let (Some(sub_kind), Some(sub_offset)) = (sub_kind, value.as_u32()) {
                sub_ifds.try_reserve(1)?;
                sub_ifds.push((sub_offset, sub_kind));
            }
            self.tags.insert(ExifTagId { ifd: kind, tag }, value);
        }
        for (sub_offset, sub_kind) in sub_ifds {
            self.read_ifd(sub_offset, sub_kind)?;
        }
        self.u32_at(entries + count * IFD_ENTRY_SIZE)
    }

    fn read_value(&self, entry: usize, ty: u16) -> Result<Option<ExifValue>> {
        let Some(size) = type_size(ty) else {
            return Ok(None);
        };
        let count = self.u32_at(entry + 4)? as usize;
        let total = count
            .checked_mul(size)
            .ok_or(Error::InvalidData("exif value size overflow"))?;
        let pos = if total <= 4 { entry + 8 } else { self.u32_at(entry + 8)? as usize };
        let raw = self.bytes(pos, total)?;

        macro_rules! collect {
            ($variant:ident, $read:expr) => {{
                let mut values = std::vec::Vec::new();
                values.try_reserve_exact(count)?;
                for i in 0..count {
                    values.push($read(pos + i * size)?);
                }
                ExifValue::$variant(values)
            }};
        }

        Ok(Some(match ty {
            1 => ExifValue::Byte(raw.to_vec()),
            2 => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                ExifValue::Ascii(std::string::String::from_utf8_lossy(&raw[..end]).into_owned())
            },
            3 => collect!(Short, |p| self.u16_at(p)),
            4 => collect!(Long, |p| self.u32_at(p)),
            5 => collect!(Rational, |p| -> Result<(u32, u32)> { Ok((self.u32_at(p)?, self.u32_at(p + 4)?)) }),
            6 => ExifValue::SByte(raw.iter().map(|&b| b as i8).collect()),
            7 => ExifValue::Undefined(raw.to_vec()),
            8 => collect!(SShort, |p| self.u16_at(p).map(|v| v as i16)),
            9 => collect!(SLong, |p| self.u32_at(p).map(|v| v as i32)),
            10 => collect!(SRational, |p| -> Result<(i32, i32)> {
                Ok((self.u32_at(p)? as i32, self.u32_at(p + 4)? as i32))
            }),
            11 => collect!(Float, |p| self.u32_at(p).map(f32::from_bits)),
            _ => collect!(Double, |p| self.u64_at(p).map(f64::from_bits)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Little-endian TIFF with IFD0 holding Orientation, Make and an
    /// Exif pointer; the Exif IFD holds ExposureTime.
    fn sample_tiff() -> std::vec::Vec<u8> {
        let mut t = std::vec::Vec::new();
        t.extend_from_slice(b"II*\0");
        t.extend_from_slice(&8u32.to_le_bytes());
        // IFD0 at 8: 3 entries -> ends at 8 + 2 + 36 + 4 = 50
        t.extend_from_slice(&3u16.to_le_bytes());
        // Orientation SHORT 1 = 6
        t.extend_from_slice(&0x0112u16.to_le_bytes());
        t.extend_from_slice(&3u16.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&[6, 0, 0, 0]);
        // Make ASCII 6 at 50
        t.extend_from_slice(&0x010fu16.to_le_bytes());
        t.extend_from_slice(&2u16.to_le_bytes());
        t.extend_from_slice(&6u32.to_le_bytes());
        t.extend_from_slice(&50u32.to_le_bytes());
        // ExifIFD LONG 1 = 56
        t.extend_from_slice(&0x8769u16.to_le_bytes());
        t.extend_from_slice(&4u16.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&56u32.to_le_bytes());
        // no IFD1
        t.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(t.len(), 50);
        t.extend_from_slice(b"Acme\0\0");
        // Exif IFD at 56: 1 entry, RATIONAL at 74
        t.extend_from_slice(&1u16.to_le_bytes());
        t.extend_from_slice(&0x829au16.to_le_bytes());
        t.extend_from_slice(&5u16.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&74u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(t.len(), 74);
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&250u32.to_le_bytes());
        t
    }

    #[test]
    fn flat_map_spans_sub_ifds() {
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend(sample_tiff());
        let exif = ExifData::parse(&payload).unwrap();
        assert_eq!(exif.byte_order, ExifByteOrder::LittleEndian);
        assert_eq!(exif.orientation(), Some(6));
        assert_eq!(exif.get(IfdKind::Primary, 0x010f), Some(&ExifValue::Ascii("Acme".into())));
        assert_eq!(exif.get(IfdKind::Exif, 0x829a), Some(&ExifValue::Rational(vec![(1, 250)])));
        assert_eq!(exif.tags.len(), 4);
    }

    #[test]
    fn header_offset_prefix_detection() {
        assert!(!has_tiff_header_offset(&sample_tiff()));
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend(sample_tiff());
        assert!(has_tiff_header_offset(&payload));
        assert_eq!(ExifData::parse(&payload).unwrap().orientation(), Some(6));
    }

    #[test]
    fn loops_and_truncation_are_errors() {
        let mut t = sample_tiff();
        // Point the Exif IFD back at IFD0.
        t[42..46].copy_from_slice(&8u32.to_le_bytes());
        assert!(ExifData::parse_tiff(&t).is_err());

        let t = sample_tiff();
        assert!(ExifData::parse_tiff(&t[..60]).is_err());
        assert!(ExifData::parse_tiff(b"XX*\0\x08\0\0\0").is_err());
        assert!(ExifData::parse_tiff(b"MM\0\x2b\0\0\0\x08").is_err());
    }

    #[test]
    fn big_endian_inline_values() {
        let mut t = std::vec::Vec::new();
        t.extend_from_slice(b"MM\0*");
        t.extend_from_slice(&8u32.to_be_bytes());
        t.extend_from_slice(&1u16.to_be_bytes());
        // two SSHORTs fit inline
        t.extend_from_slice(&0x1234u16.to_be_bytes());
        t.extend_from_slice(&8u16.to_be_bytes());
        t.extend_from_slice(&2u32.to_be_bytes());
        t.extend_from_slice(&(-2i16).to_be_bytes());
        t.extend_from_slice(&7i16.to_be_bytes());
        t.extend_from_slice(&0u32.to_be_bytes());
        let exif = ExifData::parse_tiff(&t).unwrap();
        assert_eq!(exif.get(IfdKind::Primary, 0x1234), Some(&ExifValue::SShort(vec![-2, 7])));
    }
}
