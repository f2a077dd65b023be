// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The AV1 codec configuration property ('av1C').
//!
//! See AV1 Codec ISO Media File Format Binding § 2.3

use crate::bmff::{BMFFBox, ParseContext};
use crate::grid::ChromaSubsampling;
use crate::writer::{BASIC_BOX_SIZE, MpegBox, Writer, WriterBackend};
use crate::{Error, Result, TryVec};
use bitreader::BitReader;
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Seek};

/// `marker` (1) followed by `version` (1), as the first byte of every av1C.
const MARKER_AND_VERSION: u8 = 0x81;

/// Level 31 places no constraints on the stream.
const LEVEL_MAX: u8 = 31;

/// AV1 Annex A.3: (seq_level_idx, MaxPicSize, MaxHSize) for the lowest
/// level of each resolution class. Decode rate doesn't apply to stills.
const LEVEL_LIMITS: [(u8, u64, u32); 7] = [
    (0, 147_456, 2048),
    (1, 278_784, 2816),
    (4, 665_856, 4352),
    (5, 1_065_024, 5504),
    (8, 2_359_296, 6144),
    (12, 8_912_896, 8192),
    (16, 35_651_584, 16384),
];

/// Levels with a definition in the AV1 specification.
const DEFINED_LEVELS: [(u8, &str); 25] = [
    (0, "2.0"),
    (1, "2.1"),
    (2, "2.2"),
    (3, "2.3"),
    (4, "3.0"),
    (5, "3.1"),
    (6, "3.2"),
    (7, "3.3"),
    (8, "4.0"),
    (9, "4.1"),
    (10, "4.2"),
    (11, "4.3"),
    (12, "5.0"),
    (13, "5.1"),
    (14, "5.2"),
    (15, "5.3"),
    (16, "6.0"),
    (17, "6.1"),
    (18, "6.2"),
    (19, "6.3"),
    (20, "7.0"),
    (21, "7.1"),
    (22, "7.2"),
    (23, "7.3"),
    (LEVEL_MAX, "Max"),
];

/// The `seq_profile` of an AV1 sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceProfile {
    /// 8/10-bit 4:2:0 and monochrome
    Main,
    /// 8/10-bit 4:4:4
    High,
    /// 4:2:2 and 12-bit
    Professional,
    Reserved(u8),
}

impl From<u8> for SequenceProfile {
    fn from(profile: u8) -> Self {
        match profile {
            0 => Self::Main,
            1 => Self::High,
            2 => Self::Professional,
            other => Self::Reserved(other),
        }
    }
}

/// A `seq_level_idx` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLevel(pub u8);

impl SequenceLevel {
    /// Splits the packed `seq_profile << 5 | seq_level_idx` byte.
    pub fn from_packed(byte: u8) -> (SequenceProfile, Self) {
        (SequenceProfile::from(byte >> 5), Self(byte & 0x1f))
    }

    /// Whether the AV1 specification defines this level.
    pub fn is_defined(self) -> bool {
        DEFINED_LEVELS.iter().any(|&(idx, _)| idx == self.0)
    }

    /// "major.minor" for every level; reserved indices get the same
    /// arithmetic name as defined ones.
    pub fn name(self) -> Cow<'static, str> {
        match DEFINED_LEVELS.iter().find(|&&(idx, _)| idx == self.0) {
            Some(&(_, name)) => Cow::Borrowed(name),
            None => Cow::Owned(format!("{}.{}", 2 + (self.0 >> 2), self.0 & 3)),
        }
    }

    /// Lowest level whose picture size limits admit `width`×`height`.
    pub fn for_dimensions(width: u32, height: u32) -> Self {
        let area = u64::from(width) * u64::from(height);
        let longest = width.max(height);
        LEVEL_LIMITS
            .iter()
            .find(|&&(_, max_pic_size, max_h_size)| area <= max_pic_size && longest <= max_h_size)
            .map_or(Self(LEVEL_MAX), |&(idx, _, _)| Self(idx))
    }
}

impl fmt::Display for SequenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Decoded 'av1C' property.
#[derive(Debug, PartialEq)]
pub struct Av1ConfigBox {
    pub seq_profile: u8,
    pub seq_level_idx_0: u8,
    pub seq_tier_0: bool,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: bool,
    pub chroma_subsampling_y: bool,
    pub chroma_sample_position: u8,
    pub initial_presentation_delay_present: bool,
    pub initial_presentation_delay_minus_one: u8,
    /// Trailing configOBUs, usually a copy of the sequence header.
    pub config_obus: TryVec<u8>,
}

impl Av1ConfigBox {
    /// Builds the configuration for an already-compressed still image.
    ///
    /// 4:2:0 and monochrome map to Main, 4:4:4 to High, and 4:2:2 or any
    /// 12-bit image to Professional.
    pub fn for_image(format: ChromaSubsampling, width: u32, height: u32, bit_depth: u8) -> Result<Self> {
        if !matches!(bit_depth, 8 | 10 | 12) {
            return Err(Error::InvalidInput("AV1 bit depth must be 8, 10 or 12"));
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput("image dimensions cannot be zero"));
        }
        let seq_profile = if bit_depth == 12 {
            2
        } else {
            match format {
                ChromaSubsampling::Yuv400 | ChromaSubsampling::Yuv420 => 0,
                ChromaSubsampling::Yuv444 => 1,
                ChromaSubsampling::Yuv422 => 2,
            }
        };
        let (chroma_subsampling_x, chroma_subsampling_y) = format.subsampling();
        Ok(Self {
            seq_profile,
            seq_level_idx_0: SequenceLevel::for_dimensions(width, height).0,
            seq_tier_0: false,
            high_bitdepth: bit_depth > 8,
            twelve_bit: bit_depth == 12,
            monochrome: format == ChromaSubsampling::Yuv400,
            chroma_subsampling_x,
            chroma_subsampling_y,
            chroma_sample_position: 0,
            initial_presentation_delay_present: false,
            initial_presentation_delay_minus_one: 0,
            config_obus: TryVec::new(),
        })
    }

    /// The third byte: tier, bit depth, monochrome and chroma flags.
    pub fn flags_byte(&self) -> u8 {
        u8::from(self.seq_tier_0) << 7
            | u8::from(self.high_bitdepth) << 6
            | u8::from(self.twelve_bit) << 5
            | u8::from(self.monochrome) << 4
            | u8::from(self.chroma_subsampling_x) << 3
            | u8::from(self.chroma_subsampling_y) << 2
            | (self.chroma_sample_position & 3)
    }

    pub fn set_flags_byte(&mut self, byte: u8) {
        self.seq_tier_0 = byte & 0x80 != 0;
        self.high_bitdepth = byte & 0x40 != 0;
        self.twelve_bit = byte & 0x20 != 0;
        self.monochrome = byte & 0x10 != 0;
        self.chroma_subsampling_x = byte & 0x08 != 0;
        self.chroma_subsampling_y = byte & 0x04 != 0;
        self.chroma_sample_position = byte & 3;
    }

    /// `seq_profile << 5 | seq_level_idx_0`
    pub fn packed_profile_level(&self) -> u8 {
        (self.seq_profile & 7) << 5 | (self.seq_level_idx_0 & 0x1f)
    }

    pub fn profile(&self) -> SequenceProfile {
        SequenceProfile::from(self.seq_profile)
    }

    pub fn level(&self) -> SequenceLevel {
        SequenceLevel(self.seq_level_idx_0)
    }

    pub fn bit_depth(&self) -> u8 {
        match (self.high_bitdepth, self.twelve_bit) {
            (true, true) => 12,
            (true, false) => 10,
            _ => 8,
        }
    }

    /// `None` for the subsampled-vertically-only combination, which AV1 forbids.
    pub fn chroma_subsampling(&self) -> Option<ChromaSubsampling> {
        if self.monochrome {
            return Some(ChromaSubsampling::Yuv400);
        }
        match (self.chroma_subsampling_x, self.chroma_subsampling_y) {
            (true, true) => Some(ChromaSubsampling::Yuv420),
            (true, false) => Some(ChromaSubsampling::Yuv422),
            (false, false) => Some(ChromaSubsampling::Yuv444),
            (false, true) => None,
        }
    }
}

/// Parse an AV1 Codec Configuration property.
/// See AV1 ISOBMFF § 2.3.3
pub(crate) fn read_av1c<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<Av1ConfigBox> {
    let mut header = [0u8; 4];
    src.read_exact(&mut header)?;
    let mut bits = BitReader::new(&header);

    let marker = bits.read_u8(1)?;
    let version = bits.read_u8(7)?;
    if marker != 1 || version != 1 {
        return Err(Error::InvalidData("av1C marker and version must be 1"));
    }
    let seq_profile = bits.read_u8(3)?;
    let seq_level_idx_0 = bits.read_u8(5)?;
    let seq_tier_0 = bits.read_bool()?;
    let high_bitdepth = bits.read_bool()?;
    let twelve_bit = bits.read_bool()?;
    let monochrome = bits.read_bool()?;
    let chroma_subsampling_x = bits.read_bool()?;
    let chroma_subsampling_y = bits.read_bool()?;
    let chroma_sample_position = bits.read_u8(2)?;
    let reserved = bits.read_u8(3)?;
    if reserved != 0 && !ctx.options.lenient {
        return Err(Error::InvalidData("av1C reserved bits must be 0"));
    }
    let initial_presentation_delay_present = bits.read_bool()?;
    let initial_presentation_delay_minus_one = bits.read_u8(4)?;

    if twelve_bit && !high_bitdepth {
        return Err(Error::InvalidData("av1C twelve_bit requires high_bitdepth"));
    }

    let config_obus = src.read_into_try_vec(&mut ctx.tracker)?;

    Ok(Av1ConfigBox {
        seq_profile,
        seq_level_idx_0,
        seq_tier_0,
        high_bitdepth,
        twelve_bit,
        monochrome,
        chroma_subsampling_x,
        chroma_subsampling_y,
        chroma_sample_position,
        initial_presentation_delay_present,
        initial_presentation_delay_minus_one: if initial_presentation_delay_present {
            initial_presentation_delay_minus_one
        } else {
            0
        },
        config_obus,
    })
}

impl MpegBox for Av1ConfigBox {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + 4 + self.config_obus.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"av1C")?;
        b.u8(MARKER_AND_VERSION)?;
        b.u8(self.packed_profile_level())?;
        b.u8(self.flags_byte())?;
        let delay = if self.initial_presentation_delay_present {
            0x10 | (self.initial_presentation_delay_minus_one & 0x0f)
        } else {
            0
        };
        b.u8(delay)?;
        b.push(&self.config_obus)
    }
}
