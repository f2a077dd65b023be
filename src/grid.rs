// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derived 'grid' images: the descriptor payload and tile layout checks.
//!
//! See ISO/IEC 23008-12:2017 § 6.6.2.3

use crate::writer::{Writer, WriterBackend};
use crate::{Error, Result, TryVec};
use byteorder::{BigEndian, ReadBytesExt};

/// Chroma layout of a coded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSubsampling {
    /// Monochrome, no chroma planes.
    Yuv400,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaSubsampling {
    /// `(horizontal, vertical)` subsampling flags as carried by 'av1C'.
    /// Monochrome reports `(true, true)` as AV1 requires.
    pub fn subsampling(self) -> (bool, bool) {
        match self {
            Self::Yuv400 | Self::Yuv420 => (true, true),
            Self::Yuv422 => (true, false),
            Self::Yuv444 => (false, false),
        }
    }

    /// Number of color channels the 'pixi' property lists.
    pub fn channel_count(self) -> u8 {
        match self {
            Self::Yuv400 => 1,
            _ => 3,
        }
    }
}

/// The payload of a 'grid' item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGridDescriptor {
    pub rows_minus_one: u8,
    pub columns_minus_one: u8,
    pub output_width: u32,
    pub output_height: u32,
}

impl ImageGridDescriptor {
    const VERSION: u8 = 0;
    const LARGE_FIELDS: u8 = 1;

    pub fn new(rows: u32, columns: u32, output_width: u32, output_height: u32) -> Result<Self> {
        if !(1..=256).contains(&rows) || !(1..=256).contains(&columns) {
            return Err(Error::InvalidInput("grid must have 1 to 256 tiles per axis"));
        }
        if output_width == 0 || output_height == 0 {
            return Err(Error::InvalidInput("grid output dimensions cannot be zero"));
        }
        Ok(Self {
            rows_minus_one: (rows - 1) as u8,
            columns_minus_one: (columns - 1) as u8,
            output_width,
            output_height,
        })
    }

    pub fn rows(&self) -> u32 {
        u32::from(self.rows_minus_one) + 1
    }

    pub fn columns(&self) -> u32 {
        u32::from(self.columns_minus_one) + 1
    }

    pub fn tile_count(&self) -> u32 {
        self.rows() * self.columns()
    }

    /// Output dimensions above 65535 need 32-bit fields.
    pub fn large_fields(&self) -> bool {
        self.output_width > u32::from(u16::MAX) || self.output_height > u32::from(u16::MAX)
    }

    /// Encoded length: 8 bytes with 16-bit fields, 12 with 32-bit fields.
    pub fn len(&self) -> usize {
        if self.large_fields() { 12 } else { 8 }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut src = data;
        let version = src.read_u8()?;
        if version != Self::VERSION {
            return Err(Error::InvalidData("grid descriptor version must be 0"));
        }
        let flags = src.read_u8()?;
        let rows_minus_one = src.read_u8()?;
        let columns_minus_one = src.read_u8()?;
        let (output_width, output_height) = if flags & Self::LARGE_FIELDS == 0 {
            (u32::from(src.read_u16::<BigEndian>()?), u32::from(src.read_u16::<BigEndian>()?))
        } else {
            (src.read_u32::<BigEndian>()?, src.read_u32::<BigEndian>()?)
        };
        if !src.is_empty() {
            return Err(Error::InvalidData("trailing bytes after grid descriptor"));
        }
        if output_width == 0 || output_height == 0 {
            return Err(Error::InvalidData("grid output dimensions cannot be zero"));
        }
        Ok(Self { rows_minus_one, columns_minus_one, output_width, output_height })
    }

    pub(crate) fn write<B: WriterBackend>(&self, b: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let large = self.large_fields();
        b.u8(Self::VERSION)?;
        b.u8(if large { Self::LARGE_FIELDS } else { 0 })?;
        b.u8(self.rows_minus_one)?;
        b.u8(self.columns_minus_one)?;
        if large {
            b.u32(self.output_width)?;
            b.u32(self.output_height)
        } else {
            b.u16(self.output_width as u16)?;
            b.u16(self.output_height as u16)
        }
    }

    pub fn to_bytes(&self) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::with_capacity(self.len());
        match self.write(&mut Writer::new(&mut out)) {
            Ok(()) => {},
            Err(e) => match e {},
        }
        out
    }
}

/// A grid descriptor together with its tiles, in row-major order.
#[derive(Debug)]
pub struct ImageGridInfo {
    pub descriptor: ImageGridDescriptor,
    pub tile_item_ids: TryVec<u32>,
}

impl ImageGridInfo {
    /// Fails unless there is exactly one tile per grid cell.
    pub fn new(descriptor: ImageGridDescriptor, tile_item_ids: TryVec<u32>) -> Result<Self> {
        if tile_item_ids.len() as u64 != u64::from(descriptor.tile_count()) {
            return Err(Error::InvalidData("grid tile count does not match rows × columns"));
        }
        Ok(Self { descriptor, tile_item_ids })
    }

    pub fn tile_count(&self) -> u32 {
        self.descriptor.tile_count()
    }
}

/// Grid layout including the tile size, which the descriptor doesn't store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGridMetadata {
    tile_columns: u32,
    tile_rows: u32,
    tile_width: u32,
    tile_height: u32,
    output_width: u32,
    output_height: u32,
    tile_count: u32,
}

impl ImageGridMetadata {
    pub fn new(
        tile_columns: u32,
        tile_rows: u32,
        tile_width: u32,
        tile_height: u32,
        output_width: u32,
        output_height: u32,
    ) -> Result<Self> {
        if !(1..=256).contains(&tile_columns) || !(1..=256).contains(&tile_rows) {
            return Err(Error::InvalidInput("grid must have 1 to 256 tiles per axis"));
        }
        if tile_width == 0 || tile_height == 0 || output_width == 0 || output_height == 0 {
            return Err(Error::InvalidInput("grid dimensions cannot be zero"));
        }
        Ok(Self {
            tile_columns,
            tile_rows,
            tile_width,
            tile_height,
            output_width,
            output_height,
            tile_count: tile_columns * tile_rows,
        })
    }

    /// Output size is the tile size times the tile counts.
    pub fn from_tiles(tile_columns: u32, tile_rows: u32, tile_width: u32, tile_height: u32) -> Result<Self> {
        let output_width = tile_columns
            .checked_mul(tile_width)
            .ok_or(Error::InvalidInput("grid width overflow"))?;
        let output_height = tile_rows
            .checked_mul(tile_height)
            .ok_or(Error::InvalidInput("grid height overflow"))?;
        Self::new(tile_columns, tile_rows, tile_width, tile_height, output_width, output_height)
    }

    /// Combines a parsed descriptor with the size of its (decoded or declared) tiles.
    pub fn from_descriptor(descriptor: &ImageGridDescriptor, tile_width: u32, tile_height: u32) -> Result<Self> {
        Self::new(
            descriptor.columns(),
            descriptor.rows(),
            tile_width,
            tile_height,
            descriptor.output_width,
            descriptor.output_height,
        )
        .map_err(|_| Error::InvalidData("invalid grid tile dimensions"))
    }

    pub fn tile_columns(&self) -> u32 {
        self.tile_columns
    }

    pub fn tile_rows(&self) -> u32 {
        self.tile_rows
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn output_width(&self) -> u32 {
        self.output_width
    }

    pub fn output_height(&self) -> u32 {
        self.output_height
    }

    pub fn tile_count(&self) -> u32 {
        self.tile_count
    }

    pub fn descriptor(&self) -> ImageGridDescriptor {
        ImageGridDescriptor {
            rows_minus_one: (self.tile_rows - 1) as u8,
            columns_minus_one: (self.tile_columns - 1) as u8,
            output_width: self.output_width,
            output_height: self.output_height,
        }
    }

    /// Whether the tiles exactly cover a `width`×`height` image in `format`.
    ///
    /// Tiles must not be cropped. Along a subsampled axis the tile count,
    /// the tile size and the output size must all be even so every tile
    /// seam lands on a chroma sample boundary.
    pub fn is_valid_for_image(&self, width: u32, height: u32, format: ChromaSubsampling) -> bool {
        if self.output_width != width || self.output_height != height {
            return false;
        }
        if u64::from(self.tile_columns) * u64::from(self.tile_width) != u64::from(self.output_width)
            || u64::from(self.tile_rows) * u64::from(self.tile_height) != u64::from(self.output_height)
        {
            return false;
        }
        let even = |n: u32| n % 2 == 0;
        let horizontal = even(self.tile_columns) && even(self.tile_width) && even(self.output_width);
        let vertical = even(self.tile_rows) && even(self.tile_height) && even(self.output_height);
        match format {
            ChromaSubsampling::Yuv420 => horizontal && vertical,
            ChromaSubsampling::Yuv422 => horizontal,
            ChromaSubsampling::Yuv444 | ChromaSubsampling::Yuv400 => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_field_width_follows_magnitude() {
        let small = ImageGridDescriptor::new(2, 2, 65535, 256).unwrap();
        assert!(!small.large_fields());
        assert_eq!(small.to_bytes(), [0, 0, 1, 1, 0xff, 0xff, 1, 0]);

        let large = ImageGridDescriptor::new(1, 3, 65536, 16).unwrap();
        assert!(large.large_fields());
        assert_eq!(large.len(), 12);
        assert_eq!(large.to_bytes(), [0, 1, 0, 2, 0, 1, 0, 0, 0, 0, 0, 16]);
        assert_eq!(ImageGridDescriptor::parse(&large.to_bytes()).unwrap(), large);
    }

    #[test]
    fn descriptor_rejects_bad_version_and_length() {
        assert!(ImageGridDescriptor::parse(&[1, 0, 0, 0, 0, 1, 0, 1]).is_err());
        assert!(ImageGridDescriptor::parse(&[0, 0, 0, 0, 0, 1, 0]).is_err());
        assert!(ImageGridDescriptor::parse(&[0, 0, 0, 0, 0, 1, 0, 1, 0]).is_err());
        assert!(ImageGridDescriptor::parse(&[0, 0, 0, 0, 0, 0, 0, 1]).is_err());
        let parsed = ImageGridDescriptor::parse(&[0, 0, 255, 255, 0, 1, 0, 1]).unwrap();
        assert_eq!(parsed.tile_count(), 65536);
    }

    #[test]
    fn grid_info_requires_exact_tile_count() {
        let descriptor = ImageGridDescriptor::new(2, 3, 60, 40).unwrap();
        let mut ids = TryVec::new();
        for id in 1..=5 {
            ids.push(id).unwrap();
        }
        assert!(ImageGridInfo::new(descriptor, ids).is_err());

        let mut ids = TryVec::new();
        for id in 1..=6 {
            ids.push(id).unwrap();
        }
        assert_eq!(ImageGridInfo::new(descriptor, ids).unwrap().tile_count(), 6);
    }

    #[test]
    fn validity_matches_coverage_and_parity() {
        let formats = [
            ChromaSubsampling::Yuv400,
            ChromaSubsampling::Yuv420,
            ChromaSubsampling::Yuv422,
            ChromaSubsampling::Yuv444,
        ];
        for tile_columns in 1..=4 {
            for tile_rows in 1..=4 {
                for tile_width in [1, 2, 3, 8, 9] {
                    for tile_height in [1, 2, 5, 16] {
                        let grid = ImageGridMetadata::from_tiles(tile_columns, tile_rows, tile_width, tile_height).unwrap();
                        let (w, h) = (tile_columns * tile_width, tile_rows * tile_height);
                        for format in formats {
                            // Seams and the far edge sit at multiples of the tile size.
                            let axis_ok = |count: u32, size: u32| count % 2 == 0 && (1..=count).all(|i| i * size % 2 == 0);
                            let expected = match format {
                                ChromaSubsampling::Yuv420 => {
                                    axis_ok(tile_columns, tile_width) && axis_ok(tile_rows, tile_height)
                                },
                                ChromaSubsampling::Yuv422 => axis_ok(tile_columns, tile_width),
                                _ => true,
                            };
                            assert_eq!(grid.is_valid_for_image(w, h, format), expected);
                            assert!(!grid.is_valid_for_image(w + 1, h, format));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn four_columns_of_odd_width_fail_420() {
        let grid = ImageGridMetadata::from_tiles(4, 2, 33, 32).unwrap();
        assert!(!grid.is_valid_for_image(132, 64, ChromaSubsampling::Yuv420));
        assert!(grid.is_valid_for_image(132, 64, ChromaSubsampling::Yuv444));
    }

    #[test]
    fn odd_tile_height_fails_420_but_not_422() {
        let grid = ImageGridMetadata::from_tiles(2, 2, 16, 15).unwrap();
        assert!(!grid.is_valid_for_image(32, 30, ChromaSubsampling::Yuv420));
        assert!(grid.is_valid_for_image(32, 30, ChromaSubsampling::Yuv422));
    }

    #[test]
    fn descriptor_to_bytes_matches_len() {
        let descriptor = ImageGridDescriptor::new(3, 4, 70000, 9).unwrap();
        assert_eq!(descriptor.to_bytes().len(), descriptor.len());
    }

    #[test]
    fn cropped_tiles_are_rejected() {
        let grid = ImageGridMetadata::new(2, 2, 64, 64, 120, 128).unwrap();
        assert!(!grid.is_valid_for_image(120, 128, ChromaSubsampling::Yuv444));
    }
}
