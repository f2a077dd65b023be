// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembles compressed AV1 images and metadata into a complete file.
//!
//! The item graph is built in stages (item ids, then 'iinf', 'iloc',
//! 'iprp' and 'iref'), every box size is known before anything is written,
//! and payload offsets are patched into 'iloc' once the payloads land.

use crate::av1c::Av1ConfigBox;
use crate::boxes::{FourCC, codes};
use crate::exif::has_tiff_header_offset;
use crate::grid::{ChromaSubsampling, ImageGridMetadata};
use crate::items::{
    ConstructionMethod, HdlrBox, IdatBox, IinfBox, IlocBox, IlocItem, IrefBox, IrefEntry, ItemInfoEntry,
    ItemInfoExtension, PatchSite, PitmBox, XMP_CONTENT_TYPE,
};
use crate::properties::{
    AuxiliaryType, ColorInformation, ImageSpatialExtents, IprpBox, IpmaEntry, ItemProperty, PixelAspectRatio,
    PixelInformation, PropertyAssociation,
};
use crate::writer::{BASIC_BOX_SIZE, BigEndianWriter, FULL_BOX_SIZE, MpegBox, Writer, WriterBackend};
use crate::{Error, Result, ToU64};
use fallible_collections::TryClone;
use log::debug;
use std::io::{Cursor, Seek, Write};

/// One AV1-coded image as produced by an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedImage {
    /// AV1 OBUs of a single frame.
    pub data: std::vec::Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ChromaSubsampling,
    /// 8, 10 or 12
    pub bit_depth: u8,
}

impl CompressedImage {
    pub fn new(data: std::vec::Vec<u8>, width: u32, height: u32, format: ChromaSubsampling, bit_depth: u8) -> Self {
        Self {
            data,
            width,
            height,
            format,
            bit_depth,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::InvalidInput("image data is empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidInput("image dimensions cannot be zero"));
        }
        if !matches!(self.bit_depth, 8 | 10 | 12) {
            return Err(Error::InvalidInput("bit depth must be 8, 10 or 12"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemRole {
    Color,
    Alpha,
    ColorGrid,
    AlphaGrid,
    Exif,
    Xmp,
}

impl ItemRole {
    fn item_type(self) -> FourCC {
        match self {
            Self::Color | Self::Alpha => codes::AV01,
            Self::ColorGrid | Self::AlphaGrid => codes::GRID,
            Self::Exif => codes::EXIF,
            Self::Xmp => codes::MIME,
        }
    }

    fn is_image_payload(self) -> bool {
        matches!(self, Self::Color | Self::Alpha)
    }
}

#[derive(Debug)]
struct WriterItem<'a> {
    id: u32,
    role: ItemRole,
    /// Set for `Color` and `Alpha` items.
    image: Option<&'a CompressedImage>,
    /// Bytes stored in 'mdat'. Grid items keep their descriptor in 'idat' instead.
    payload: &'a [u8],
}

/// Item graph of a single write.
#[derive(Debug)]
struct AvifWriterState<'a> {
    items: std::vec::Vec<WriterItem<'a>>,
    primary_item_id: u32,
    grid: Option<ImageGridMetadata>,
    /// Grid descriptor shared by the color and alpha grid items.
    idat: std::vec::Vec<u8>,
    color_information: Option<&'a ColorInformation>,
    premultiplied_alpha: bool,
}

impl<'a> AvifWriterState<'a> {
    /// Validates the input and assigns item ids.
    ///
    /// Ids start at 1 with color and alpha interleaved per tile, then the
    /// grid items, then EXIF and XMP.
    fn new(input: &'a AvifWriter<'_>) -> Result<Self> {
        let color = &input.color;
        let alpha = &input.alpha;
        let first = color.first().ok_or(Error::InvalidInput("at least one color image is required"))?;
        if !alpha.is_empty() && alpha.len() != color.len() {
            return Err(Error::InvalidInput("alpha image count must match color image count"));
        }
        for image in color.iter().chain(alpha) {
            image.validate()?;
        }
        for (c, a) in color.iter().zip(alpha) {
            if c.width != a.width || c.height != a.height || c.bit_depth != a.bit_depth {
                return Err(Error::InvalidInput("alpha image must match its color image in size and depth"));
            }
        }
        if let Some(ColorInformation::Unknown(_)) = input.color_information {
            return Err(Error::InvalidInput("can't write an unknown colour type"));
        }

        match (&input.grid, color.len()) {
            (None, 1) => {},
            (None, _) => return Err(Error::InvalidInput("multiple images need grid metadata")),
            (Some(grid), count) => {
                if u64::from(grid.tile_count()) != count.to_u64() {
                    return Err(Error::InvalidInput("grid tile count does not match the number of images"));
                }
                let uniform = |images: &[CompressedImage]| {
                    images.iter().all(|i| {
                        i.width == grid.tile_width()
                            && i.height == grid.tile_height()
                            && i.format == images[0].format
                            && i.bit_depth == images[0].bit_depth
                    })
                };
                if !uniform(color) || (!alpha.is_empty() && !uniform(alpha)) {
                    return Err(Error::InvalidInput("grid tiles must share size, format and depth"));
                }
                let covered = |count: u32, size: u32| {
                    count.checked_mul(size).ok_or(Error::InvalidInput("grid dimensions overflow"))
                };
                let width = covered(grid.tile_columns(), first.width)?;
                let height = covered(grid.tile_rows(), first.height)?;
                if !grid.is_valid_for_image(width, height, first.format) {
                    return Err(Error::InvalidInput("grid is not valid for the chroma format"));
                }
            },
        }

        let mut items = std::vec::Vec::new();
        let mut next_id = 1u32;
        let mut push = |items: &mut std::vec::Vec<WriterItem<'a>>,
                        role: ItemRole,
                        image: Option<&'a CompressedImage>,
                        payload: &'a [u8]| {
            items.push(WriterItem {
                id: next_id,
                role,
                image,
                payload,
            });
            next_id += 1;
            next_id - 1
        };

        for (i, c) in color.iter().enumerate() {
            push(&mut items, ItemRole::Color, Some(c), &c.data[..]);
            if let Some(a) = alpha.get(i) {
                push(&mut items, ItemRole::Alpha, Some(a), &a.data[..]);
            }
        }
        let mut primary_item_id = 1;
        let mut idat = std::vec::Vec::new();
        if let Some(grid) = &input.grid {
            primary_item_id = push(&mut items, ItemRole::ColorGrid, None, &[]);
            if !alpha.is_empty() {
                push(&mut items, ItemRole::AlphaGrid, None, &[]);
            }
            idat = grid.descriptor().to_bytes();
        }
        if let Some(exif) = &input.exif {
            push(&mut items, ItemRole::Exif, None, &exif[..]);
        }
        if let Some(xmp) = &input.xmp {
            push(&mut items, ItemRole::Xmp, None, &xmp[..]);
        }
        debug!("writing {} items, primary {primary_item_id}", items.len());

        Ok(Self {
            items,
            primary_item_id,
            grid: input.grid,
            idat,
            color_information: input.color_information.as_ref(),
            premultiplied_alpha: input.premultiplied_alpha,
        })
    }

    fn ids_of(&self, role: ItemRole) -> impl Iterator<Item = u32> + '_ {
        self.items.iter().filter(move |i| i.role == role).map(|i| i.id)
    }

    fn id_of(&self, role: ItemRole) -> Option<u32> {
        self.ids_of(role).next()
    }

    fn infos(&self) -> IinfBox {
        let items = self
            .items
            .iter()
            .map(|item| {
                let mut entry = ItemInfoEntry::new(item.id, item.role.item_type());
                // Tiles are only meaningful through their grid.
                entry.hidden = self.grid.is_some() && item.role.is_image_payload();
                if item.role == ItemRole::Xmp {
                    entry.extension = ItemInfoExtension::Mime {
                        content_type: XMP_CONTENT_TYPE.into(),
                        content_encoding: std::string::String::new(),
                    };
                }
                entry
            })
            .collect();
        IinfBox { items }
    }

    /// File offsets are placeholders until the payloads are written.
    fn locations(&self, wide_fields: bool) -> IlocBox {
        let items = self
            .items
            .iter()
            .map(|item| match item.role {
                ItemRole::ColorGrid | ItemRole::AlphaGrid => IlocItem {
                    item_id: item.id,
                    construction_method: ConstructionMethod::Idat,
                    offset: 0,
                    length: self.idat.len().to_u64(),
                },
                _ => IlocItem {
                    item_id: item.id,
                    construction_method: ConstructionMethod::File,
                    offset: 0,
                    length: item.payload.len().to_u64(),
                },
            })
            .collect();
        IlocBox { items, wide_fields }
    }

    /// Property values of one item with their essential flags, in association order.
    fn item_properties(&self, item: &WriterItem<'_>) -> Result<std::vec::Vec<(ItemProperty, bool)>> {
        let mut props = std::vec::Vec::new();
        match (item.role, item.image) {
            (ItemRole::Color | ItemRole::Alpha, Some(image)) => {
                props.push((spatial_extents(image.width, image.height), false));
                props.push((ItemProperty::PixelAspectRatio(PixelAspectRatio::default()), false));
                let av1c = Av1ConfigBox::for_image(image.format, image.width, image.height, image.bit_depth)?;
                props.push((ItemProperty::AV1Config(av1c), true));
                props.push((pixel_information(image), false));
                if item.role == ItemRole::Alpha {
                    props.push((ItemProperty::AuxiliaryType(AuxiliaryType::alpha()), false));
                } else if self.grid.is_none() {
                    props.extend(self.color_property()?);
                }
            },
            (ItemRole::ColorGrid | ItemRole::AlphaGrid, _) => {
                let grid = self.grid.ok_or(Error::InvalidInput("grid item without grid metadata"))?;
                let tile_role = if item.role == ItemRole::ColorGrid { ItemRole::Color } else { ItemRole::Alpha };
                let tile = self
                    .items
                    .iter()
                    .find(|i| i.role == tile_role)
                    .and_then(|i| i.image)
                    .ok_or(Error::InvalidInput("grid without tiles"))?;
                props.push((spatial_extents(grid.output_width(), grid.output_height()), false));
                props.push((ItemProperty::PixelAspectRatio(PixelAspectRatio::default()), false));
                props.push((pixel_information(tile), false));
                if item.role == ItemRole::AlphaGrid {
                    props.push((ItemProperty::AuxiliaryType(AuxiliaryType::alpha()), false));
                } else {
                    props.extend(self.color_property()?);
                }
            },
            _ => {},
        }
        Ok(props)
    }

    fn color_property(&self) -> Result<Option<(ItemProperty, bool)>> {
        Ok(match self.color_information {
            Some(colr) => Some((ItemProperty::ColorInformation(colr.try_clone()?), false)),
            None => None,
        })
    }

    /// Equal property values are stored once and shared by index.
    fn properties(&self) -> Result<IprpBox> {
        let mut iprp = IprpBox::default();
        for item in &self.items {
            let mut associations = std::vec::Vec::new();
            for (property, essential) in self.item_properties(item)? {
                let index = iprp.ipco.push(property)?;
                associations.push(PropertyAssociation { index, essential });
            }
            if !associations.is_empty() {
                iprp.ipma.entries.push(IpmaEntry {
                    item_id: item.id,
                    associations,
                });
            }
        }
        Ok(iprp)
    }

    fn references(&self) -> IrefBox {
        let mut iref = IrefBox::default();
        let mut add = |reference_type: FourCC, from_item_id: u32, to_item_ids: std::vec::Vec<u32>| {
            iref.entries.push(IrefEntry {
                reference_type,
                from_item_id,
                to_item_ids,
            });
        };

        let (color_id, alpha_id) = match self.id_of(ItemRole::ColorGrid) {
            Some(color_grid) => {
                add(codes::DIMG, color_grid, self.ids_of(ItemRole::Color).collect());
                let alpha_grid = self.id_of(ItemRole::AlphaGrid);
                if let Some(alpha_grid) = alpha_grid {
                    add(codes::DIMG, alpha_grid, self.ids_of(ItemRole::Alpha).collect());
                }
                (color_grid, alpha_grid)
            },
            None => (self.primary_item_id, self.id_of(ItemRole::Alpha)),
        };
        if let Some(alpha_id) = alpha_id {
            add(codes::AUXL, alpha_id, vec![color_id]);
            if self.premultiplied_alpha {
                add(codes::PREM, color_id, vec![alpha_id]);
            }
        }
        for role in [ItemRole::Exif, ItemRole::Xmp] {
            if let Some(id) = self.id_of(role) {
                add(codes::CDSC, id, vec![self.primary_item_id]);
            }
        }
        iref
    }

    fn meta_box(&self, wide_fields: bool) -> Result<MetaBox> {
        Ok(MetaBox {
            pitm: PitmBox(self.primary_item_id),
            iloc: self.locations(wide_fields),
            iinf: self.infos(),
            iref: self.references(),
            iprp: self.properties()?,
            idat: (!self.idat.is_empty()).then(|| IdatBox { data: self.idat.clone() }),
        })
    }

    /// Payloads in file order: metadata, then alpha, then color.
    fn payload_order(&self) -> impl Iterator<Item = &WriterItem<'a>> + '_ {
        let rank = |role| match role {
            ItemRole::Exif | ItemRole::Xmp => Some(0),
            ItemRole::Alpha => Some(1),
            ItemRole::Color => Some(2),
            ItemRole::ColorGrid | ItemRole::AlphaGrid => None,
        };
        (0..3).flat_map(move |pass| self.items.iter().filter(move |i| rank(i.role) == Some(pass)))
    }

    fn media_data_len(&self) -> u64 {
        self.payload_order().map(|i| i.payload.len().to_u64()).sum()
    }

    fn image_payload_count(&self) -> usize {
        self.items.iter().filter(|i| i.role.is_image_payload()).count()
    }
}

fn spatial_extents(width: u32, height: u32) -> ItemProperty {
    ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width, height })
}

fn pixel_information(image: &CompressedImage) -> ItemProperty {
    ItemProperty::PixelInformation(PixelInformation::uniform(image.format.channel_count(), image.bit_depth))
}

/// File Type box (chunk)
#[derive(Debug, Clone)]
struct FtypBox {
    major_brand: FourCC,
    minor_version: u32,
    compatible_brands: [FourCC; 3],
}

impl FtypBox {
    fn avif() -> Self {
        Self {
            major_brand: codes::AVIF,
            minor_version: 0,
            compatible_brands: [codes::AVIF, codes::MIF1, codes::MIAF],
        }
    }
}

impl MpegBox for FtypBox {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE
            + 4 // brand
            + 4 // ver
            + 4 * self.compatible_brands.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"ftyp")?;
        b.push(&self.major_brand.value)?;
        b.u32(self.minor_version)?;
        for cb in &self.compatible_brands {
            b.push(&cb.value)?;
        }
        Ok(())
    }
}

/// Metadata box. Not an [`MpegBox`] because writing it also records where
/// 'iloc' offsets must be patched.
#[derive(Debug)]
struct MetaBox {
    pitm: PitmBox,
    iloc: IlocBox,
    iinf: IinfBox,
    iref: IrefBox,
    iprp: IprpBox,
    idat: Option<IdatBox>,
}

impl MetaBox {
    fn len(&self) -> usize {
        FULL_BOX_SIZE
            + HdlrBox.len()
            + self.pitm.len()
            + self.iloc.len()
            + self.iinf.len()
            + if self.iref.is_empty() { 0 } else { self.iref.len() }
            + self.iprp.len()
            + self.idat.as_ref().map_or(0, MpegBox::len)
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>, sites: &mut std::vec::Vec<PatchSite>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.full_box(*b"meta", 0, 0)?;
        HdlrBox.write(&mut b)?;
        self.pitm.write(&mut b)?;
        self.iloc.write(&mut b, sites)?;
        self.iinf.write(&mut b)?;
        if !self.iref.is_empty() {
            self.iref.write(&mut b)?;
        }
        self.iprp.write(&mut b)?;
        if let Some(idat) = &self.idat {
            idat.write(&mut b)?;
        }
        Ok(())
    }
}

fn write_mdat_header<W: Write>(out: &mut BigEndianWriter<W>, payload_len: u64) -> std::io::Result<()> {
    let compact = payload_len
        .checked_add(BASIC_BOX_SIZE.to_u64())
        .and_then(|size| u32::try_from(size).ok());
    match compact {
        Some(size) => {
            out.write_u32(size)?;
            out.write_bytes(b"mdat")
        },
        None => {
            out.write_u32(1)?;
            out.write_bytes(b"mdat")?;
            out.write_u64(payload_len.saturating_add(16))
        },
    }
}

type ProgressCallback<'a> = std::boxed::Box<dyn FnMut(u8) + 'a>;

/// Builds an AVIF file from already-compressed images.
///
/// ```
/// use avif_container::{AvifReader, AvifWriter, ChromaSubsampling, CompressedImage};
///
/// let color = CompressedImage::new(vec![0x12, 0, 0x0a], 64, 64, ChromaSubsampling::Yuv420, 8);
/// let file = AvifWriter::new(color).write_to_vec()?;
/// let mut reader = AvifReader::from_bytes(&file)?;
/// assert_eq!(&*reader.item_data(reader.primary_item_id())?, &[0x12, 0, 0x0a]);
/// # Ok::<(), avif_container::Error>(())
/// ```
pub struct AvifWriter<'a> {
    color: std::vec::Vec<CompressedImage>,
    alpha: std::vec::Vec<CompressedImage>,
    grid: Option<ImageGridMetadata>,
    color_information: Option<ColorInformation>,
    exif: Option<std::vec::Vec<u8>>,
    xmp: Option<std::vec::Vec<u8>>,
    premultiplied_alpha: bool,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> AvifWriter<'a> {
    /// A single, non-tiled image.
    pub fn new(color: CompressedImage) -> Self {
        Self::with_images(vec![color], None)
    }

    /// A grid of `tiles` in row-major order.
    pub fn from_tiles(tiles: std::vec::Vec<CompressedImage>, grid: ImageGridMetadata) -> Self {
        Self::with_images(tiles, Some(grid))
    }

    fn with_images(color: std::vec::Vec<CompressedImage>, grid: Option<ImageGridMetadata>) -> Self {
        Self {
            color,
            alpha: std::vec::Vec::new(),
            grid,
            color_information: None,
            exif: None,
            xmp: None,
            premultiplied_alpha: false,
            progress: None,
        }
    }

    /// Alpha plane of a single image, usually monochrome.
    pub fn with_alpha(self, alpha: CompressedImage) -> Self {
        self.with_alpha_tiles(vec![alpha])
    }

    /// Alpha planes, one per color tile in the same order.
    pub fn with_alpha_tiles(mut self, alpha: std::vec::Vec<CompressedImage>) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_color_information(mut self, colr: ColorInformation) -> Self {
        self.color_information = Some(colr);
        self
    }

    /// `exif` is a TIFF stream. The 4-byte TIFF header offset is prepended
    /// unless the blob already starts with one.
    pub fn with_exif(mut self, exif: std::vec::Vec<u8>) -> Self {
        self.exif = Some(if has_tiff_header_offset(&exif) {
            exif
        } else {
            let mut payload = std::vec::Vec::with_capacity(4 + exif.len());
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(&exif);
            payload
        });
        self
    }

    /// An XMP packet, stored as an 'application/rdf+xml' item.
    pub fn with_xmp(mut self, xmp: std::vec::Vec<u8>) -> Self {
        self.xmp = Some(xmp);
        self
    }

    pub fn with_premultiplied_alpha(mut self, premultiplied: bool) -> Self {
        self.premultiplied_alpha = premultiplied;
        self
    }

    /// Called with a percentage after each color or alpha payload is written.
    pub fn with_progress(mut self, callback: impl FnMut(u8) + 'a) -> Self {
        self.progress = Some(std::boxed::Box::new(callback));
        self
    }

    /// Writes the file at the sink's current position, then leaves the
    /// sink positioned after the last byte.
    pub fn write<W: Write + Seek>(&mut self, out: W) -> Result<()> {
        let mut progress = self.progress.take();
        let result = self.assemble(out, &mut progress);
        self.progress = progress;
        result
    }

    /// Writes into memory, for sinks that can't seek.
    pub fn write_to_vec(&mut self) -> Result<std::vec::Vec<u8>> {
        let mut cursor = Cursor::new(std::vec::Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn assemble<W: Write + Seek>(&self, out: W, progress: &mut Option<ProgressCallback<'a>>) -> Result<()> {
        let state = AvifWriterState::new(self)?;
        let ftyp = FtypBox::avif();
        let media_len = state.media_data_len();
        let mut meta = state.meta_box(false)?;
        let narrow_total = (ftyp.len() + meta.len()).to_u64() + 16 + media_len;
        if narrow_total > u64::from(u32::MAX) {
            meta = state.meta_box(true)?;
        }

        // Phase 1: headers, with placeholder offsets for every payload.
        let mut header = std::vec::Vec::new();
        header.try_reserve(ftyp.len() + meta.len())?;
        let mut sites = std::vec::Vec::new();
        {
            let mut w = Writer::new(&mut header);
            ftyp.write(&mut w)?;
            meta.write(&mut w, &mut sites)?;
        }

        let mut out = BigEndianWriter::from_seekable(out)?;
        let file_start = out.position();
        out.write_bytes(&header)?;
        drop(header);
        write_mdat_header(&mut out, media_len)?;

        // Phase 2: payloads, recording where each one starts.
        let total = state.image_payload_count();
        let mut done = 0;
        let mut offsets = std::vec::Vec::with_capacity(state.items.len());
        for item in state.payload_order() {
            offsets.push((item.id, out.position() - file_start));
            out.write_bytes(item.payload)?;
            if item.role.is_image_payload() {
                done += 1;
                if let Some(callback) = progress {
                    callback((done * 100 / total) as u8);
                }
            }
        }
        let end = out.position();

        // Phase 3: overwrite the placeholders.
        for site in &sites {
            let offset = offsets
                .iter()
                .find(|&&(id, _)| id == site.item_id)
                .map(|&(_, offset)| offset)
                .ok_or(Error::InvalidInput("iloc entry without a payload"))?;
            out.seek_to(file_start + site.position)?;
            if site.width == 4 {
                let offset = u32::try_from(offset).map_err(|_| Error::InvalidInput("offset exceeds the iloc field"))?;
                out.write_u32(offset)?;
            } else {
                out.write_u64(offset)?;
            }
        }
        out.seek_to(end)?;
        out.flush()?;
        debug!("wrote {} bytes, {} patched offsets", end - file_start, sites.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::NclxColor;

    fn image(fill: u8, len: usize, size: u32, format: ChromaSubsampling) -> CompressedImage {
        CompressedImage::new(vec![fill; len], size, size, format, 8)
    }

    fn single_with_alpha() -> AvifWriter<'static> {
        AvifWriter::new(image(1, 100, 256, ChromaSubsampling::Yuv420))
            .with_alpha(image(2, 40, 256, ChromaSubsampling::Yuv400))
    }

    #[test]
    fn ids_interleave_color_and_alpha_tiles() {
        let grid = ImageGridMetadata::from_tiles(2, 1, 64, 64).unwrap();
        let writer = AvifWriter::from_tiles(vec![image(1, 5, 64, ChromaSubsampling::Yuv444); 2], grid)
            .with_alpha_tiles(vec![image(2, 5, 64, ChromaSubsampling::Yuv400); 2])
            .with_exif(vec![b'M', b'M', 0, 42])
            .with_xmp(b"<x/>".to_vec());
        let state = AvifWriterState::new(&writer).unwrap();
        let layout: std::vec::Vec<_> = state.items.iter().map(|i| (i.id, i.role)).collect();
        assert_eq!(
            layout,
            [
                (1, ItemRole::Color),
                (2, ItemRole::Alpha),
                (3, ItemRole::Color),
                (4, ItemRole::Alpha),
                (5, ItemRole::ColorGrid),
                (6, ItemRole::AlphaGrid),
                (7, ItemRole::Exif),
                (8, ItemRole::Xmp),
            ]
        );
        assert_eq!(state.primary_item_id, 5);
        let order: std::vec::Vec<_> = state.payload_order().map(|i| i.id).collect();
        assert_eq!(order, [7, 8, 2, 4, 1, 3]);
    }

    #[test]
    fn shared_properties_are_stored_once() {
        let writer = single_with_alpha();
        let state = AvifWriterState::new(&writer).unwrap();
        let iprp = state.properties().unwrap();
        // ispe and pasp shared; av1C, pixi, auxC separate.
        assert_eq!(iprp.ipco.properties().len(), 7);
        let color = &iprp.ipma.entries[0];
        let alpha = &iprp.ipma.entries[1];
        assert_eq!(color.associations[..2], alpha.associations[..2]);
        assert_ne!(color.associations[2].index, alpha.associations[2].index);
        assert!(color.associations[2].essential);
        assert!(!color.associations[0].essential);
    }

    #[test]
    fn monochrome_color_shares_codec_properties_with_alpha() {
        let writer = AvifWriter::new(image(1, 10, 32, ChromaSubsampling::Yuv400))
            .with_alpha(image(2, 10, 32, ChromaSubsampling::Yuv400));
        let iprp = AvifWriterState::new(&writer).unwrap().properties().unwrap();
        // ispe, pasp, av1C, pixi and auxC
        assert_eq!(iprp.ipco.properties().len(), 5);
    }

    #[test]
    fn alpha_references_color() {
        let writer = single_with_alpha().with_premultiplied_alpha(true);
        let iref = AvifWriterState::new(&writer).unwrap().references();
        let refs: std::vec::Vec<_> = iref
            .entries
            .iter()
            .map(|e| (e.reference_type, e.from_item_id, e.to_item_ids.clone()))
            .collect();
        assert_eq!(refs, [(codes::AUXL, 2, vec![1]), (codes::PREM, 1, vec![2])]);
    }

    #[test]
    fn rejects_inconsistent_input() {
        fn err(w: AvifWriter<'_>) -> bool {
            matches!(AvifWriterState::new(&w), Err(Error::InvalidInput(_)))
        }
        let c = || image(1, 4, 64, ChromaSubsampling::Yuv420);

        assert!(err(AvifWriter::new(c()).with_alpha_tiles(vec![c(), c()])));
        assert!(err(AvifWriter::new(c()).with_alpha(image(1, 4, 32, ChromaSubsampling::Yuv400))));
        assert!(err(AvifWriter::new(CompressedImage::new(vec![], 64, 64, ChromaSubsampling::Yuv420, 8))));
        assert!(err(AvifWriter::new(CompressedImage::new(vec![1], 64, 64, ChromaSubsampling::Yuv420, 9))));
        assert!(err(AvifWriter::from_tiles(vec![], ImageGridMetadata::from_tiles(1, 1, 64, 64).unwrap())));

        let mut two = AvifWriter::new(c());
        two.color.push(c());
        assert!(err(two));

        let grid = ImageGridMetadata::from_tiles(2, 2, 64, 64).unwrap();
        assert!(err(AvifWriter::from_tiles(vec![c(); 3], grid)));
        // 4:2:0 grids need an even number of columns and rows.
        let odd = ImageGridMetadata::from_tiles(3, 1, 64, 64).unwrap();
        assert!(err(AvifWriter::from_tiles(vec![c(); 3], odd)));
        assert!(!err(AvifWriter::from_tiles(vec![c(); 4], grid)));
    }

    #[test]
    fn odd_width_420_tiles_are_rejected() {
        let tile = || CompressedImage::new(vec![1; 8], 33, 32, ChromaSubsampling::Yuv420, 8);
        let grid = ImageGridMetadata::from_tiles(4, 2, 33, 32).unwrap();
        let result = AvifWriter::from_tiles(vec![tile(); 8], grid).write_to_vec();
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let tile = || CompressedImage::new(vec![1; 8], 33, 32, ChromaSubsampling::Yuv444, 8);
        assert!(AvifWriter::from_tiles(vec![tile(); 8], grid).write_to_vec().is_ok());
    }

    #[test]
    fn exif_gets_offset_prefix_once() {
        let tiff = vec![b'I', b'I', 42, 0, 8, 0, 0, 0];
        let writer = AvifWriter::new(image(1, 4, 8, ChromaSubsampling::Yuv444)).with_exif(tiff.clone());
        let exif = writer.exif.as_ref().unwrap();
        assert_eq!(exif[..4], [0, 0, 0, 0]);
        assert_eq!(exif[4..], tiff[..]);

        let prefixed = exif.clone();
        let writer = AvifWriter::new(image(1, 4, 8, ChromaSubsampling::Yuv444)).with_exif(prefixed.clone());
        assert_eq!(writer.exif.unwrap(), prefixed);
    }

    #[test]
    fn patched_offsets_point_at_payloads() {
        let mut writer = single_with_alpha();
        let file = writer.write_to_vec().unwrap();
        let mut header = std::vec::Vec::new();
        let state = AvifWriterState::new(&writer).unwrap();
        let mut sites = std::vec::Vec::new();
        {
            let mut w = Writer::new(&mut header);
            FtypBox::avif().write(&mut w).unwrap();
            state.meta_box(false).unwrap().write(&mut w, &mut sites).unwrap();
        }
        let payload_start = header.len() + 8;
        let offset_at = |id: u32| {
            let site = sites.iter().find(|s| s.item_id == id).unwrap();
            let p = site.position as usize;
            u32::from_be_bytes(file[p..p + 4].try_into().unwrap()) as usize
        };
        // Alpha is written before color.
        assert_eq!(offset_at(2), payload_start);
        assert_eq!(offset_at(1), payload_start + 40);
        assert_eq!(file.len(), payload_start + 140);
        assert_eq!(&file[header.len() + 4..header.len() + 8], b"mdat");
    }

    #[test]
    fn writes_after_existing_sink_content() {
        let mut sink = Cursor::new(b"prefix".to_vec());
        sink.set_position(6);
        AvifWriter::new(image(7, 3, 16, ChromaSubsampling::Yuv420))
            .write(&mut sink)
            .unwrap();
        let bytes = sink.into_inner();
        let avif = &bytes[6..];
        let mut reader = crate::AvifReader::from_bytes(avif).unwrap();
        assert_eq!(&*reader.item_data(1).unwrap(), &[7, 7, 7]);
    }

    #[test]
    fn progress_reports_each_image_payload() {
        let mut seen = std::vec::Vec::new();
        let grid = ImageGridMetadata::from_tiles(2, 2, 64, 64).unwrap();
        AvifWriter::from_tiles(vec![image(1, 3, 64, ChromaSubsampling::Yuv444); 4], grid)
            .with_exif(vec![0, 0, 0, 0, b'I', b'I', 42, 0])
            .with_progress(|p| seen.push(p))
            .write_to_vec()
            .unwrap();
        assert_eq!(seen, [25, 50, 75, 100]);
    }

    #[test]
    fn failed_writes_report_no_progress() {
        let mut calls = 0;
        let result = AvifWriter::new(image(1, 0, 16, ChromaSubsampling::Yuv420))
            .with_progress(|_| calls += 1)
            .write_to_vec();
        assert!(result.is_err());
        assert_eq!(calls, 0);
    }

    #[test]
    fn color_information_goes_on_the_primary_item() {
        let grid = ImageGridMetadata::from_tiles(1, 2, 64, 64).unwrap();
        let writer = AvifWriter::from_tiles(vec![image(1, 3, 64, ChromaSubsampling::Yuv444); 2], grid)
            .with_color_information(ColorInformation::Nclx(NclxColor::SRGB));
        let state = AvifWriterState::new(&writer).unwrap();
        let iprp = state.properties().unwrap();
        let has_colr = |id: u32| {
            iprp.ipma
                .entries
                .iter()
                .find(|e| e.item_id == id)
                .unwrap()
                .associations
                .iter()
                .any(|a| matches!(iprp.ipco.properties()[usize::from(a.index) - 1], ItemProperty::ColorInformation(_)))
        };
        assert!(has_colr(3));
        assert!(!has_colr(1));
        assert!(state.infos().items[0].hidden);
        assert!(!state.infos().items[2].hidden);
    }
}
