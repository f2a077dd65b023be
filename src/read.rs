// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level file parsing and item access.

use crate::bmff::{BMFFBox, BoxIter, ParseContext, check_parser_state, read_fullbox_version_no_flags, skip_box_content};
use crate::boxes::{BoxType, FourCC, codes};
use crate::exif::ExifData;
use crate::grid::{ImageGridDescriptor, ImageGridInfo, ImageGridMetadata};
use crate::items::{
    ConstructionMethod, ItemInfoEntry, ItemLocationEntry, ItemLocationExtent, ItemReference, XMP_CONTENT_TYPE,
    read_hdlr, read_iinf, read_iloc, read_iref, read_pitm,
};
use crate::layers::layer_byte_range;
use crate::properties::{
    AuxiliaryType, ColorInformation, ImageSpatialExtents, ItemPropertiesBox, ItemProperty, LayeredImageIndexing,
    PixelInformation, PropertyAssociation, read_iprp,
};
use crate::reader::BinaryReader;
use crate::{Av1ConfigBox, DecodeConfig, Error, ParseOptions, ResourceTracker, Result, Stop, ToU64, TryVec, Unstoppable};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek};

/// Limit on chains of items built from other items (construction method 2).
const MAX_CONSTRUCTION_DEPTH: usize = 8;

/// See ISO 14496-12:2015 § 4.3
#[derive(Debug, PartialEq)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    /// Whether `brand` is the major brand or one of the compatible brands.
    pub fn has_brand(&self, brand: &[u8; 4]) -> bool {
        self.major_brand == brand || self.compatible_brands.iter().any(|&b| b == brand)
    }
}

fn read_ftyp<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<FileTypeBox> {
    let major = src.read_fourcc()?;
    let minor = src.read_u32()?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count.try_into()?)?;
    for _ in 0..brand_count {
        brands.push(src.read_fourcc()?)?;
    }
    Ok(FileTypeBox {
        major_brand: major,
        minor_version: minor,
        compatible_brands: brands,
    })
}

fn check_brands(ftyp: &FileTypeBox, options: &ParseOptions) -> Result<()> {
    if ftyp.major_brand == &codes::AVIF.value || ftyp.major_brand == &codes::AVIS.value {
        return Ok(());
    }
    let compatible = ftyp
        .compatible_brands
        .iter()
        .any(|&b| b == codes::AVIF || b == codes::AVIS);
    if options.lenient && compatible {
        warn!("major_brand {} accepted through compatible brands", ftyp.major_brand);
        return Ok(());
    }
    warn!("major_brand: {}", ftyp.major_brand);
    Err(Error::InvalidData("ftyp must be 'avif' or 'avis'"))
}

/// Payload bounds of one 'mdat' box. The payload itself is not buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDataBounds {
    /// Stream offset of the first payload byte.
    pub offset: u64,
    pub length: u64,
}

impl MediaDataBounds {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// A top-level box this crate doesn't interpret, kept so callers can find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownBox {
    pub box_type: FourCC,
    /// Stream offset of the box header.
    pub offset: u64,
    /// Size including the header.
    pub size: u64,
}

/// Everything the 'meta' box declares, plus the layout of the rest of the file.
#[derive(Debug)]
pub struct AvifContainer {
    pub ftyp: FileTypeBox,
    pub handler_type: FourCC,
    pub primary_item_id: u32,
    pub item_infos: TryVec<ItemInfoEntry>,
    pub item_locations: TryVec<ItemLocationEntry>,
    pub item_references: TryVec<ItemReference>,
    pub(crate) properties: ItemPropertiesBox,
    pub idat: Option<TryVec<u8>>,
    pub media_data: TryVec<MediaDataBounds>,
    pub unknown_boxes: TryVec<UnknownBox>,
}

struct MetaBox {
    handler_type: FourCC,
    primary_item_id: u32,
    item_infos: TryVec<ItemInfoEntry>,
    item_locations: TryVec<ItemLocationEntry>,
    item_references: TryVec<ItemReference>,
    properties: ItemPropertiesBox,
    idat: Option<TryVec<u8>>,
}

fn parse_container<R: Read + Seek>(
    source: &mut BinaryReader<R>,
    ctx: &mut ParseContext,
    stop: &dyn Stop,
) -> Result<AvifContainer> {
    let mut root = source.full();
    let mut iter = BoxIter::new(&mut root);

    // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
    let ftyp = match iter.next_box()? {
        Some(mut b) if b.head.name == BoxType::FileTypeBox => {
            let ftyp = read_ftyp(&mut b)?;
            check_parser_state(&b)?;
            ftyp
        },
        _ => return Err(Error::InvalidData("'ftyp' box must occur first")),
    };
    check_brands(&ftyp, &ctx.options)?;

    let mut meta = None;
    let mut media_data = TryVec::new();
    let mut unknown_boxes = TryVec::new();

    while let Some(mut b) = iter.next_box()? {
        stop.check()?;

        match b.head.name {
            BoxType::MetadataBox => {
                if meta.is_some() {
                    return Err(Error::InvalidData("There should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1"));
                }
                meta = Some(read_meta(&mut b, ctx)?);
            },
            BoxType::MediaDataBox => {
                media_data.push(MediaDataBounds {
                    offset: b.content.start(),
                    length: b.bytes_left(),
                })?;
                skip_box_content(&mut b)?;
            },
            BoxType::FileTypeBox => {
                return Err(Error::InvalidData("There should be exactly one ftyp box"));
            },
            BoxType::FreeBox | BoxType::SkipBox => skip_box_content(&mut b)?,
            _ => {
                debug!("keeping unknown top-level box {:?}", b.head);
                unknown_boxes.push(UnknownBox {
                    box_type: b.head.fourcc(),
                    offset: b.head.start,
                    size: b.head.size,
                })?;
                skip_box_content(&mut b)?;
            },
        }

        check_parser_state(&b)?;
    }

    let meta = meta.ok_or(Error::InvalidData("missing meta"))?;
    let container = AvifContainer {
        ftyp,
        handler_type: meta.handler_type,
        primary_item_id: meta.primary_item_id,
        item_infos: meta.item_infos,
        item_locations: meta.item_locations,
        item_references: meta.item_references,
        properties: meta.properties,
        idat: meta.idat,
        media_data,
        unknown_boxes,
    };
    container.validate()?;
    Ok(container)
}

/// Parse the 'meta' box of an image file.
/// See ISO 23008-12:2017 § 6.2 and ISO 14496-12:2015 § 8.11.1
fn read_meta<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<MetaBox> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported meta version"));
    }

    let mut handler_type = None;
    let mut primary_item_id = None;
    let mut item_infos = None;
    let mut item_locations = None;
    let mut item_references = None;
    let mut properties = None;
    let mut idat = None;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::HandlerBox => {
                if handler_type.is_some() {
                    return Err(Error::InvalidData("There should be exactly one hdlr box per ISO 14496-12:2015 § 8.4.3.1"));
                }
                handler_type = Some(read_hdlr(&mut b, ctx)?);
            },
            BoxType::PrimaryItemBox => {
                if primary_item_id.is_some() {
                    return Err(Error::InvalidData("There should be zero or one pitm boxes per ISO 14496-12:2015 § 8.11.4.1"));
                }
                primary_item_id = Some(read_pitm(&mut b, ctx)?);
            },
            BoxType::ItemInfoBox => {
                if item_infos.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iinf boxes per ISO 14496-12:2015 § 8.11.6.1"));
                }
                item_infos = Some(read_iinf(&mut b, ctx)?);
            },
            BoxType::ItemLocationBox => {
                if item_locations.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iloc boxes per ISO 14496-12:2015 § 8.11.3.1"));
                }
                item_locations = Some(read_iloc(&mut b, ctx)?);
            },
            BoxType::ItemReferenceBox => {
                if item_references.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iref boxes per ISO 14496-12:2015 § 8.11.12.1"));
                }
                item_references = Some(read_iref(&mut b, ctx)?);
            },
            BoxType::ItemPropertiesBox => {
                if properties.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iprp boxes per ISO 23008-12:2017 § 9.3.1"));
                }
                properties = Some(read_iprp(&mut b, ctx)?);
            },
            BoxType::ItemDataBox => {
                if idat.is_some() {
                    return Err(Error::InvalidData("There should be zero or one idat boxes"));
                }
                idat = Some(b.read_into_try_vec(&mut ctx.tracker)?);
            },
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b)?;
    }

    let handler_type = match handler_type {
        Some(handler) if handler == &codes::PICT.value => handler,
        Some(handler) if ctx.options.lenient => {
            warn!("hdlr type {handler} is not 'pict'");
            handler
        },
        Some(_) => return Err(Error::InvalidData("hdlr type must be 'pict'")),
        None if ctx.options.lenient => {
            warn!("meta has no hdlr box");
            codes::PICT
        },
        None => return Err(Error::InvalidData("Required hdlr box not present in meta box")),
    };

    Ok(MetaBox {
        handler_type,
        primary_item_id: primary_item_id.ok_or(Error::InvalidData("Required pitm box not present in meta box"))?,
        item_infos: item_infos.ok_or(Error::InvalidData("iinf missing"))?,
        item_locations: item_locations.ok_or(Error::InvalidData("iloc missing"))?,
        item_references: item_references.unwrap_or_default(),
        properties: properties.unwrap_or_default(),
        idat,
    })
}

/// Fails if following 'dimg' references from any item leads back to it.
fn check_derivation_graph(references: &[ItemReference]) -> Result<()> {
    let mut edges: BTreeMap<u32, std::vec::Vec<u32>> = BTreeMap::new();
    for r in references.iter().filter(|r| r.reference_type == codes::DIMG) {
        let targets = edges.entry(r.from_item_id).or_default();
        targets.try_reserve(r.to_item_ids.len())?;
        targets.extend_from_slice(&r.to_item_ids);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }
    let mut marks = BTreeMap::new();
    let mut stack = std::vec::Vec::new();
    for &root in edges.keys() {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::InProgress);
        stack.push((root, 0usize));
        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            let children = edges.get(&node).map_or(&[][..], |c| c.as_slice());
            match children.get(next) {
                Some(&child) => {
                    top.1 += 1;
                    match marks.get(&child) {
                        Some(Mark::InProgress) => return Err(Error::InvalidData("dimg references form a cycle")),
                        Some(Mark::Done) => {},
                        None => {
                            marks.insert(child, Mark::InProgress);
                            stack.try_reserve(1)?;
                            stack.push((child, 0));
                        },
                    }
                },
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                },
            }
        }
    }
    Ok(())
}

impl AvifContainer {
    fn validate(&self) -> Result<()> {
        match self.item_info(self.primary_item_id) {
            Some(info) if info.item_type == codes::AV01 || info.item_type == codes::GRID => {},
            Some(info) => {
                warn!("primary_item_id type: {}", info.item_type);
                return Err(Error::InvalidData("primary_item_id type is not av01 or grid"));
            },
            None => return Err(Error::InvalidData("primary_item_id not present in iinf box")),
        }
        check_derivation_graph(&self.item_references)
    }

    pub fn item_info(&self, item_id: u32) -> Option<&ItemInfoEntry> {
        self.item_infos.iter().find(|i| i.item_id == item_id)
    }

    pub fn item_location(&self, item_id: u32) -> Option<&ItemLocationEntry> {
        self.item_locations.iter().find(|l| l.item_id == item_id)
    }

    /// The shared property list, in 'ipco' order. Association indices are 1-based into it.
    pub fn properties(&self) -> &[ItemProperty] {
        &self.properties.properties
    }

    /// Properties associated with `item_id`, in association order.
    pub fn item_properties(&self, item_id: u32) -> impl Iterator<Item = (&ItemProperty, PropertyAssociation)> + '_ {
        self.properties
            .associations_for(item_id)
            .iter()
            .filter_map(|&a| self.properties.property(a.index).map(|p| (p, a)))
    }

    fn find_property<'a, T>(&'a self, item_id: u32, f: impl Fn(&'a ItemProperty) -> Option<T>) -> Option<T> {
        self.item_properties(item_id).find_map(|(p, _)| f(p))
    }

    pub fn spatial_extents(&self, item_id: u32) -> Option<&ImageSpatialExtents> {
        self.find_property(item_id, |p| match p {
            ItemProperty::ImageSpatialExtents(e) => Some(e),
            _ => None,
        })
    }

    pub fn av1_config(&self, item_id: u32) -> Option<&Av1ConfigBox> {
        self.find_property(item_id, |p| match p {
            ItemProperty::AV1Config(c) => Some(c),
            _ => None,
        })
    }

    /// The first 'colr' of the item. A file may carry both an ICC and an NCLX one.
    pub fn color_information(&self, item_id: u32) -> Option<&ColorInformation> {
        self.find_property(item_id, |p| match p {
            ItemProperty::ColorInformation(c) => Some(c),
            _ => None,
        })
    }

    pub fn pixel_information(&self, item_id: u32) -> Option<&PixelInformation> {
        self.find_property(item_id, |p| match p {
            ItemProperty::PixelInformation(px) => Some(px),
            _ => None,
        })
    }

    pub fn auxiliary_type(&self, item_id: u32) -> Option<&AuxiliaryType> {
        self.find_property(item_id, |p| match p {
            ItemProperty::AuxiliaryType(aux) => Some(aux),
            _ => None,
        })
    }

    pub fn layered_image_indexing(&self, item_id: u32) -> Option<&LayeredImageIndexing> {
        self.find_property(item_id, |p| match p {
            ItemProperty::LayeredImageIndexing(a1lx) => Some(a1lx),
            _ => None,
        })
    }

    pub fn layer_selector(&self, item_id: u32) -> Option<u16> {
        self.find_property(item_id, |p| match *p {
            ItemProperty::LayerSelector(layer) => Some(layer),
            _ => None,
        })
    }

    pub fn operating_point(&self, item_id: u32) -> Option<u8> {
        self.find_property(item_id, |p| match *p {
            ItemProperty::OperatingPoint(op) => Some(op),
            _ => None,
        })
    }

    /// Targets of `reference_type` references from `item_id`, in declaration order.
    pub fn references_from(&self, item_id: u32, reference_type: FourCC) -> impl Iterator<Item = u32> + '_ {
        self.item_references
            .iter()
            .filter(move |r| r.from_item_id == item_id && r.reference_type == reference_type)
            .flat_map(|r| r.to_item_ids.iter().copied())
    }

    /// Items with a `reference_type` reference to `item_id`.
    pub fn references_to(&self, item_id: u32, reference_type: FourCC) -> impl Iterator<Item = u32> + '_ {
        self.item_references
            .iter()
            .filter(move |r| r.reference_type == reference_type && r.to_item_ids.contains(&item_id))
            .map(|r| r.from_item_id)
    }

    /// The alpha plane of `item_id`: an 'auxl' reference plus an alpha 'auxC'.
    pub fn alpha_item_id(&self, item_id: u32) -> Option<u32> {
        self.references_to(item_id, codes::AUXL)
            .filter(|&id| id != item_id)
            .find(|&id| self.auxiliary_type(id).is_some_and(AuxiliaryType::is_alpha))
    }

    /// Whether color values of `item_id` are premultiplied by its alpha plane.
    ///
    /// See `prem` in MIAF § 7.3.5.2
    pub fn is_alpha_premultiplied(&self, item_id: u32) -> bool {
        self.alpha_item_id(item_id)
            .is_some_and(|alpha| self.references_from(item_id, codes::PREM).any(|id| id == alpha))
    }

    /// Tile ids of a grid item, in row-major order.
    pub fn grid_tile_ids(&self, item_id: u32) -> Result<TryVec<u32>> {
        let mut tiles = TryVec::new();
        for id in self.references_from(item_id, codes::DIMG) {
            tiles.push(id)?;
        }
        Ok(tiles)
    }

    /// The EXIF item describing the primary item.
    pub fn exif_item_id(&self) -> Option<u32> {
        self.references_to(self.primary_item_id, codes::CDSC)
            .find(|&id| self.item_info(id).is_some_and(|i| i.item_type == codes::EXIF))
    }

    /// The XMP item describing the primary item.
    pub fn xmp_item_id(&self) -> Option<u32> {
        self.references_to(self.primary_item_id, codes::CDSC).find(|&id| {
            self.item_info(id).is_some_and(|i| {
                i.item_type == codes::MIME && i.content_type() == Some(XMP_CONTENT_TYPE)
            })
        })
    }

    /// An item is unusable when it is protected, or when an essential
    /// association names a property this crate doesn't understand.
    pub fn is_item_usable(&self, item_id: u32) -> bool {
        let Some(info) = self.item_info(item_id) else {
            return false;
        };
        if info.item_protection_index != 0 {
            return false;
        }
        self.properties
            .associations_for(item_id)
            .iter()
            .filter(|a| a.essential)
            .all(|a| self.properties.property(a.index).is_some_and(ItemProperty::is_known))
    }

    fn media_data_end(&self, offset: u64) -> Option<u64> {
        self.media_data.iter().find(|m| m.contains(offset)).map(MediaDataBounds::end)
    }
}

/// Resolves an extent to `(start, length)` inside a source of `source_len`
/// bytes. A zero length runs to the end of the source.
fn extent_range(offset: u64, length: u64, source_len: u64) -> Result<(u64, u64)> {
    if offset > source_len {
        return Err(Error::InvalidData("extent starts past the end of its source"));
    }
    let length = if length == 0 { source_len - offset } else { length };
    let end = offset.checked_add(length).ok_or(Error::InvalidData("extent end overflow"))?;
    if end > source_len {
        return Err(Error::InvalidData("extent exceeds its source"));
    }
    Ok((offset, length))
}

/// Resolves every extent against the length of its source, returning the
/// ranges and their total length.
fn resolve_extents(
    extents: &[ItemLocationExtent],
    source_len: impl Fn(&ItemLocationExtent) -> u64,
) -> Result<(TryVec<(u64, u64)>, u64)> {
    let mut ranges = TryVec::with_capacity(extents.len())?;
    let mut total = 0u64;
    for e in extents {
        let range = extent_range(e.offset, e.length, source_len(e))?;
        total = total.checked_add(range.1).ok_or(Error::InvalidData("item size overflow"))?;
        ranges.push(range)?;
    }
    Ok((ranges, total))
}

fn copy_range(data: &mut TryVec<u8>, source: &[u8], (start, length): (u64, u64)) -> Result<()> {
    let start: usize = start.try_into()?;
    let end = start + usize::try_from(length)?;
    let slice = source.get(start..end).ok_or(Error::InvalidData("extent out of bounds"))?;
    data.extend_from_slice(slice)?;
    Ok(())
}

/// Reads AVIF files from a seekable source.
///
/// The box structure is parsed up front; item payloads stay in the source
/// until requested.
pub struct AvifReader<R> {
    source: BinaryReader<R>,
    container: AvifContainer,
    tracker: ResourceTracker,
}

impl<'a> AvifReader<Cursor<&'a [u8]>> {
    /// Parse AVIF data from a byte slice.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        Self::new(Cursor::new(data))
    }

    pub fn from_bytes_with_config(data: &'a [u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        Self::with_config(Cursor::new(data), config, stop)
    }
}

impl<R: Read + Seek> AvifReader<R> {
    pub fn new(source: R) -> Result<Self> {
        Self::with_config(source, &DecodeConfig::unlimited(), &Unstoppable)
    }

    /// Parse with resource limits and cooperative cancellation.
    ///
    /// `stop` is polled between top-level boxes.
    pub fn with_config(source: R, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let mut source = BinaryReader::new(source)?;
        let mut ctx = ParseContext::new(config);
        let container = parse_container(&mut source, &mut ctx, stop)?;
        ctx.tracker.release_all();
        debug!(
            "parsed {} items, primary {}",
            container.item_infos.len(),
            container.primary_item_id
        );
        Ok(Self {
            source,
            container,
            tracker: ctx.tracker,
        })
    }

    pub fn container(&self) -> &AvifContainer {
        &self.container
    }

    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }

    pub fn primary_item_id(&self) -> u32 {
        self.container.primary_item_id
    }

    pub fn items(&self) -> &[ItemInfoEntry] {
        &self.container.item_infos
    }

    pub fn item_info(&self, item_id: u32) -> Option<&ItemInfoEntry> {
        self.container.item_info(item_id)
    }

    pub fn item_location(&self, item_id: u32) -> Option<&ItemLocationEntry> {
        self.container.item_location(item_id)
    }

    pub fn properties_for(&self, item_id: u32) -> impl Iterator<Item = (&ItemProperty, PropertyAssociation)> + '_ {
        self.container.item_properties(item_id)
    }

    pub fn references(&self) -> &[ItemReference] {
        &self.container.item_references
    }

    /// Alpha plane of the primary item, if any.
    pub fn alpha_item_id(&self) -> Option<u32> {
        self.container.alpha_item_id(self.container.primary_item_id)
    }

    pub fn exif_item_id(&self) -> Option<u32> {
        self.container.exif_item_id()
    }

    pub fn xmp_item_id(&self) -> Option<u32> {
        self.container.xmp_item_id()
    }

    pub fn is_item_usable(&self, item_id: u32) -> bool {
        self.container.is_item_usable(item_id)
    }

    pub fn unknown_boxes(&self) -> &[UnknownBox] {
        &self.container.unknown_boxes
    }

    /// The concatenated extents of an item.
    pub fn item_data(&mut self, item_id: u32) -> Result<TryVec<u8>> {
        self.item_payload(item_id, 0)
    }

    /// Bytes of one spatial layer of a progressive item, sliced by its 'a1lx'.
    pub fn layer_data(&mut self, item_id: u32, layer_id: u16) -> Result<TryVec<u8>> {
        let indexing = *self
            .container
            .layered_image_indexing(item_id)
            .ok_or(Error::InvalidData("item has no a1lx property"))?;
        let data = self.item_data(item_id)?;
        let range = layer_byte_range(&indexing, data.len().to_u64(), layer_id)?;
        let mut layer = TryVec::new();
        copy_range(&mut layer, &data, (range.start, range.len()))?;
        Ok(layer)
    }

    /// The layer chosen by the item's 'lsel', or the whole item when it has
    /// none or selects all layers (0xFFFF).
    pub fn selected_layer_data(&mut self, item_id: u32) -> Result<TryVec<u8>> {
        match self.container.layer_selector(item_id) {
            Some(layer) if layer != u16::MAX => self.layer_data(item_id, layer),
            _ => self.item_data(item_id),
        }
    }

    /// Grid layout of a 'grid' item, or `None` for any other item type.
    pub fn grid_info(&mut self, item_id: u32) -> Result<Option<ImageGridInfo>> {
        let info = self
            .container
            .item_info(item_id)
            .ok_or(Error::InvalidData("item not found in iinf"))?;
        if info.item_type != codes::GRID {
            return Ok(None);
        }
        let tiles = self.container.grid_tile_ids(item_id)?;
        self.tracker.validate_grid_tiles(u32::try_from(tiles.len())?)?;

        let descriptor = ImageGridDescriptor::parse(&self.item_data(item_id)?)?;
        self.tracker
            .validate_total_megapixels(descriptor.output_width, descriptor.output_height)?;
        debug!(
            "grid {item_id}: {}x{} tiles, {}x{} output",
            descriptor.columns(),
            descriptor.rows(),
            descriptor.output_width,
            descriptor.output_height
        );
        ImageGridInfo::new(descriptor, tiles).map(Some)
    }

    /// Grid layout with the tile size declared by the tiles' 'ispe'.
    /// All tiles must declare the same size.
    pub fn grid_metadata(&mut self, item_id: u32) -> Result<Option<ImageGridMetadata>> {
        let Some(grid) = self.grid_info(item_id)? else {
            return Ok(None);
        };
        let mut tile_size = None;
        for &tile in grid.tile_item_ids.iter() {
            let ispe = *self
                .container
                .spatial_extents(tile)
                .ok_or(Error::InvalidData("grid tile has no ispe property"))?;
            match tile_size {
                None => tile_size = Some(ispe),
                Some(size) if size == ispe => {},
                Some(_) => return Err(Error::InvalidData("grid tiles differ in size")),
            }
        }
        let size = tile_size.ok_or(Error::InvalidData("grid has no tiles"))?;
        ImageGridMetadata::from_descriptor(&grid.descriptor, size.width, size.height).map(Some)
    }

    /// Payloads of every tile of a grid item, in row-major order.
    ///
    /// `stop` is polled between tiles.
    pub fn grid_tile_data(&mut self, item_id: u32, stop: &dyn Stop) -> Result<TryVec<TryVec<u8>>> {
        let grid = self
            .grid_info(item_id)?
            .ok_or(Error::InvalidData("item is not a grid"))?;
        let mut tiles = TryVec::with_capacity(grid.tile_item_ids.len())?;
        for &tile in grid.tile_item_ids.iter() {
            stop.check()?;
            tiles.push(self.item_data(tile)?)?;
        }
        Ok(tiles)
    }

    /// Raw EXIF payload, including its 4-byte TIFF header offset.
    pub fn exif_data(&mut self) -> Result<Option<TryVec<u8>>> {
        self.container.exif_item_id().map(|id| self.item_data(id)).transpose()
    }

    pub fn exif(&mut self) -> Result<Option<ExifData>> {
        match self.exif_data()? {
            Some(payload) => ExifData::parse(&payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn xmp_data(&mut self) -> Result<Option<TryVec<u8>>> {
        self.container.xmp_item_id().map(|id| self.item_data(id)).transpose()
    }

    /// Counts `bytes` against the memory limit while `f` runs.
    fn with_reservation<T>(&mut self, bytes: u64, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = self.tracker.reserve(bytes).and_then(|()| f(self));
        self.tracker.release(bytes);
        result
    }

    fn item_payload(&mut self, item_id: u32, depth: usize) -> Result<TryVec<u8>> {
        if depth > MAX_CONSTRUCTION_DEPTH {
            return Err(Error::InvalidData("item construction nests too deeply"));
        }
        let info = self
            .container
            .item_info(item_id)
            .ok_or(Error::InvalidData("item not found in iinf"))?;
        if info.item_protection_index != 0 {
            return Err(Error::Unsupported("protected items are not supported"));
        }
        let location = self
            .container
            .item_location(item_id)
            .ok_or(Error::InvalidData("item not found in iloc"))?;
        if location.data_reference_index != 0 {
            return Err(Error::Unsupported("external data references are not supported"));
        }
        let method = location.construction_method;
        let mut extents = TryVec::with_capacity(location.extents.len())?;
        for &extent in location.extents.iter() {
            extents.push(extent)?;
        }

        match method {
            ConstructionMethod::File => self.file_extents(&extents),
            ConstructionMethod::Idat => self.idat_extents(&extents),
            ConstructionMethod::Item => self.item_extents(item_id, &extents, depth),
        }
    }

    fn file_extents(&mut self, extents: &[ItemLocationExtent]) -> Result<TryVec<u8>> {
        let stream_len = self.source.len();
        let container = &self.container;
        let (ranges, total) = resolve_extents(extents, |e| match e.length {
            0 => container.media_data_end(e.offset).unwrap_or(stream_len),
            _ => stream_len,
        })?;

        self.with_reservation(total, |this| {
            let mut data = TryVec::with_capacity(total.try_into()?)?;
            for &(start, length) in ranges.iter() {
                let chunk = this.source.segment(start, length)?.read_to_end()?;
                data.extend_from_slice(&chunk)?;
            }
            Ok(data)
        })
    }

    fn idat_extents(&mut self, extents: &[ItemLocationExtent]) -> Result<TryVec<u8>> {
        let idat_len = self
            .container
            .idat
            .as_ref()
            .ok_or(Error::InvalidData("idat box missing but construction_method is Idat"))?
            .len()
            .to_u64();
        let (ranges, total) = resolve_extents(extents, |_| idat_len)?;

        self.with_reservation(total, |this| {
            let idat = this.container.idat.as_deref().unwrap_or(&[]);
            let mut data = TryVec::with_capacity(total.try_into()?)?;
            for &range in ranges.iter() {
                copy_range(&mut data, idat, range)?;
            }
            Ok(data)
        })
    }

    /// Construction method 2: extents index the item's 'iloc' references.
    fn item_extents(&mut self, item_id: u32, extents: &[ItemLocationExtent], depth: usize) -> Result<TryVec<u8>> {
        let mut sources = TryVec::new();
        for id in self.container.references_from(item_id, codes::ILOC) {
            sources.push(id)?;
        }
        let mut data = TryVec::new();
        for e in extents {
            let index = usize::try_from(e.index)?;
            let source_id = index
                .checked_sub(1)
                .and_then(|i| sources.get(i))
                .copied()
                .ok_or(Error::InvalidData("iloc extent index has no matching iloc reference"))?;
            let source = self.item_payload(source_id, depth + 1)?;
            let range = extent_range(e.offset, e.length, source.len().to_u64())?;
            self.with_reservation(range.1, |_| copy_range(&mut data, &source, range))?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{IinfBox, IlocBox, IlocItem, IrefBox, IrefEntry, PitmBox};
    use crate::writer::{MpegBox, Writer};

    fn bx(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    fn full(name: &[u8; 4], version: u8, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut body = vec![version, 0, 0, 0];
        body.extend_from_slice(payload);
        bx(name, &body)
    }

    fn encode(b: &impl MpegBox) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        b.write(&mut Writer::new(&mut out)).unwrap();
        out
    }

    fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> std::vec::Vec<u8> {
        let mut body = major.to_vec();
        body.extend_from_slice(&0u32.to_be_bytes());
        for b in compatible {
            body.extend_from_slice(*b);
        }
        bx(b"ftyp", &body)
    }

    fn hdlr(handler: &[u8; 4]) -> std::vec::Vec<u8> {
        let mut body = 0u32.to_be_bytes().to_vec();
        body.extend_from_slice(handler);
        body.extend_from_slice(&[0; 13]);
        full(b"hdlr", 0, &body)
    }

    struct Item {
        id: u32,
        item_type: &'static [u8; 4],
        method: ConstructionMethod,
        offset: u64,
        length: u64,
    }

    /// ftyp, then an mdat holding `mdat`, then a meta box describing `items`.
    fn file(items: &[Item], refs: &[(&[u8; 4], u32, &[u32])], idat: Option<&[u8]>, mdat: &[u8]) -> std::vec::Vec<u8> {
        let mut out = ftyp(b"avif", &[b"mif1"]);
        out.extend(bx(b"mdat", mdat));

        let iinf = IinfBox {
            items: items.iter().map(|i| ItemInfoEntry::new(i.id, i.item_type.into())).collect(),
        };
        let iloc = IlocBox {
            items: items
                .iter()
                .map(|i| IlocItem {
                    item_id: i.id,
                    construction_method: i.method,
                    offset: i.offset,
                    length: i.length,
                })
                .collect(),
            wide_fields: false,
        };
        let iref = IrefBox {
            entries: refs
                .iter()
                .map(|&(t, from, to)| IrefEntry {
                    reference_type: t.into(),
                    from_item_id: from,
                    to_item_ids: to.to_vec(),
                })
                .collect(),
        };

        let mut meta = hdlr(b"pict");
        meta.extend(encode(&PitmBox(items[0].id)));
        meta.extend(encode(&iinf));
        let mut iloc_bytes = std::vec::Vec::new();
        iloc.write(&mut Writer::new(&mut iloc_bytes), &mut std::vec::Vec::new()).unwrap();
        meta.extend(iloc_bytes);
        if !iref.is_empty() {
            meta.extend(encode(&iref));
        }
        if let Some(idat) = idat {
            meta.extend(bx(b"idat", idat));
        }
        out.extend(full(b"meta", 0, &meta));
        out
    }

    /// Offset of the mdat payload in files built by `file`.
    const MDAT: u64 = 20 + 8;

    fn av01(id: u32, offset: u64, length: u64) -> Item {
        Item {
            id,
            item_type: b"av01",
            method: ConstructionMethod::File,
            offset,
            length,
        }
    }

    #[test]
    fn file_extents_and_zero_length_run_to_mdat_end() {
        let data = file(&[av01(1, MDAT + 2, 3), av01(2, MDAT + 5, 0)], &[], None, b"0123456789");
        let mut reader = AvifReader::from_bytes(&data).unwrap();
        assert_eq!(reader.primary_item_id(), 1);
        assert_eq!(&*reader.item_data(1).unwrap(), b"234");
        assert_eq!(&*reader.item_data(2).unwrap(), b"56789");
        assert_eq!(reader.container().media_data[0], MediaDataBounds { offset: MDAT, length: 10 });
    }

    #[test]
    fn idat_and_item_construction_methods() {
        let items = [
            av01(1, MDAT, 4),
            Item {
                id: 2,
                item_type: b"Exif",
                method: ConstructionMethod::Idat,
                offset: 1,
                length: 2,
            },
            Item {
                id: 3,
                item_type: b"Exif",
                method: ConstructionMethod::Item,
                offset: 1,
                length: 0,
            },
        ];
        let data = file(&items, &[(b"iloc", 3, &[1])], Some(b"xyz"), b"abcd");
        let mut reader = AvifReader::from_bytes(&data).unwrap();
        assert_eq!(&*reader.item_data(2).unwrap(), b"yz");
        assert_eq!(&*reader.item_data(3).unwrap(), b"bcd");
    }

    #[test]
    fn item_construction_without_source_reference_fails() {
        let items = [
            av01(1, MDAT, 4),
            Item {
                id: 2,
                item_type: b"Exif",
                method: ConstructionMethod::Item,
                offset: 0,
                length: 1,
            },
        ];
        let data = file(&items, &[], None, b"abcd");
        let mut reader = AvifReader::from_bytes(&data).unwrap();
        assert!(matches!(reader.item_data(2), Err(Error::InvalidData(_))));
    }

    #[test]
    fn extents_outside_the_file_are_rejected() {
        let data = file(&[av01(1, MDAT, 10)], &[], None, b"0123456789");
        assert_eq!(&*AvifReader::from_bytes(&data).unwrap().item_data(1).unwrap(), b"0123456789");

        let past_end = 1 << 20;
        for item in [av01(1, past_end, 4), av01(1, MDAT, past_end)] {
            let data = file(&[item], &[], None, b"0123456789");
            assert!((data.len() as u64) < past_end);
            let mut reader = AvifReader::from_bytes(&data).unwrap();
            assert!(matches!(reader.item_data(1), Err(Error::InvalidData(_))));
        }
    }

    #[test]
    fn dimg_cycles_are_rejected() {
        let items = [
            Item {
                id: 1,
                item_type: b"grid",
                method: ConstructionMethod::File,
                offset: MDAT,
                length: 8,
            },
            av01(2, MDAT, 1),
        ];
        let ok = file(&items, &[(b"dimg", 1, &[2])], None, &[0; 8]);
        assert!(AvifReader::from_bytes(&ok).is_ok());
        let cyclic = file(&items, &[(b"dimg", 1, &[2]), (b"dimg", 2, &[1])], None, &[0; 8]);
        assert!(matches!(AvifReader::from_bytes(&cyclic), Err(Error::InvalidData(_))));
    }

    #[test]
    fn derivation_graph_allows_shared_children() {
        let refs = [
            ItemReference {
                reference_type: codes::DIMG,
                from_item_id: 1,
                to_item_ids: vec![3, 4].into(),
            },
            ItemReference {
                reference_type: codes::DIMG,
                from_item_id: 2,
                to_item_ids: vec![3, 4].into(),
            },
        ];
        assert!(check_derivation_graph(&refs).is_ok());
    }

    #[test]
    fn brands_and_box_order() {
        let mut data = file(&[av01(1, MDAT, 1)], &[], None, b"a");
        data[8..12].copy_from_slice(b"heic");
        assert!(AvifReader::from_bytes(&data).is_err());
        let lenient = DecodeConfig::unlimited().lenient(true);
        assert!(AvifReader::from_bytes_with_config(&data, &lenient, &Unstoppable).is_err());

        let mut with_compat = ftyp(b"heic", &[b"avif"]);
        with_compat.extend_from_slice(&data[20..]);
        assert!(AvifReader::from_bytes(&with_compat).is_err());
        let reader = AvifReader::from_bytes_with_config(&with_compat, &lenient, &Unstoppable).unwrap();
        assert!(reader.container().ftyp.has_brand(b"avif"));

        let no_ftyp = bx(b"free", &[]);
        assert!(AvifReader::from_bytes(&no_ftyp).is_err());
        assert!(AvifReader::from_bytes(&[]).is_err());
    }

    #[test]
    fn unknown_top_level_boxes_are_kept() {
        let mut data = file(&[av01(1, MDAT, 1)], &[], None, b"a");
        let unknown_at = data.len() as u64;
        data.extend(bx(b"moov", &[1, 2, 3]));
        data.extend(bx(b"free", &[0; 4]));
        let reader = AvifReader::from_bytes(&data).unwrap();
        assert_eq!(
            reader.unknown_boxes(),
            &[UnknownBox {
                box_type: FourCC::new(*b"moov"),
                offset: unknown_at,
                size: 11,
            }]
        );
    }

    #[test]
    fn duplicate_meta_is_rejected() {
        let mut data = file(&[av01(1, MDAT, 1)], &[], None, b"a");
        let meta_at = 20 + 9;
        let meta = data[meta_at..].to_vec();
        data.extend(meta);
        assert!(matches!(AvifReader::from_bytes(&data), Err(Error::InvalidData(_))));
    }

    #[test]
    fn primary_item_must_be_an_image() {
        let items = [Item {
            id: 1,
            item_type: b"Exif",
            method: ConstructionMethod::File,
            offset: MDAT,
            length: 1,
        }];
        let data = file(&items, &[], None, b"a");
        assert!(matches!(AvifReader::from_bytes(&data), Err(Error::InvalidData(_))));
    }

    #[test]
    fn handler_must_be_pict_unless_lenient() {
        let data = file(&[av01(1, MDAT, 1)], &[], None, b"a");
        let hdlr_at = data.windows(4).position(|w| w == b"pict").unwrap();
        let mut vide = data.clone();
        vide[hdlr_at..hdlr_at + 4].copy_from_slice(b"vide");
        assert!(AvifReader::from_bytes(&vide).is_err());
        let lenient = DecodeConfig::unlimited().lenient(true);
        let reader = AvifReader::from_bytes_with_config(&vide, &lenient, &Unstoppable).unwrap();
        assert_eq!(reader.container().handler_type, FourCC::new(*b"vide"));
    }

    #[test]
    fn stop_token_aborts_between_boxes() {
        struct AlwaysStop;
        impl Stop for AlwaysStop {
            fn check(&self) -> Result<(), crate::StopReason> {
                Err(crate::StopReason::Cancelled)
            }
        }
        let data = file(&[av01(1, MDAT, 1)], &[], None, b"a");
        let result = AvifReader::from_bytes_with_config(&data, &DecodeConfig::unlimited(), &AlwaysStop);
        assert!(matches!(result, Err(Error::Stopped(_))));
    }

    #[test]
    fn memory_limit_applies_to_item_data() {
        let data = file(&[av01(1, MDAT, 10)], &[], None, b"0123456789");
        let config = DecodeConfig::unlimited().with_peak_memory_limit(9);
        let mut reader = AvifReader::from_bytes_with_config(&data, &config, &Unstoppable).unwrap();
        assert!(matches!(reader.item_data(1), Err(Error::ResourceLimitExceeded(_))));
        let config = DecodeConfig::unlimited().with_peak_memory_limit(10);
        let mut reader = AvifReader::from_bytes_with_config(&data, &config, &Unstoppable).unwrap();
        assert_eq!(reader.item_data(1).unwrap().len(), 10);
        // Released after each read.
        assert_eq!(reader.item_data(1).unwrap().len(), 10);
    }
}
