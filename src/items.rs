// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item bookkeeping boxes of 'meta': handler, primary item, item info,
//! item locations, item references and item data.

use crate::bmff::{BMFFBox, ParseContext, check_parser_state, read_fullbox_extra, read_fullbox_version_no_flags, skip_box_remain};
use crate::boxes::{BoxType, FourCC, codes};
use crate::writer::{BASIC_BOX_SIZE, FULL_BOX_SIZE, MpegBox, Writer, WriterBackend};
use crate::{Error, Result, ToUsize, TryVec};
use bitreader::BitReader;
use log::{debug, warn};
use std::io::{Read, Seek};

/// Parse a Handler Reference box, returning the handler type.
/// See ISO 14496-12:2015 § 8.4.3
pub(crate) fn read_hdlr<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<FourCC> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version != 0 {
        return Err(Error::Unsupported("hdlr version"));
    }
    let _pre_defined = src.read_u32()?;
    let handler_type = src.read_fourcc()?;
    for _ in 0..3 {
        let _reserved = src.read_u32()?;
    }
    // Some writers leave the name out entirely
    if src.bytes_left() > 0 {
        let name = src.read_string()?;
        debug!("hdlr {handler_type} name {name:?}");
    }
    skip_box_remain(src)?;
    Ok(handler_type)
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
pub(crate) fn read_pitm<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<u32> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;

    let item_id = match version {
        0 => src.read_u16()?.into(),
        1 => src.read_u32()?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };

    Ok(item_id)
}

/// Content type of XMP packets stored as 'mime' items.
pub(crate) const XMP_CONTENT_TYPE: &str = "application/rdf+xml";

/// Type-specific trailing fields of an 'infe' entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ItemInfoExtension {
    #[default]
    None,
    /// Item type 'mime'
    Mime {
        content_type: std::string::String,
        /// Empty when absent.
        content_encoding: std::string::String,
    },
    /// Item type 'uri '
    Uri { item_uri_type: std::string::String },
}

/// See ISO 14496-12:2015 § 8.11.6.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    /// Non-zero for protected items, which can't be decoded here.
    pub item_protection_index: u16,
    pub item_type: FourCC,
    pub item_name: std::string::String,
    /// Set from flag bit 0: the item isn't meant to be displayed on its own.
    pub hidden: bool,
    pub extension: ItemInfoExtension,
}

impl ItemInfoEntry {
    pub fn new(item_id: u32, item_type: FourCC) -> Self {
        Self {
            item_id,
            item_protection_index: 0,
            item_type,
            item_name: std::string::String::new(),
            hidden: false,
            extension: ItemInfoExtension::None,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match &self.extension {
            ItemInfoExtension::Mime { content_type, .. } => Some(content_type),
            _ => None,
        }
    }

    /// Version 2 carries 16-bit item ids, version 3 32-bit ones.
    fn version(&self) -> u8 {
        if self.item_id > u32::from(u16::MAX) { 3 } else { 2 }
    }
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
pub(crate) fn read_iinf<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<TryVec<ItemInfoEntry>> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;

    let entry_count = match version {
        0 => src.read_u16()?.to_usize(),
        1 => src.read_u32()?.to_usize(),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    };
    // An infe box is at least 12 bytes
    let max_entries = usize::try_from(src.bytes_left() / 12).unwrap_or(usize::MAX);
    let mut item_infos = TryVec::with_capacity(entry_count.min(max_entries))?;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData("iinf box should contain only infe boxes"));
        }

        let entry = read_infe(&mut b, ctx)?;
        if item_infos.iter().any(|e: &ItemInfoEntry| e.item_id == entry.item_id) {
            return Err(Error::InvalidData("duplicate item_id in iinf"));
        }
        item_infos.push(entry)?;

        check_parser_state(&b)?;
    }

    if item_infos.len() != entry_count {
        if !ctx.options.lenient {
            return Err(Error::InvalidData("iinf entry_count doesn't match the infe boxes"));
        }
        warn!("iinf declares {entry_count} entries but holds {}", item_infos.len());
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<ItemInfoEntry> {
    let (version, flags) = read_fullbox_extra(src)?;
    if flags & !1 != 0 {
        if !ctx.options.lenient {
            return Err(Error::InvalidData("infe flags other than 'hidden' must be 0"));
        }
        warn!("infe flags {flags:#x}");
    }

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let item_id = match version {
        2 => src.read_u16()?.into(),
        3 => src.read_u32()?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let item_protection_index = src.read_u16()?;
    let item_type = src.read_fourcc()?;
    debug!("infe item_id {item_id} item_type: {item_type}");
    let item_name = src.read_string()?;

    let extension = if item_type == codes::MIME {
        let content_type = src.read_string()?;
        let content_encoding = src.read_string()?;
        ItemInfoExtension::Mime { content_type, content_encoding }
    } else if item_type == codes::URI {
        ItemInfoExtension::Uri { item_uri_type: src.read_string()? }
    } else {
        ItemInfoExtension::None
    };

    Ok(ItemInfoEntry {
        item_id,
        item_protection_index,
        item_type,
        item_name,
        hidden: flags & 1 != 0,
        extension,
    })
}

impl MpegBox for ItemInfoEntry {
    fn len(&self) -> usize {
        FULL_BOX_SIZE
            + if self.version() == 2 { 2 } else { 4 } // id
            + 2 // item_protection_index
            + 4 // type
            + self.item_name.len() + 1
            + match &self.extension {
                ItemInfoExtension::None => 0,
                ItemInfoExtension::Mime { content_type, content_encoding } => {
                    content_type.len() + 1 + content_encoding.len() + 1
                },
                ItemInfoExtension::Uri { item_uri_type } => item_uri_type.len() + 1,
            }
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let version = self.version();
        let mut b = w.new_box(self.len());
        b.full_box(*b"infe", version, u32::from(self.hidden))?;
        if version == 2 {
            b.u16(self.item_id as u16)?;
        } else {
            b.u32(self.item_id)?;
        }
        b.u16(self.item_protection_index)?;
        b.push(&self.item_type.value)?;
        b.str0(&self.item_name)?;
        match &self.extension {
            ItemInfoExtension::None => Ok(()),
            ItemInfoExtension::Mime { content_type, content_encoding } => {
                b.str0(content_type)?;
                b.str0(content_encoding)
            },
            ItemInfoExtension::Uri { item_uri_type } => b.str0(item_uri_type),
        }
    }
}

/// Item Info box
#[derive(Debug, Clone, Default)]
pub(crate) struct IinfBox {
    pub items: std::vec::Vec<ItemInfoEntry>,
}

impl IinfBox {
    fn wide_count(&self) -> bool {
        self.items.len() > usize::from(u16::MAX)
    }
}

impl MpegBox for IinfBox {
    fn len(&self) -> usize {
        FULL_BOX_SIZE
            + if self.wide_count() { 4 } else { 2 }
            + self.items.iter().map(MpegBox::len).sum::<usize>()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let wide = self.wide_count();
        let mut b = w.new_box(self.len());
        b.full_box(*b"iinf", u8::from(wide), 0)?;
        if wide {
            b.u32(self.items.len() as u32)?;
        } else {
            b.u16(self.items.len() as u16)?;
        }
        for infe in &self.items {
            infe.write(&mut b)?;
        }
        Ok(())
    }
}

/// Where an item's extents are stored.
/// See ISO 14496-12:2015 § 8.11.3.3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstructionMethod {
    /// Offsets into the file.
    File,
    /// Offsets into the 'idat' box.
    Idat,
    /// Offsets into the data of another item, picked by extent index.
    Item,
}

impl ConstructionMethod {
    fn code(self) -> u16 {
        match self {
            Self::File => 0,
            Self::Idat => 1,
            Self::Item => 2,
        }
    }
}

/// One `(offset, length)` piece of an item. A zero length runs to the end
/// of the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemLocationExtent {
    /// 1-based index of the source item for [`ConstructionMethod::Item`].
    pub index: u64,
    /// `base_offset + extent_offset`
    pub offset: u64,
    pub length: u64,
}

/// Used for 'iloc' boxes
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, PartialEq)]
pub struct ItemLocationEntry {
    pub item_id: u32,
    pub construction_method: ConstructionMethod,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<ItemLocationExtent>,
}

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData("value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
pub(crate) fn read_iloc<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<TryVec<ItemLocationEntry>> {
    let version: IlocVersion = read_fullbox_version_no_flags(src, &ctx.options)?.try_into()?;

    let iloc = src.read_into_try_vec(&mut ctx.tracker)?;
    let items = parse_iloc_fields(version, &iloc);
    ctx.tracker.release(iloc.len() as u64);
    items
}

fn parse_iloc_fields(version: IlocVersion, iloc: &[u8]) -> Result<TryVec<ItemLocationEntry>> {
    let mut iloc = BitReader::new(iloc);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: IlocFieldSize = match version {
        IlocVersion::One | IlocVersion::Two => iloc.read_u8(4)?.try_into()?,
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            IlocFieldSize::Zero
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    // Each item takes at least 6 bytes
    if u64::from(item_count) * 6 * 8 > iloc.remaining() {
        return Err(Error::InvalidData("iloc item_count exceeds box size"));
    }
    let mut items: TryVec<ItemLocationEntry> = TryVec::with_capacity(item_count.to_usize())?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };
        if items.iter().any(|i| i.item_id == item_id) {
            return Err(Error::InvalidData("duplicate item_id in iloc"));
        }

        // Version 0 has no construction_method field and is read as file offsets.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => ConstructionMethod::Item,
                    _ => return Err(Error::InvalidData("construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3")),
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;
        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData("extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3"));
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            // "If the index is not identified (the field has a length of zero),
            //  the first item is implied" for construction method 2.
            let index = match index_size {
                IlocFieldSize::Zero => 1,
                size => iloc.read_u64(size.to_bits())?,
            };
            // A zero-width offset field means offset 0, from read_u64(0).
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let length = iloc.read_u64(length_size.to_bits())?;
            let offset = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;
            if length != 0 && offset.checked_add(length).is_none() {
                return Err(Error::InvalidData("end calculation overflow"));
            }
            extents.push(ItemLocationExtent { index, offset, length })?;
        }

        items.push(ItemLocationEntry {
            item_id,
            construction_method,
            data_reference_index,
            base_offset,
            extents,
        })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::InvalidData("invalid iloc size"))
    }
}

/// An `iloc` extent offset written as a placeholder, to be patched once the
/// payload position is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PatchSite {
    pub item_id: u32,
    /// Absolute position of the offset field.
    pub position: u64,
    /// Field width in bytes.
    pub width: u8,
}

/// Single-extent location of an item being written.
#[derive(Debug, Clone)]
pub(crate) struct IlocItem {
    pub item_id: u32,
    pub construction_method: ConstructionMethod,
    /// Placeholder for [`ConstructionMethod::File`], final otherwise.
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IlocBox {
    pub items: std::vec::Vec<IlocItem>,
    /// Use 8-byte offsets and lengths.
    pub wide_fields: bool,
}

impl IlocBox {
    fn version(&self) -> u8 {
        if self.items.iter().any(|i| i.item_id > u32::from(u16::MAX)) {
            2
        } else if self.items.iter().any(|i| i.construction_method != ConstructionMethod::File) {
            1
        } else {
            0
        }
    }

    fn field_width(&self) -> u8 {
        if self.wide_fields { 8 } else { 4 }
    }

    pub fn len(&self) -> usize {
        let version = self.version();
        let field = usize::from(self.field_width());
        FULL_BOX_SIZE
            + 1 // offset_size, length_size
            + 1 // base_offset_size, index_size or reserved
            + if version == 2 { 4 } else { 2 } // item_count
            + self.items.len() * (
                if version == 2 { 4 } else { 2 } // item_id
                + if version == 0 { 0 } else { 2 } // construction_method
                + 2 // data_reference_index
                + 2 // extent_count
                + field // extent_offset
                + field // extent_length
            )
    }

    /// Writes the box, recording where each file-relative offset must be patched.
    pub fn write<B: WriterBackend>(
        &self,
        w: &mut Writer<'_, '_, B>,
        sites: &mut std::vec::Vec<PatchSite>,
    ) -> Result<(), B::Error> {
        let version = self.version();
        let width = self.field_width();
        let mut b = w.new_box(self.len());
        b.full_box(*b"iloc", version, 0)?;
        b.u8(width << 4 | width)?; // offset and length sizes
        b.u8(0)?; // no base_offset, no index
        if version == 2 {
            b.u32(self.items.len() as u32)?;
        } else {
            b.u16(self.items.len() as u16)?;
        }
        for item in &self.items {
            if version == 2 {
                b.u32(item.item_id)?;
            } else {
                b.u16(item.item_id as u16)?;
            }
            if version != 0 {
                b.u16(item.construction_method.code())?;
            }
            b.u16(0)?; // data_reference_index: this file
            b.u16(1)?; // extent_count
            if item.construction_method == ConstructionMethod::File {
                sites.push(PatchSite {
                    item_id: item.item_id,
                    position: b.position(),
                    width,
                });
            }
            b.uint(width, item.offset)?;
            b.uint(width, item.length)?;
        }
        Ok(())
    }
}

/// Typed references from one item to one or more others.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug, PartialEq)]
pub struct ItemReference {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    /// In declaration order. For 'dimg' this is the tile order.
    pub to_item_ids: TryVec<u32>,
}

pub(crate) fn read_iref<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<TryVec<ItemReference>> {
    let mut item_references = TryVec::new();
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        let from_item_id = if version == 0 { b.read_u16()?.into() } else { b.read_u32()? };
        let reference_count = b.read_u16()?;
        let mut to_item_ids = TryVec::with_capacity(usize::from(reference_count))?;
        for _ in 0..reference_count {
            let to_item_id = if version == 0 { b.read_u16()?.into() } else { b.read_u32()? };
            if from_item_id == to_item_id {
                return Err(Error::InvalidData("from_item_id and to_item_id must be different"));
            }
            to_item_ids.push(to_item_id)?;
        }
        item_references.push(ItemReference {
            reference_type: b.head.fourcc(),
            from_item_id,
            to_item_ids,
        })?;
        check_parser_state(&b)?;
    }
    Ok(item_references)
}

/// A reference to be written.
#[derive(Debug, Clone)]
pub(crate) struct IrefEntry {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: std::vec::Vec<u32>,
}

/// Item Reference box
#[derive(Debug, Clone, Default)]
pub(crate) struct IrefBox {
    pub entries: std::vec::Vec<IrefEntry>,
}

impl IrefBox {
    fn wide_ids(&self) -> bool {
        self.entries
            .iter()
            .flat_map(|e| std::iter::once(&e.from_item_id).chain(&e.to_item_ids))
            .any(|&id| id > u32::from(u16::MAX))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MpegBox for IrefBox {
    fn len(&self) -> usize {
        let id = if self.wide_ids() { 4 } else { 2 };
        FULL_BOX_SIZE
            + self
                .entries
                .iter()
                .map(|e| BASIC_BOX_SIZE + id + 2 + id * e.to_item_ids.len())
                .sum::<usize>()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let wide = self.wide_ids();
        let id_width = if wide { 4 } else { 2 };
        let mut b = w.new_box(self.len());
        b.full_box(*b"iref", u8::from(wide), 0)?;
        for e in &self.entries {
            let mut r = b.new_box(BASIC_BOX_SIZE + id_width * (1 + e.to_item_ids.len()) + 2);
            r.basic_box(e.reference_type.value)?;
            r.uint(id_width as u8, u64::from(e.from_item_id))?;
            r.u16(e.to_item_ids.len() as u16)?;
            for &to in &e.to_item_ids {
                r.uint(id_width as u8, u64::from(to))?;
            }
        }
        Ok(())
    }
}

/// Handler box declaring the 'pict' handler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HdlrBox;

impl MpegBox for HdlrBox {
    fn len(&self) -> usize {
        FULL_BOX_SIZE
            + 4 // pre_defined
            + 4 // handler_type
            + 12 // reserved
            + 1 // empty name
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.full_box(*b"hdlr", 0, 0)?;
        b.u32(0)?;
        b.push(&codes::PICT.value)?;
        b.push(&[0; 12])?;
        b.u8(0)
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct PitmBox(pub u32);

impl MpegBox for PitmBox {
    fn len(&self) -> usize {
        FULL_BOX_SIZE + if self.0 > u32::from(u16::MAX) { 4 } else { 2 }
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        if self.0 > u32::from(u16::MAX) {
            b.full_box(*b"pitm", 1, 0)?;
            b.u32(self.0)
        } else {
            b.full_box(*b"pitm", 0, 0)?;
            b.u16(self.0 as u16)
        }
    }
}

/// Item data box, holding small payloads such as grid descriptors.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdatBox {
    pub data: std::vec::Vec<u8>,
}

impl MpegBox for IdatBox {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + self.data.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"idat")?;
        b.push(&self.data)
    }
}
