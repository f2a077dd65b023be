// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item properties ('ipco') and their associations with items ('ipma').
//!
//! See ISO/IEC 23008-12:2017 § 9.3

use crate::av1c::{Av1ConfigBox, read_av1c};
use crate::bmff::{BMFFBox, ParseContext, check_parser_state, read_fullbox_extra, read_fullbox_version_no_flags, skip_box_remain};
use crate::boxes::{BoxType, FourCC, codes};
use crate::layers::check_transform_order;
use crate::writer::{BASIC_BOX_SIZE, FULL_BOX_SIZE, MpegBox, Writer, WriterBackend};
use crate::{Error, Result, TryVec};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use fallible_collections::{TryClone, TryReserveError};
use log::{debug, warn};
use std::io::{Read, Seek};

/// Image spatial extents (dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelAspectRatio {
    pub h_spacing: u32,
    pub v_spacing: u32,
}

impl Default for PixelAspectRatio {
    fn default() -> Self {
        Self { h_spacing: 1, v_spacing: 1 }
    }
}

/// Bit depth of each channel ('pixi').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelInformation {
    pub bits_per_channel: ArrayVec<u8, 16>,
}

impl PixelInformation {
    /// `channels` channels of `depth` bits each.
    pub fn uniform(channels: u8, depth: u8) -> Self {
        let mut bits_per_channel = ArrayVec::new();
        for _ in 0..usize::from(channels).min(bits_per_channel.capacity()) {
            bits_per_channel.push(depth);
        }
        Self { bits_per_channel }
    }
}

/// Auxiliary image type ('auxC'): a URN and opaque subtype bytes.
#[derive(Debug, PartialEq)]
pub struct AuxiliaryType {
    pub aux_type: std::string::String,
    pub aux_subtype: TryVec<u8>,
}

impl AuxiliaryType {
    pub fn alpha() -> Self {
        Self {
            aux_type: crate::ALPHA_AUXILIARY_TYPE.into(),
            aux_subtype: TryVec::new(),
        }
    }

    pub fn is_alpha(&self) -> bool {
        self.aux_type == crate::ALPHA_AUXILIARY_TYPE
    }
}

/// ITU-T H.273 color description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NclxColor {
    pub color_primaries: u16,
    pub transfer_characteristics: u16,
    pub matrix_coefficients: u16,
    pub full_range: bool,
}

impl NclxColor {
    /// BT.709 primaries, sRGB transfer, BT.601 matrix, full range.
    pub const SRGB: Self = Self {
        color_primaries: 1,
        transfer_characteristics: 13,
        matrix_coefficients: 6,
        full_range: true,
    };
}

/// Color information ('colr').
#[derive(Debug, PartialEq)]
pub enum ColorInformation {
    Nclx(NclxColor),
    /// Unrestricted ICC profile ('prof')
    IccProfile(TryVec<u8>),
    /// Restricted ICC profile ('rICC')
    RestrictedIcc(TryVec<u8>),
    /// A colour type this crate doesn't interpret.
    Unknown(FourCC),
}

impl ColorInformation {
    pub fn icc_profile(icc: &[u8]) -> Result<Self> {
        if icc.is_empty() {
            return Err(Error::InvalidInput("ICC profile is empty"));
        }
        let mut profile = TryVec::new();
        profile.extend_from_slice(icc)?;
        Ok(Self::IccProfile(profile))
    }

    pub fn icc(&self) -> Option<&[u8]> {
        match self {
            Self::IccProfile(icc) | Self::RestrictedIcc(icc) => Some(icc),
            _ => None,
        }
    }

    pub(crate) fn colour_type(&self) -> FourCC {
        match self {
            Self::Nclx(_) => codes::NCLX,
            Self::IccProfile(_) => codes::PROF,
            Self::RestrictedIcc(_) => codes::RICC,
            Self::Unknown(fourcc) => *fourcc,
        }
    }
}

impl TryClone for ColorInformation {
    fn try_clone(&self) -> Result<Self, TryReserveError> {
        Ok(match self {
            Self::Nclx(nclx) => Self::Nclx(*nclx),
            Self::IccProfile(icc) => Self::IccProfile(icc.try_clone()?),
            Self::RestrictedIcc(icc) => Self::RestrictedIcc(icc.try_clone()?),
            Self::Unknown(fourcc) => Self::Unknown(*fourcc),
        })
    }
}

/// Byte sizes of the first spatial layers of a layered item ('a1lx').
/// A zero size means the layer, and every layer after it, isn't listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayeredImageIndexing {
    pub layer_sizes: [u32; 3],
}

impl LayeredImageIndexing {
    fn large_size(&self) -> bool {
        self.layer_sizes.iter().any(|&s| s > u32::from(u16::MAX))
    }
}

/// Clean aperture ('clap') as four fractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanAperture {
    pub width_n: u32,
    pub width_d: u32,
    pub height_n: u32,
    pub height_d: u32,
    pub horiz_off_n: u32,
    pub horiz_off_d: u32,
    pub vert_off_n: u32,
    pub vert_off_d: u32,
}

/// Anti-clockwise rotation in units of 90 degrees ('irot').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRotation {
    pub angle: u8,
}

/// Mirroring axis ('imir'): 0 is vertical, 1 is horizontal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMirror {
    pub axis: u8,
}

/// Every property kind this crate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemPropertyKind {
    ImageSpatialExtents,
    PixelAspectRatio,
    AV1Config,
    PixelInformation,
    AuxiliaryType,
    ColorInformation,
    LayeredImageIndexing,
    OperatingPoint,
    LayerSelector,
    CleanAperture,
    Rotation,
    Mirror,
}

impl ItemPropertyKind {
    pub const ALL: [Self; 12] = [
        Self::ImageSpatialExtents,
        Self::PixelAspectRatio,
        Self::AV1Config,
        Self::PixelInformation,
        Self::AuxiliaryType,
        Self::ColorInformation,
        Self::LayeredImageIndexing,
        Self::OperatingPoint,
        Self::LayerSelector,
        Self::CleanAperture,
        Self::Rotation,
        Self::Mirror,
    ];

    pub const fn box_type(self) -> BoxType {
        match self {
            Self::ImageSpatialExtents => BoxType::ImageSpatialExtentsProperty,
            Self::PixelAspectRatio => BoxType::PixelAspectRatioBox,
            Self::AV1Config => BoxType::AV1CodecConfigurationBox,
            Self::PixelInformation => BoxType::PixelInformationBox,
            Self::AuxiliaryType => BoxType::AuxiliaryTypeProperty,
            Self::ColorInformation => BoxType::ColorInformationBox,
            Self::LayeredImageIndexing => BoxType::AV1LayeredImageIndexingProperty,
            Self::OperatingPoint => BoxType::OperatingPointSelectorProperty,
            Self::LayerSelector => BoxType::LayerSelectorProperty,
            Self::CleanAperture => BoxType::CleanApertureBox,
            Self::Rotation => BoxType::ImageRotation,
            Self::Mirror => BoxType::ImageMirror,
        }
    }

    pub fn fourcc(self) -> FourCC {
        self.box_type().into()
    }

    pub fn from_box_type(box_type: BoxType) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.box_type() == box_type)
    }

    /// Transformative properties change the rendered geometry.
    pub fn is_transform(self) -> bool {
        matches!(self, Self::CleanAperture | Self::Rotation | Self::Mirror)
    }
}

/// One entry of the property container.
#[derive(Debug, PartialEq)]
pub enum ItemProperty {
    ImageSpatialExtents(ImageSpatialExtents),
    PixelAspectRatio(PixelAspectRatio),
    AV1Config(Av1ConfigBox),
    PixelInformation(PixelInformation),
    AuxiliaryType(AuxiliaryType),
    ColorInformation(ColorInformation),
    LayeredImageIndexing(LayeredImageIndexing),
    /// 'a1op' operating point index, at most 31.
    OperatingPoint(u8),
    /// 'lsel' layer id: 0 to 3, or 0xFFFF for "any".
    LayerSelector(u16),
    CleanAperture(CleanAperture),
    Rotation(ImageRotation),
    Mirror(ImageMirror),
    /// Kept so the 1-based indices of later properties stay correct.
    Unknown(FourCC),
}

impl ItemProperty {
    pub fn kind(&self) -> Option<ItemPropertyKind> {
        Some(match self {
            Self::ImageSpatialExtents(_) => ItemPropertyKind::ImageSpatialExtents,
            Self::PixelAspectRatio(_) => ItemPropertyKind::PixelAspectRatio,
            Self::AV1Config(_) => ItemPropertyKind::AV1Config,
            Self::PixelInformation(_) => ItemPropertyKind::PixelInformation,
            Self::AuxiliaryType(_) => ItemPropertyKind::AuxiliaryType,
            Self::ColorInformation(_) => ItemPropertyKind::ColorInformation,
            Self::LayeredImageIndexing(_) => ItemPropertyKind::LayeredImageIndexing,
            Self::OperatingPoint(_) => ItemPropertyKind::OperatingPoint,
            Self::LayerSelector(_) => ItemPropertyKind::LayerSelector,
            Self::CleanAperture(_) => ItemPropertyKind::CleanAperture,
            Self::Rotation(_) => ItemPropertyKind::Rotation,
            Self::Mirror(_) => ItemPropertyKind::Mirror,
            Self::Unknown(_) => return None,
        })
    }

    pub fn fourcc(&self) -> FourCC {
        match self {
            Self::Unknown(fourcc) => *fourcc,
            known => known.kind().map_or(FourCC::new([0; 4]), ItemPropertyKind::fourcc),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// An item's link to a property: 1-based `index` into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAssociation {
    pub index: u16,
    pub essential: bool,
}

/// Associations for one item, in declaration order.
#[derive(Debug)]
pub(crate) struct ItemAssociations {
    pub item_id: u32,
    pub associations: TryVec<PropertyAssociation>,
}

/// Parsed 'iprp' contents.
#[derive(Debug, Default)]
pub(crate) struct ItemPropertiesBox {
    pub properties: TryVec<ItemProperty>,
    pub associations: TryVec<ItemAssociations>,
}

impl ItemPropertiesBox {
    pub fn property(&self, index: u16) -> Option<&ItemProperty> {
        match index {
            0 => None,
            i => self.properties.get(usize::from(i) - 1),
        }
    }

    pub fn associations_for(&self, item_id: u32) -> &[PropertyAssociation] {
        self.associations
            .iter()
            .find(|a| a.item_id == item_id)
            .map_or(&[][..], |a| &a.associations[..])
    }
}

/// Parse an Item Properties box
/// See ISO/IEC 23008-12:2017 § 9.3.1
pub(crate) fn read_iprp<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<ItemPropertiesBox> {
    let mut properties = None;
    let mut associations: TryVec<ItemAssociations> = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemPropertyContainerBox => {
                if properties.is_some() {
                    return Err(Error::InvalidData("There should be exactly one ipco box per ISO/IEC 23008-12:2017 § 9.3.1"));
                }
                properties = Some(read_ipco(&mut b, ctx)?);
            },
            BoxType::ItemPropertyAssociationBox => {
                for entry in read_ipma(&mut b, ctx)? {
                    if associations.iter().any(|a| a.item_id == entry.item_id) {
                        return Err(Error::InvalidData("item listed in more than one ipma box"));
                    }
                    associations.push(entry)?;
                }
            },
            _ => return Err(Error::InvalidData("unexpected iprp child")),
        }
        check_parser_state(&b)?;
    }

    let properties = properties.ok_or(Error::InvalidData("iprp without ipco"))?;
    let iprp = ItemPropertiesBox { properties, associations };

    for entry in iprp.associations.iter() {
        for a in entry.associations.iter() {
            if usize::from(a.index) > iprp.properties.len() {
                return Err(Error::InvalidData("ipma property index out of range"));
            }
        }
        check_transform_order(entry.associations.iter().filter_map(|a| iprp.property(a.index)))?;
    }
    Ok(iprp)
}

/// Parse an Item Property Container box. Unknown properties keep their slot.
fn read_ipco<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<TryVec<ItemProperty>> {
    let mut properties = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        // Must push for every property to have correct index for them
        let prop = match ItemPropertyKind::from_box_type(b.head.name) {
            Some(kind) => read_property(kind, &mut b, ctx)?,
            None => {
                debug!("unknown item property '{}'", b.head.fourcc());
                skip_box_remain(&mut b)?;
                ItemProperty::Unknown(b.head.fourcc())
            },
        };
        if ctx.options.lenient && b.bytes_left() > 0 {
            warn!("{} trailing bytes in '{}'", b.bytes_left(), b.head.fourcc());
            skip_box_remain(&mut b)?;
        }
        check_parser_state(&b)?;
        properties.push(prop)?;
    }
    Ok(properties)
}

fn read_property<R: Read + Seek>(
    kind: ItemPropertyKind,
    src: &mut BMFFBox<'_, R>,
    ctx: &mut ParseContext,
) -> Result<ItemProperty> {
    Ok(match kind {
        ItemPropertyKind::ImageSpatialExtents => ItemProperty::ImageSpatialExtents(read_ispe(src, ctx)?),
        ItemPropertyKind::PixelAspectRatio => ItemProperty::PixelAspectRatio(PixelAspectRatio {
            h_spacing: src.read_u32()?,
            v_spacing: src.read_u32()?,
        }),
        ItemPropertyKind::AV1Config => ItemProperty::AV1Config(read_av1c(src, ctx)?),
        ItemPropertyKind::PixelInformation => ItemProperty::PixelInformation(read_pixi(src, ctx)?),
        ItemPropertyKind::AuxiliaryType => ItemProperty::AuxiliaryType(read_auxc(src, ctx)?),
        ItemPropertyKind::ColorInformation => ItemProperty::ColorInformation(read_colr(src, ctx)?),
        ItemPropertyKind::LayeredImageIndexing => ItemProperty::LayeredImageIndexing(read_a1lx(src)?),
        ItemPropertyKind::OperatingPoint => {
            let op_index = src.read_u8()?;
            if op_index > 31 {
                return Err(Error::InvalidData("a1op op_index must be in the range 0..=31"));
            }
            ItemProperty::OperatingPoint(op_index)
        },
        ItemPropertyKind::LayerSelector => {
            let layer_id = src.read_u16()?;
            if layer_id > 3 && layer_id != 0xFFFF {
                return Err(Error::InvalidData("lsel layer_id must be 0..=3 or 0xFFFF"));
            }
            ItemProperty::LayerSelector(layer_id)
        },
        ItemPropertyKind::CleanAperture => ItemProperty::CleanAperture(read_clap(src)?),
        ItemPropertyKind::Rotation => {
            let byte = src.read_u8()?;
            if byte & 0xfc != 0 {
                return Err(Error::InvalidData("irot reserved bits must be 0"));
            }
            ItemProperty::Rotation(ImageRotation { angle: byte & 3 })
        },
        ItemPropertyKind::Mirror => {
            let byte = src.read_u8()?;
            if byte & 0xfe != 0 {
                return Err(Error::InvalidData("imir reserved bits must be 0"));
            }
            ItemProperty::Mirror(ImageMirror { axis: byte & 1 })
        },
    })
}

/// Parse an Image Spatial Extents property box
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<ImageSpatialExtents> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version != 0 {
        return Err(Error::Unsupported("ispe version"));
    }

    let width = src.read_u32()?;
    let height = src.read_u32()?;

    // Validate dimensions are non-zero (0×0 images are invalid)
    if width == 0 || height == 0 {
        return Err(Error::InvalidData("ispe dimensions cannot be zero"));
    }

    Ok(ImageSpatialExtents { width, height })
}

fn read_pixi<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &ParseContext) -> Result<PixelInformation> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let mut bits_per_channel = ArrayVec::<u8, 16>::new();
    if num_channels > bits_per_channel.capacity() {
        return Err(Error::InvalidData("invalid num_channels"));
    }
    for _ in 0..num_channels {
        bits_per_channel.push(src.read_u8()?);
    }
    Ok(PixelInformation { bits_per_channel })
}

fn read_auxc<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<AuxiliaryType> {
    let version = read_fullbox_version_no_flags(src, &ctx.options)?;
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }

    let aux_type = src.read_string()?;
    let aux_subtype = src.read_into_try_vec(&mut ctx.tracker)?;
    Ok(AuxiliaryType { aux_type, aux_subtype })
}

/// Parse a Colour Information box
/// See ISO 14496-12:2015 § 12.1.5
fn read_colr<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<ColorInformation> {
    let colour_type = src.read_fourcc()?;
    if colour_type == codes::NCLX {
        let color_primaries = src.read_u16()?;
        let transfer_characteristics = src.read_u16()?;
        let matrix_coefficients = src.read_u16()?;
        let byte = src.read_u8()?;
        if byte & 0x7f != 0 && !ctx.options.lenient {
            return Err(Error::InvalidData("colr nclx reserved bits must be 0"));
        }
        Ok(ColorInformation::Nclx(NclxColor {
            color_primaries,
            transfer_characteristics,
            matrix_coefficients,
            full_range: byte & 0x80 != 0,
        }))
    } else if colour_type == codes::PROF || colour_type == codes::RICC || colour_type == b"ricc" {
        let icc = src.read_into_try_vec(&mut ctx.tracker)?;
        if icc.is_empty() {
            return Err(Error::InvalidData("colr ICC profile is empty"));
        }
        Ok(if colour_type == codes::PROF {
            ColorInformation::IccProfile(icc)
        } else {
            ColorInformation::RestrictedIcc(icc)
        })
    } else {
        debug!("unknown colr colour_type '{colour_type}'");
        skip_box_remain(src)?;
        Ok(ColorInformation::Unknown(colour_type))
    }
}

/// Parse an AV1 Layered Image Indexing property
/// See AV1 ISOBMFF § 2.3.6
fn read_a1lx<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<LayeredImageIndexing> {
    let flags = src.read_u8()?;
    if flags & 0xfe != 0 {
        return Err(Error::InvalidData("a1lx reserved bits must be 0"));
    }
    let large_size = flags & 1 != 0;
    let mut layer_sizes = [0u32; 3];
    for size in &mut layer_sizes {
        *size = if large_size { src.read_u32()? } else { u32::from(src.read_u16()?) };
    }
    Ok(LayeredImageIndexing { layer_sizes })
}

fn read_clap<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<CleanAperture> {
    let clap = CleanAperture {
        width_n: src.read_u32()?,
        width_d: src.read_u32()?,
        height_n: src.read_u32()?,
        height_d: src.read_u32()?,
        horiz_off_n: src.read_u32()?,
        horiz_off_d: src.read_u32()?,
        vert_off_n: src.read_u32()?,
        vert_off_d: src.read_u32()?,
    };
    if clap.width_d == 0 || clap.height_d == 0 || clap.horiz_off_d == 0 || clap.vert_off_d == 0 {
        return Err(Error::InvalidData("clap denominators cannot be zero"));
    }
    Ok(clap)
}

/// Parse an Item Property Association box
/// See ISO/IEC 23008-12:2017 § 9.3.2
fn read_ipma<R: Read + Seek>(src: &mut BMFFBox<'_, R>, ctx: &mut ParseContext) -> Result<TryVec<ItemAssociations>> {
    let (version, flags) = read_fullbox_extra(src)?;
    if version > 1 {
        return Err(Error::Unsupported("ipma version"));
    }

    let entry_count = src.read_u32()?;
    // Every entry takes at least 3 bytes
    if u64::from(entry_count) * 3 > src.bytes_left() {
        return Err(Error::InvalidData("ipma entry_count exceeds box size"));
    }
    let mut entries: TryVec<ItemAssociations> = TryVec::with_capacity(entry_count as usize)?;
    let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };

    for _ in 0..entry_count {
        let item_id = if version == 0 { u32::from(src.read_u16()?) } else { src.read_u32()? };
        if let Some(last) = entries.last() {
            if item_id <= last.item_id {
                return Err(Error::InvalidData("ipma item_ids must be increasing and unique"));
            }
        }
        let association_count = src.read_u8()?;
        let mut associations = TryVec::with_capacity(usize::from(association_count))?;
        for _ in 0..association_count {
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(PropertyAssociation { index, essential })?;
        }
        ctx.tracker.reserve(u64::from(association_count) * 4)?;
        entries.push(ItemAssociations { item_id, associations })?;
    }
    Ok(entries)
}

impl MpegBox for ImageSpatialExtents {
    fn len(&self) -> usize {
        FULL_BOX_SIZE + 4 + 4
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.full_box(*b"ispe", 0, 0)?;
        b.u32(self.width)?;
        b.u32(self.height)
    }
}

impl MpegBox for PixelAspectRatio {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + 4 + 4
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"pasp")?;
        b.u32(self.h_spacing)?;
        b.u32(self.v_spacing)
    }
}

impl MpegBox for PixelInformation {
    fn len(&self) -> usize {
        FULL_BOX_SIZE + 1 + self.bits_per_channel.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.full_box(*b"pixi", 0, 0)?;
        b.u8(self.bits_per_channel.len() as u8)?;
        b.push(&self.bits_per_channel)
    }
}

impl MpegBox for AuxiliaryType {
    fn len(&self) -> usize {
        FULL_BOX_SIZE + self.aux_type.len() + 1 + self.aux_subtype.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.full_box(*b"auxC", 0, 0)?;
        b.str0(&self.aux_type)?;
        b.push(&self.aux_subtype)
    }
}

impl MpegBox for ColorInformation {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE
            + 4 // colour_type
            + match self {
                Self::Nclx(_) => 2 + 2 + 2 + 1,
                Self::IccProfile(icc) | Self::RestrictedIcc(icc) => icc.len(),
                Self::Unknown(_) => 0,
            }
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"colr")?;
        b.push(&self.colour_type().value)?;
        match self {
            Self::Nclx(nclx) => {
                b.u16(nclx.color_primaries)?;
                b.u16(nclx.transfer_characteristics)?;
                b.u16(nclx.matrix_coefficients)?;
                b.u8(u8::from(nclx.full_range) << 7)
            },
            Self::IccProfile(icc) | Self::RestrictedIcc(icc) => b.push(icc),
            Self::Unknown(_) => Ok(()),
        }
    }
}

impl MpegBox for LayeredImageIndexing {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + 1 + 3 * if self.large_size() { 4 } else { 2 }
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"a1lx")?;
        let large = self.large_size();
        b.u8(u8::from(large))?;
        for &size in &self.layer_sizes {
            b.uint(if large { 4 } else { 2 }, u64::from(size))?;
        }
        Ok(())
    }
}

impl MpegBox for CleanAperture {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + 8 * 4
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"clap")?;
        for v in [
            self.width_n,
            self.width_d,
            self.height_n,
            self.height_d,
            self.horiz_off_n,
            self.horiz_off_d,
            self.vert_off_n,
            self.vert_off_d,
        ] {
            b.u32(v)?;
        }
        Ok(())
    }
}

impl MpegBox for ItemProperty {
    fn len(&self) -> usize {
        match self {
            Self::ImageSpatialExtents(p) => p.len(),
            Self::PixelAspectRatio(p) => p.len(),
            Self::AV1Config(p) => p.len(),
            Self::PixelInformation(p) => p.len(),
            Self::AuxiliaryType(p) => p.len(),
            Self::ColorInformation(p) => p.len(),
            Self::LayeredImageIndexing(p) => p.len(),
            Self::OperatingPoint(_) => BASIC_BOX_SIZE + 1,
            Self::LayerSelector(_) => BASIC_BOX_SIZE + 2,
            Self::CleanAperture(p) => p.len(),
            Self::Rotation(_) | Self::Mirror(_) => BASIC_BOX_SIZE + 1,
            Self::Unknown(_) => BASIC_BOX_SIZE,
        }
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        match self {
            Self::ImageSpatialExtents(p) => p.write(w),
            Self::PixelAspectRatio(p) => p.write(w),
            Self::AV1Config(p) => p.write(w),
            Self::PixelInformation(p) => p.write(w),
            Self::AuxiliaryType(p) => p.write(w),
            Self::ColorInformation(p) => p.write(w),
            Self::LayeredImageIndexing(p) => p.write(w),
            Self::CleanAperture(p) => p.write(w),
            Self::OperatingPoint(_) | Self::LayerSelector(_) | Self::Rotation(_) | Self::Mirror(_) => {
                let mut b = w.new_box(self.len());
                b.basic_box(self.fourcc().value)?;
                match *self {
                    Self::OperatingPoint(op_index) => b.u8(op_index),
                    Self::LayerSelector(layer_id) => b.u16(layer_id),
                    Self::Rotation(r) => b.u8(r.angle & 3),
                    Self::Mirror(m) => b.u8(m.axis & 1),
                    _ => Ok(()),
                }
            },
            // Only the type survives parsing, so the body is empty.
            Self::Unknown(fourcc) => {
                let mut b = w.new_box(self.len());
                b.basic_box(fourcc.value)
            },
        }
    }
}

/// Property container under construction. Equal properties share a slot.
#[derive(Debug, Default)]
pub(crate) struct IpcoBox {
    properties: std::vec::Vec<ItemProperty>,
}

impl IpcoBox {
    /// Adds `prop` unless an equal one is already present. Returns its 1-based index.
    pub fn push(&mut self, prop: ItemProperty) -> Result<u16> {
        if !prop.is_known() || matches!(prop, ItemProperty::ColorInformation(ColorInformation::Unknown(_))) {
            return Err(Error::InvalidInput("can't write an unknown property"));
        }
        if let Some(pos) = self.properties.iter().position(|p| *p == prop) {
            return Ok((pos + 1) as u16);
        }
        if self.properties.len() >= 0x7fff {
            return Err(Error::InvalidInput("too many distinct item properties"));
        }
        self.properties.try_reserve(1)?;
        self.properties.push(prop);
        Ok(self.properties.len() as u16)
    }

    pub fn properties(&self) -> &[ItemProperty] {
        &self.properties
    }
}

impl MpegBox for IpcoBox {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + self.properties.iter().map(MpegBox::len).sum::<usize>()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"ipco")?;
        for p in &self.properties {
            p.write(&mut b)?;
        }
        Ok(())
    }
}

/// Property→image associations
#[derive(Debug, Clone)]
pub(crate) struct IpmaEntry {
    pub item_id: u32,
    pub associations: std::vec::Vec<PropertyAssociation>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IpmaBox {
    pub entries: std::vec::Vec<IpmaEntry>,
}

impl IpmaBox {
    fn large_ids(&self) -> bool {
        self.entries.iter().any(|e| e.item_id > u32::from(u16::MAX))
    }

    fn large_indices(&self) -> bool {
        self.entries.iter().flat_map(|e| &e.associations).any(|a| a.index > 0x7f)
    }
}

impl MpegBox for IpmaBox {
    fn len(&self) -> usize {
        let id_size = if self.large_ids() { 4 } else { 2 };
        let index_size = if self.large_indices() { 2 } else { 1 };
        FULL_BOX_SIZE
            + 4 // entry_count
            + self.entries.iter().map(|e| id_size + 1 + index_size * e.associations.len()).sum::<usize>()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let large_ids = self.large_ids();
        let large_indices = self.large_indices();
        let mut b = w.new_box(self.len());
        b.full_box(*b"ipma", u8::from(large_ids), u32::from(large_indices))?;
        b.u32(self.entries.len() as u32)?;
        for e in &self.entries {
            if large_ids {
                b.u32(e.item_id)?;
            } else {
                b.u16(e.item_id as u16)?;
            }
            b.u8(e.associations.len() as u8)?;
            for a in &e.associations {
                if large_indices {
                    b.u16(u16::from(a.essential) << 15 | (a.index & 0x7fff))?;
                } else {
                    b.u8(u8::from(a.essential) << 7 | (a.index as u8 & 0x7f))?;
                }
            }
        }
        Ok(())
    }
}

/// Item properties + associations
#[derive(Debug, Default)]
pub(crate) struct IprpBox {
    pub ipco: IpcoBox,
    pub ipma: IpmaBox,
}

impl MpegBox for IprpBox {
    fn len(&self) -> usize {
        BASIC_BOX_SIZE + self.ipco.len() + self.ipma.len()
    }

    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
        let mut b = w.new_box(self.len());
        b.basic_box(*b"iprp")?;
        self.ipco.write(&mut b)?;
        self.ipma.write(&mut b)
    }
}
