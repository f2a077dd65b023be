#![deny(unsafe_code)]
//! Reader and writer for the AVIF container (ISO-BMFF / HEIF image items).
//!
//! Reading parses the box tree of a seekable stream into an [`AvifContainer`]
//! and exposes items, properties, grids, alpha planes and metadata through
//! [`AvifReader`]. Writing assembles already-compressed AV1 images into a
//! complete file with [`AvifWriter`].
//!
//! The AV1 bitstreams themselves are opaque here: this crate never encodes or
//! decodes pixels.
//!
//! ```no_run
//! use avif_container::AvifReader;
//!
//! let bytes = std::fs::read("image.avif")?;
//! let mut reader = AvifReader::from_bytes(&bytes)?;
//! let primary = reader.primary_item_id();
//! let data = reader.item_data(primary)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fallible_collections::TryReserveError;
use std::convert::TryInto as _;

mod av1c;
mod bmff;
mod boxes;
mod exif;
mod grid;
mod items;
mod layers;
mod properties;
mod read;
mod reader;
mod write;
mod writer;

pub use crate::av1c::{Av1ConfigBox, SequenceLevel, SequenceProfile};
pub use crate::boxes::{BoxType, FourCC};
pub use crate::exif::{ExifByteOrder, ExifData, ExifTagId, ExifValue, IfdKind};
pub use crate::grid::{ChromaSubsampling, ImageGridDescriptor, ImageGridInfo, ImageGridMetadata};
pub use crate::items::{
    ConstructionMethod, ItemInfoEntry, ItemInfoExtension, ItemLocationEntry, ItemLocationExtent, ItemReference,
};
pub use crate::layers::{LayerRange, layer_byte_range};
pub use crate::properties::{
    AuxiliaryType, CleanAperture, ColorInformation, ImageMirror, ImageRotation, ImageSpatialExtents, ItemProperty,
    ItemPropertyKind, LayeredImageIndexing, NclxColor, PixelAspectRatio, PixelInformation, PropertyAssociation,
};
pub use crate::read::{AvifContainer, AvifReader, FileTypeBox, MediaDataBounds, UnknownBox};
pub use crate::reader::{BinaryReader, Segment};
pub use crate::write::{AvifWriter, CompressedImage};
pub use crate::writer::BigEndianWriter;

pub use enough::{Stop, StopReason, Unstoppable};

/// URN of the `auxC` type that marks an auxiliary image as an alpha plane.
pub const ALPHA_AUXILIARY_TYPE: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";

/// Lossless widening to `u64`. Only implemented where no value can be cut.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap_or(u64::MAX)
    }
}

/// Lossless widening to `usize`, for counts read from box fields.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Compile-time check that `$from_type` fits in `usize` on this target.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap_or(usize::MAX)
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Everything that can go wrong while reading or writing a file.
///
/// I/O failures keep the underlying `io::Error`; a short read becomes
/// [`Error::UnexpectedEOF`] so truncated files are easy to tell apart.
#[derive(Debug)]
pub enum Error {
    /// The file breaks a structural rule of the format.
    InvalidData(&'static str),
    /// Valid, but uses a feature this crate doesn't implement.
    Unsupported(&'static str),
    /// The stream ended inside a box.
    UnexpectedEOF,
    Io(std::io::Error),
    /// A fallible allocation failed.
    OutOfMemory,
    /// A [`DecodeConfig`] limit was hit.
    ResourceLimitExceeded(&'static str),
    /// The writer was given images or metadata that can't form a valid file.
    InvalidInput(&'static str),
    /// The [`Stop`] token asked to abort.
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) | Self::InvalidInput(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidData("invalid utf8")
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::InvalidData("invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::InvalidInput(_) => std::io::ErrorKind::InvalidInput,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::OutOfMemory => std::io::ErrorKind::OutOfMemory,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validation switches threaded through box parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Tolerate recoverable violations (stray flags, a missing or foreign
    /// 'hdlr', an AVIF brand only among the compatible brands) with a
    /// warning instead of an error.
    pub lenient: bool,
}

/// Limits and strictness for [`AvifReader`].
///
/// Memory is counted as bytes buffered for box payloads and item data, and
/// checked before each buffer is allocated.
///
/// ```rust
/// use avif_container::DecodeConfig;
///
/// let untrusted = DecodeConfig::default()
///     .with_peak_memory_limit(64 << 20)
///     .with_total_megapixels_limit(32)
///     .with_max_grid_tiles(256);
///
/// let trusted = DecodeConfig::unlimited().lenient(true);
/// # let _ = (untrusted, trusted);
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Most bytes held at once. Defaults to 1 GB.
    pub peak_memory_limit: Option<u64>,
    /// Largest grid output, in megapixels. Defaults to 512.
    pub total_megapixels_limit: Option<u32>,
    /// Most tiles in one grid. Defaults to 1000.
    pub max_grid_tiles: Option<u32>,
    /// See [`ParseOptions::lenient`]. Off by default.
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            total_megapixels_limit: Some(512),
            max_grid_tiles: Some(1_000),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// No limits, strict parsing.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            total_megapixels_limit: None,
            max_grid_tiles: None,
            lenient: false,
        }
    }

    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    pub fn with_max_grid_tiles(mut self, tiles: u32) -> Self {
        self.max_grid_tiles = Some(tiles);
        self
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }
}

/// Tracks buffered bytes against [`DecodeConfig`] limits.
///
/// The high-water mark never goes down, so a limit bounds the worst moment
/// of a whole read rather than the current state. Parsed tables are released
/// with [`ResourceTracker::release_all`] once the container is parsed, so
/// later item reads are charged only for their own buffers.
#[derive(Debug, Clone)]
pub(crate) struct ResourceTracker {
    config: DecodeConfig,
    held: u64,
    high_water: u64,
}

impl ResourceTracker {
    pub(crate) fn new(config: &DecodeConfig) -> Self {
        Self {
            config: config.clone(),
            held: 0,
            high_water: 0,
        }
    }

    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<()> {
        self.held = self.held.saturating_add(bytes);
        self.high_water = self.high_water.max(self.held);
        match self.config.peak_memory_limit {
            Some(limit) if self.high_water > limit => {
                Err(Error::ResourceLimitExceeded("peak memory limit exceeded"))
            },
            _ => Ok(()),
        }
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.held = self.held.saturating_sub(bytes);
    }

    pub(crate) fn release_all(&mut self) {
        self.held = 0;
    }

    pub(crate) fn validate_total_megapixels(&self, width: u32, height: u32) -> Result<()> {
        let Some(limit) = self.config.total_megapixels_limit else {
            return Ok(());
        };
        let pixels = u64::from(width)
            .checked_mul(u64::from(height))
            .ok_or(Error::InvalidData("dimension overflow"))?;
        if pixels / 1_000_000 > u64::from(limit) {
            return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
        }
        Ok(())
    }

    pub(crate) fn validate_grid_tiles(&self, count: u32) -> Result<()> {
        match self.config.max_grid_tiles {
            Some(limit) if count > limit => Err(Error::ResourceLimitExceeded("grid tile count limit exceeded")),
            _ => Ok(()),
        }
    }
}

#[test]
fn tracker_counts_peak_not_current() {
    let config = DecodeConfig::unlimited().with_peak_memory_limit(100);
    let mut tracker = ResourceTracker::new(&config);
    tracker.reserve(60).unwrap();
    tracker.release(60);
    tracker.reserve(40).unwrap();
    assert!(matches!(tracker.reserve(70), Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn tracker_release_all_keeps_the_peak() {
    let config = DecodeConfig::unlimited().with_peak_memory_limit(100);
    let mut tracker = ResourceTracker::new(&config);
    tracker.reserve(90).unwrap();
    tracker.release_all();
    tracker.reserve(100).unwrap();
    assert_eq!(tracker.high_water, 100);
    tracker.release(100);
    assert!(tracker.reserve(101).is_err());
}

#[test]
fn reserve_failure_maps_to_out_of_memory() {
    let err = std::vec::Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err();
    assert!(matches!(Error::from(err), Error::OutOfMemory));
}

#[test]
fn tracker_megapixels() {
    let tracker = ResourceTracker::new(&DecodeConfig::default().with_total_megapixels_limit(1));
    assert!(tracker.validate_total_megapixels(1000, 1999).is_ok());
    assert!(tracker.validate_total_megapixels(2000, 1000).is_err());
    assert!(ResourceTracker::new(&DecodeConfig::unlimited()).validate_grid_tiles(u32::MAX).is_ok());
}

#[test]
fn io_error_kinds_survive_conversion() {
    let eof: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
    assert!(matches!(eof, Error::UnexpectedEOF));
    let back: std::io::Error = Error::InvalidData("x").into();
    assert_eq!(back.kind(), std::io::ErrorKind::InvalidData);
}
