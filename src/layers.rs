// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progressive (layered) AV1 items: 'a1lx' slicing and 'lsel' placement.
//!
//! See AV1 ISOBMFF § 2.3.6 and ISO/IEC 23008-12:2022 § 6.5.11

use crate::properties::{ItemProperty, LayeredImageIndexing};
use crate::{Error, Result};

/// Byte range `[start, end)` of one spatial layer within an item's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRange {
    pub start: u64,
    pub end: u64,
}

impl LayerRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Locates `layer_id` in an item of `total_size` bytes described by `a1lx`.
///
/// The listed sizes cover the first layers; the layer after the last
/// non-zero size takes whatever is left. A listed size must be smaller
/// than the bytes remaining at that point, and no size may follow a zero.
pub fn layer_byte_range(indexing: &LayeredImageIndexing, total_size: u64, layer_id: u16) -> Result<LayerRange> {
    let listed = indexing.layer_sizes.iter().take_while(|&&s| s != 0).count();
    if indexing.layer_sizes[listed..].iter().any(|&s| s != 0) {
        return Err(Error::InvalidData("a1lx layer size follows a zero size"));
    }

    let mut start = 0u64;
    for (i, &size) in indexing.layer_sizes[..listed].iter().enumerate() {
        let size = u64::from(size);
        if size >= total_size - start {
            return Err(Error::InvalidData("a1lx layer size exceeds the item size"));
        }
        if i == usize::from(layer_id) {
            return Ok(LayerRange { start, end: start + size });
        }
        start += size;
    }

    if usize::from(layer_id) == listed {
        Ok(LayerRange { start, end: total_size })
    } else {
        Err(Error::InvalidData("layer id beyond the layers listed in a1lx"))
    }
}

/// A layer selector must come before any transformative property
/// in an item's association list.
pub(crate) fn check_transform_order<'a>(properties: impl IntoIterator<Item = &'a ItemProperty>) -> Result<()> {
    let mut seen_transform = false;
    for prop in properties {
        match prop {
            ItemProperty::LayerSelector(_) if seen_transform => {
                return Err(Error::InvalidData("lsel must precede transformative properties"));
            },
            other => {
                seen_transform |= other.kind().is_some_and(|k| k.is_transform());
            },
        }
    }
    Ok(())
}
