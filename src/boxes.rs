// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// A four-character code: the raw 4 bytes of a box, brand or item type.
///
/// Comparison is byte-exact and case-sensitive.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.value)
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = t.into();
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value == **other
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => self.value.fmt(f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:08x}", u32::from(*self)),
        }
    }
}

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl BoxType {
            pub const fn fourcc(self) -> [u8; 4] {
                use self::BoxType::*;
                let n: u32 = match self {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                };
                n.to_be_bytes()
            }
        }
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc: FourCC = From::from(*self);
        fourcc.fmt(f)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    MetadataBox                       0x6d65_7461, // "meta"
    MovieBox                          0x6d6f_6f76, // "moov"
    FreeBox                           0x6672_6565, // "free"
    SkipBox                           0x736b_6970, // "skip"
    UuidBox                           0x7575_6964, // "uuid"
    HandlerBox                        0x6864_6c72, // "hdlr"
    PrimaryItemBox                    0x7069_746d, // "pitm"
    ItemInfoBox                       0x6969_6e66, // "iinf"
    ItemInfoEntry                     0x696e_6665, // "infe"
    ItemLocationBox                   0x696c_6f63, // "iloc"
    ItemReferenceBox                  0x6972_6566, // "iref"
    ItemDataBox                       0x6964_6174, // "idat"
    ItemPropertiesBox                 0x6970_7270, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, // "ipma"
    ImageSpatialExtentsProperty       0x6973_7065, // "ispe"
    PixelAspectRatioBox               0x7061_7370, // "pasp"
    AV1CodecConfigurationBox          0x6176_3143, // "av1C"
    PixelInformationBox               0x7069_7869, // "pixi"
    AuxiliaryTypeProperty             0x6175_7843, // "auxC"
    ColorInformationBox               0x636f_6c72, // "colr"
    AV1LayeredImageIndexingProperty   0x6131_6c78, // "a1lx"
    OperatingPointSelectorProperty    0x6131_6f70, // "a1op"
    LayerSelectorProperty             0x6c73_656c, // "lsel"
    CleanApertureBox                  0x636c_6170, // "clap"
    ImageRotation                     0x6972_6f74, // "irot"
    ImageMirror                       0x696d_6972, // "imir"
);

/// Item types, reference types, brands and other codes that are not boxes.
pub(crate) mod codes {
    use super::FourCC;

    pub const AVIF: FourCC = FourCC::new(*b"avif");
    pub const AVIS: FourCC = FourCC::new(*b"avis");
    pub const MIF1: FourCC = FourCC::new(*b"mif1");
    pub const MIAF: FourCC = FourCC::new(*b"miaf");

    pub const PICT: FourCC = FourCC::new(*b"pict");

    pub const AV01: FourCC = FourCC::new(*b"av01");
    pub const GRID: FourCC = FourCC::new(*b"grid");
    pub const EXIF: FourCC = FourCC::new(*b"Exif");
    pub const MIME: FourCC = FourCC::new(*b"mime");
    pub const URI: FourCC = FourCC::new(*b"uri ");

    pub const AUXL: FourCC = FourCC::new(*b"auxl");
    pub const DIMG: FourCC = FourCC::new(*b"dimg");
    pub const CDSC: FourCC = FourCC::new(*b"cdsc");
    pub const PREM: FourCC = FourCC::new(*b"prem");
    pub const ILOC: FourCC = FourCC::new(*b"iloc");

    pub const NCLX: FourCC = FourCC::new(*b"nclx");
    pub const PROF: FourCC = FourCC::new(*b"prof");
    pub const RICC: FourCC = FourCC::new(*b"rICC");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_type_round_trips_through_u32() {
        let n: u32 = BoxType::ItemPropertyAssociationBox.into();
        assert_eq!(&n.to_be_bytes(), b"ipma");
        assert_eq!(BoxType::from(n), BoxType::ItemPropertyAssociationBox);
        assert_eq!(&BoxType::AV1CodecConfigurationBox.fourcc(), b"av1C");
    }

    #[test]
    fn unknown_box_keeps_its_code() {
        let t = BoxType::from(u32::from_be_bytes(*b"zzzz"));
        assert_eq!(t, BoxType::UnknownBox(u32::from_be_bytes(*b"zzzz")));
        assert_eq!(format!("{t:?}"), "zzzz");
    }

    #[test]
    fn fourcc_is_case_sensitive() {
        assert!(FourCC::from(*b"rICC") == b"rICC");
        assert!(FourCC::from(*b"ricc") != FourCC::from(*b"rICC"));
    }
}
