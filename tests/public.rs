// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use avif_container::{
    AvifReader, AvifWriter, ChromaSubsampling, ColorInformation, CompressedImage, ConstructionMethod, DecodeConfig,
    Error, FourCC, ImageGridMetadata, ItemProperty, NclxColor, Stop, StopReason, Unstoppable,
};
use std::io::Cursor;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn frame(fill: u8, len: usize, width: u32, height: u32, format: ChromaSubsampling) -> CompressedImage {
    CompressedImage::new(vec![fill; len], width, height, format, 8)
}

/// A minimal little-endian TIFF stream with an orientation tag in IFD0.
fn tiff_with_orientation(orientation: u16) -> Vec<u8> {
    let mut tiff = b"II*\0".to_vec();
    tiff.extend_from_slice(&8u32.to_le_bytes());
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&0x0112u16.to_le_bytes());
    tiff.extend_from_slice(&3u16.to_le_bytes()); // SHORT
    tiff.extend_from_slice(&1u32.to_le_bytes());
    tiff.extend_from_slice(&u32::from(orientation).to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes()); // no IFD1
    tiff
}

/// Top-level boxes as (type, size), following the size fields.
fn top_level_boxes(file: &[u8]) -> Vec<([u8; 4], u64)> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos < file.len() {
        let size32 = u32::from_be_bytes(file[pos..pos + 4].try_into().unwrap());
        let name: [u8; 4] = file[pos + 4..pos + 8].try_into().unwrap();
        let size = match size32 {
            1 => u64::from_be_bytes(file[pos + 8..pos + 16].try_into().unwrap()),
            0 => (file.len() - pos) as u64,
            n => u64::from(n),
        };
        boxes.push((name, size));
        pos += size as usize;
    }
    assert_eq!(pos, file.len(), "boxes must tile the file exactly");
    boxes
}

#[test]
fn single_image_with_alpha_round_trip() {
    init_logger();
    let color = frame(0xc0, 1000, 256, 256, ChromaSubsampling::Yuv420);
    let alpha = frame(0xa1, 300, 256, 256, ChromaSubsampling::Yuv400);
    let file = AvifWriter::new(color).with_alpha(alpha).write_to_vec().expect("write failed");

    let boxes = top_level_boxes(&file);
    let names: Vec<_> = boxes.iter().map(|b| &b.0).collect();
    assert_eq!(names, [b"ftyp", b"meta", b"mdat"]);
    assert_eq!(boxes[2].1, 8 + 1300, "mdat holds exactly the color and alpha payloads");

    let mut reader = AvifReader::from_bytes(&file).expect("from_bytes failed");
    let container = reader.container();
    assert!(container.ftyp.has_brand(b"avif"));
    assert!(container.ftyp.has_brand(b"mif1"));
    assert_eq!(reader.primary_item_id(), 1);
    assert_eq!(reader.alpha_item_id(), Some(2));
    assert!(!container.is_alpha_premultiplied(1));
    assert_eq!(container.references_from(2, FourCC::new(*b"auxl")).collect::<Vec<_>>(), [1]);

    // ispe and pasp are shared, so both items point at the same slots.
    let slots = |id| reader.properties_for(id).map(|(_, a)| a.index).collect::<Vec<_>>();
    let (color_slots, alpha_slots) = (slots(1), slots(2));
    assert_eq!(color_slots[..2], alpha_slots[..2]);
    assert_eq!(reader.container().properties().len(), 7);

    let av1c = reader.container().av1_config(1).expect("av1C");
    assert_eq!(av1c.chroma_subsampling(), Some(ChromaSubsampling::Yuv420));
    assert_eq!(av1c.bit_depth(), 8);
    assert!(reader.container().av1_config(2).expect("alpha av1C").monochrome);
    let essential = reader
        .properties_for(1)
        .filter(|(_, a)| a.essential)
        .map(|(p, _)| p.fourcc())
        .collect::<Vec<_>>();
    assert_eq!(essential, [FourCC::new(*b"av1C")]);

    let color_data = reader.item_data(1).expect("color data");
    assert_eq!(color_data.len(), 1000);
    assert!(color_data.iter().all(|&b| b == 0xc0));
    let alpha_data = reader.item_data(2).expect("alpha data");
    assert_eq!(alpha_data.len(), 300);
    assert!(alpha_data.iter().all(|&b| b == 0xa1));
}

#[test]
fn grid_round_trip() {
    init_logger();
    let tiles: Vec<_> = (0..4u8).map(|i| frame(i, 50 + usize::from(i), 128, 128, ChromaSubsampling::Yuv444)).collect();
    let grid = ImageGridMetadata::from_tiles(2, 2, 128, 128).unwrap();
    let file = AvifWriter::from_tiles(tiles, grid).write_to_vec().expect("write failed");

    let mut reader = AvifReader::from_bytes(&file).expect("from_bytes failed");
    assert_eq!(reader.primary_item_id(), 5);
    let grid_item = reader.item_info(5).expect("grid item");
    assert!(grid_item.item_type == b"grid");
    assert!(!grid_item.hidden);
    for id in 1..=4 {
        let tile = reader.item_info(id).expect("tile item");
        assert!(tile.item_type == b"av01");
        assert!(tile.hidden);
    }
    let location = reader.item_location(5).expect("grid location");
    assert_eq!(location.construction_method, ConstructionMethod::Idat);

    let info = reader.grid_info(5).expect("grid_info failed").expect("grid expected");
    assert_eq!(&*info.tile_item_ids, &[1, 2, 3, 4]);
    assert_eq!((info.descriptor.columns(), info.descriptor.rows()), (2, 2));
    assert_eq!((info.descriptor.output_width, info.descriptor.output_height), (256, 256));
    assert!(!info.descriptor.large_fields());
    assert_eq!(reader.grid_metadata(5).unwrap(), Some(grid));

    let spatial = reader.container().spatial_extents(5).expect("grid ispe");
    assert_eq!((spatial.width, spatial.height), (256, 256));
    assert!(reader.grid_info(1).unwrap().is_none());

    let tile_data = reader.grid_tile_data(5, &Unstoppable).expect("tiles");
    assert_eq!(tile_data.len(), 4);
    for (i, data) in tile_data.iter().enumerate() {
        assert_eq!(data.len(), 50 + i);
        assert!(data.iter().all(|&b| usize::from(b) == i));
    }
}

#[test]
fn grid_with_alpha_tiles() {
    let grid = ImageGridMetadata::from_tiles(2, 1, 32, 32).unwrap();
    let color = vec![frame(1, 10, 32, 32, ChromaSubsampling::Yuv444); 2];
    let alpha = vec![frame(2, 6, 32, 32, ChromaSubsampling::Yuv400); 2];
    let file = AvifWriter::from_tiles(color, grid)
        .with_alpha_tiles(alpha)
        .with_premultiplied_alpha(true)
        .write_to_vec()
        .expect("write failed");

    let mut reader = AvifReader::from_bytes(&file).expect("from_bytes failed");
    let primary = reader.primary_item_id();
    assert_eq!(primary, 5);
    let alpha_grid = reader.alpha_item_id().expect("alpha grid");
    assert_eq!(alpha_grid, 6);
    assert!(reader.container().is_alpha_premultiplied(primary));
    assert_eq!(&*reader.container().grid_tile_ids(6).unwrap(), &[2, 4]);
    let alpha_tiles = reader.grid_tile_data(alpha_grid, &Unstoppable).unwrap();
    assert!(alpha_tiles.iter().all(|t| &**t == [2; 6]));
}

#[test]
fn metadata_round_trip() {
    init_logger();
    let xmp = b"<x:xmpmeta xmlns:x=\"adobe:ns:meta/\"/>".to_vec();
    let file = AvifWriter::new(frame(9, 20, 16, 16, ChromaSubsampling::Yuv420))
        .with_exif(tiff_with_orientation(6))
        .with_xmp(xmp.clone())
        .write_to_vec()
        .expect("write failed");

    let mut reader = AvifReader::from_bytes(&file).expect("from_bytes failed");
    let exif_id = reader.exif_item_id().expect("exif item");
    let xmp_id = reader.xmp_item_id().expect("xmp item");
    assert_eq!((exif_id, xmp_id), (2, 3));
    assert_eq!(reader.item_info(xmp_id).unwrap().content_type(), Some("application/rdf+xml"));

    let payload = reader.exif_data().unwrap().expect("exif payload");
    assert_eq!(payload[..4], [0, 0, 0, 0]);
    let exif = reader.exif().unwrap().expect("exif");
    assert_eq!(exif.orientation(), Some(6));
    assert_eq!(&*reader.xmp_data().unwrap().expect("xmp payload"), &xmp[..]);
}

#[test]
fn color_information_round_trip() {
    let icc = vec![0x42; 60];
    let file = AvifWriter::new(frame(1, 8, 8, 8, ChromaSubsampling::Yuv444))
        .with_color_information(ColorInformation::icc_profile(&icc).unwrap())
        .write_to_vec()
        .unwrap();
    let reader = AvifReader::from_bytes(&file).unwrap();
    let colr = reader.container().color_information(1).expect("colr");
    assert_eq!(colr.icc(), Some(&icc[..]));

    let file = AvifWriter::new(frame(1, 8, 8, 8, ChromaSubsampling::Yuv444))
        .with_color_information(ColorInformation::Nclx(NclxColor::SRGB))
        .write_to_vec()
        .unwrap();
    let reader = AvifReader::from_bytes(&file).unwrap();
    assert_eq!(reader.container().color_information(1), Some(&ColorInformation::Nclx(NclxColor::SRGB)));
    assert!(
        reader
            .properties_for(1)
            .any(|(p, _)| matches!(p, ItemProperty::PixelInformation(pixi) if &*pixi.bits_per_channel == [8, 8, 8]))
    );
}

#[test]
fn reader_over_seekable_stream() {
    let file = AvifWriter::new(frame(3, 12, 32, 32, ChromaSubsampling::Yuv420)).write_to_vec().unwrap();
    let mut reader = AvifReader::new(Cursor::new(file.clone())).expect("new failed");
    assert_eq!(&*reader.item_data(1).unwrap(), &[3; 12]);
    assert!(reader.is_item_usable(1));
    assert!(reader.unknown_boxes().is_empty());
    assert_eq!(reader.into_inner().into_inner(), file);
}

#[test]
fn offsets_are_relative_to_the_file_start() {
    let mut sink = Cursor::new(vec![0xee; 100]);
    sink.set_position(100);
    AvifWriter::new(frame(5, 7, 16, 16, ChromaSubsampling::Yuv420)).write(&mut sink).unwrap();
    let written = sink.into_inner();
    let mut reader = AvifReader::from_bytes(&written[100..]).unwrap();
    assert_eq!(&*reader.item_data(1).unwrap(), &[5; 7]);
}

#[test]
fn malformed_input_is_rejected() {
    init_logger();
    assert!(AvifReader::from_bytes(&[]).is_err());
    assert!(AvifReader::from_bytes(b"not an avif file at all").is_err());

    let file = AvifWriter::new(frame(3, 12, 32, 32, ChromaSubsampling::Yuv420)).write_to_vec().unwrap();

    // Every truncation fails cleanly, or parses if only payload bytes are lost.
    for len in 0..file.len() {
        if let Ok(mut reader) = AvifReader::from_bytes(&file[..len]) {
            assert!(reader.item_data(1).is_err(), "truncated payload read at {len}");
        }
    }

    // A non-AVIF major brand without AVIF compatible brands.
    let mut heic = file.clone();
    heic[8..12].copy_from_slice(b"heic");
    heic[16..20].copy_from_slice(b"heic");
    assert!(matches!(AvifReader::from_bytes(&heic), Err(Error::InvalidData(_))));
}

#[test]
fn resource_limits() {
    let grid = ImageGridMetadata::from_tiles(2, 2, 64, 64).unwrap();
    let tiles = vec![frame(1, 100, 64, 64, ChromaSubsampling::Yuv444); 4];
    let file = AvifWriter::from_tiles(tiles, grid).write_to_vec().unwrap();

    let config = DecodeConfig::default().with_max_grid_tiles(3);
    let mut reader = AvifReader::from_bytes_with_config(&file, &config, &Unstoppable).unwrap();
    assert!(matches!(reader.grid_info(5), Err(Error::ResourceLimitExceeded(_))));

    let file = AvifWriter::new(frame(1, 10_000, 64, 64, ChromaSubsampling::Yuv420)).write_to_vec().unwrap();
    let config = DecodeConfig::default().with_peak_memory_limit(9_999);
    let mut reader = AvifReader::from_bytes_with_config(&file, &config, &Unstoppable).unwrap();
    assert!(matches!(reader.item_data(1), Err(Error::ResourceLimitExceeded(_))));

    let config = DecodeConfig::default().with_peak_memory_limit(10_000);
    let mut reader = AvifReader::from_bytes_with_config(&file, &config, &Unstoppable).unwrap();
    assert_eq!(reader.item_data(1).unwrap().len(), 10_000);
    // Reservations are released after each read.
    assert_eq!(reader.item_data(1).unwrap().len(), 10_000);
}

#[test]
fn stop_token_cancels_parsing() {
    struct Cancelled;
    impl Stop for Cancelled {
        fn check(&self) -> Result<(), StopReason> {
            Err(StopReason::Cancelled)
        }
    }
    let file = AvifWriter::new(frame(3, 12, 32, 32, ChromaSubsampling::Yuv420)).write_to_vec().unwrap();
    let result = AvifReader::from_bytes_with_config(&file, &DecodeConfig::default(), &Cancelled);
    assert!(matches!(result, Err(Error::Stopped(StopReason::Cancelled))));
}

#[test]
fn writer_rejects_invalid_input() {
    let odd_grid = ImageGridMetadata::from_tiles(3, 3, 64, 64).unwrap();
    let tiles = vec![frame(1, 4, 64, 64, ChromaSubsampling::Yuv420); 9];
    assert!(matches!(AvifWriter::from_tiles(tiles, odd_grid).write_to_vec(), Err(Error::InvalidInput(_))));

    let mismatched = AvifWriter::new(frame(1, 4, 64, 64, ChromaSubsampling::Yuv420))
        .with_alpha(frame(1, 4, 64, 32, ChromaSubsampling::Yuv400))
        .write_to_vec();
    assert!(matches!(mismatched, Err(Error::InvalidInput(_))));

    let unknown = AvifWriter::new(frame(1, 4, 64, 64, ChromaSubsampling::Yuv420))
        .with_color_information(ColorInformation::Unknown(FourCC::new(*b"abcd")))
        .write_to_vec();
    assert!(matches!(unknown, Err(Error::InvalidInput(_))));
}
