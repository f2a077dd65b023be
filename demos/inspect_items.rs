//! List the items of an AVIF file with their properties and references
use avif_container::{AvifReader, DecodeConfig, Unstoppable};
use std::env;
use std::fs::File;
use std::io::BufReader;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <avif-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let f = File::open(path).expect("Failed to open file");
    let config = DecodeConfig::default().lenient(true);

    let mut reader = match AvifReader::with_config(BufReader::new(f), &config, &Unstoppable) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            std::process::exit(1);
        }
    };

    let container = reader.container();
    println!("File: {}", path);
    println!(
        "Brands: {} ({})",
        container.ftyp.major_brand,
        container.ftyp.compatible_brands.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", ")
    );
    println!("Primary item: {}", container.primary_item_id);

    for item in container.item_infos.iter() {
        let hidden = if item.hidden { " hidden" } else { "" };
        let usable = if container.is_item_usable(item.item_id) { "" } else { " unusable" };
        println!("Item {} '{}'{}{}", item.item_id, item.item_type, hidden, usable);
        if let Some(content_type) = item.content_type() {
            println!("  content type: {}", content_type);
        }
        if let Some(location) = container.item_location(item.item_id) {
            let total: u64 = location.extents.iter().map(|e| e.length).sum();
            println!(
                "  {:?}, {} extent(s), {} bytes",
                location.construction_method,
                location.extents.len(),
                total
            );
        }
        for (property, association) in container.item_properties(item.item_id) {
            let essential = if association.essential { " (essential)" } else { "" };
            println!("  [{}] {:?}{}", association.index, property, essential);
        }
        for reference in container.item_references.iter().filter(|r| r.from_item_id == item.item_id) {
            println!("  {} -> {:?}", reference.reference_type, &*reference.to_item_ids);
        }
    }

    for unknown in container.unknown_boxes.iter() {
        println!("Unknown box '{}' at {} ({} bytes)", unknown.box_type, unknown.offset, unknown.size);
    }

    let primary = reader.primary_item_id();
    match reader.grid_info(primary) {
        Ok(Some(grid)) => println!(
            "Grid: {}x{} tiles, {}x{} output",
            grid.descriptor.columns(),
            grid.descriptor.rows(),
            grid.descriptor.output_width,
            grid.descriptor.output_height
        ),
        Ok(None) => {},
        Err(e) => eprintln!("Grid error: {}", e),
    }
    match reader.exif() {
        Ok(Some(exif)) => println!("EXIF: {} tags, orientation {:?}", exif.tags.len(), exif.orientation()),
        Ok(None) => {},
        Err(e) => eprintln!("EXIF error: {}", e),
    }
    if let Ok(Some(xmp)) = reader.xmp_data() {
        println!("XMP: {} bytes", xmp.len());
    }
}
