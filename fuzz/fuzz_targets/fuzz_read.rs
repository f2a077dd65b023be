#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = avif_container::AvifReader::from_bytes(data) else {
        return;
    };
    let ids: Vec<u32> = reader.items().iter().map(|i| i.item_id).collect();
    for id in ids {
        let _ = reader.item_data(id);
        let _ = reader.selected_layer_data(id);
        let _ = reader.grid_metadata(id);
    }
    let _ = reader.exif();
    let _ = reader.xmp_data();
});
