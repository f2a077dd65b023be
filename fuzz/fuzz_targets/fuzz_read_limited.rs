#![no_main]
use avif_container::{AvifReader, DecodeConfig};
use enough::Unstoppable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let config = DecodeConfig::default()
        .with_peak_memory_limit(16 << 20)
        .with_total_megapixels_limit(64)
        .with_max_grid_tiles(64)
        .lenient(true);
    let Ok(mut reader) = AvifReader::from_bytes_with_config(data, &config, &Unstoppable) else {
        return;
    };
    let primary = reader.primary_item_id();
    let _ = reader.item_data(primary);
    if let Ok(Some(_)) = reader.grid_info(primary) {
        let _ = reader.grid_tile_data(primary, &Unstoppable);
    }
    if let Some(alpha) = reader.alpha_item_id() {
        let _ = reader.item_data(alpha);
    }
});
