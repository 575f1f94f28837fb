#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Ok(keys) = chatpgp_core::parse_colon_listing(&text) {
        // Every record the parser accepts must index cleanly.
        let mut store = chatpgp_core::KeychainStore::new();
        store.extend(keys);
    }
});
