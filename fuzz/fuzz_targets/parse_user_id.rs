#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let field = chatpgp_core::userid::unescape_colon_field(&raw);
    let uid = chatpgp_core::parse_user_id(&field);
    let _ = chatpgp_core::display_user_id(&uid);
});
