#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    if let Ok(request) = probekit::primitives::parse_raw_http(&s) {
        assert!(!request.method.is_empty());
        assert!(!request.path.is_empty());
    }
});
