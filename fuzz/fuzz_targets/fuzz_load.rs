#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);
    if let Ok(loaded) = probekit::load(&s) {
        // Loading is stable under a second normalization.
        let again = probekit::normalize(loaded.template.clone());
        let first = serde_json::to_value(&loaded.template).ok();
        let second = serde_json::to_value(&again).ok();
        assert_eq!(first, second, "normalize is not idempotent");
    }
});
