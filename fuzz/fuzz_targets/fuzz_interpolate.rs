#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use probekit::context::Variables;
use probekit::primitives::{interpolate, placeholders};

#[derive(Arbitrary, Debug)]
struct Input {
    text: String,
    bindings: Vec<(String, String)>,
}

fuzz_target!(|input: Input| {
    let mut vars = Variables::new();
    for (name, value) in &input.bindings {
        vars.set(name, value.clone());
    }
    let names = placeholders(&input.text);
    let all_bound = names.iter().all(|n| vars.contains(n));
    match interpolate(&input.text, &vars) {
        Ok(_) => assert!(all_bound, "resolved with unbound names {:?}", names),
        Err(_) => assert!(!all_bound, "failed although every name was bound"),
    }
});
