use probekit::context::Variables;
use probekit::enums::{ExtractorKind, Protocol};
use probekit::extract::evaluate_extractors;
use probekit::response::ResponseView;
use probekit::types::{Extracted, Extractor};
use proptest::prelude::*;

fn view(body: &str) -> ResponseView {
    ResponseView::new(Protocol::Http, "http://x.test", "").with_part("body", body)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    // A regex over `id=<n>;` tokens captures every token, in body order,
    // duplicates included.
    #[test]
    fn regex_captures_keep_body_order(ids in prop::collection::vec(0u32..50, 0..10)) {
        let body: String = ids.iter().map(|n| format!("id={};", n)).collect();
        let mut e = Extractor::new(ExtractorKind::Regex);
        e.name = Some("id".to_string());
        e.group = Some(1);
        e.regex = vec![r"id=(\d+);".to_string()];

        let extracted = evaluate_extractors(&[e], &view(&body), &Variables::new(), None);
        let expected: Vec<String> = ids.iter().map(|n| n.to_string()).collect();
        if expected.is_empty() {
            prop_assert!(extracted.get("id").is_none());
        } else {
            prop_assert_eq!(extracted.get("id").unwrap(), expected.as_slice());
        }
    }

    // extend() appends values under existing keys and keeps first-seen key order.
    #[test]
    fn extend_appends_in_order(
        first in prop::collection::vec(("[ab]", "[a-z]{1,3}"), 0..6),
        second in prop::collection::vec(("[bc]", "[a-z]{1,3}"), 0..6),
    ) {
        let mut left = Extracted::new();
        for (k, v) in &first {
            left.push(k, v.clone(), false);
        }
        let mut right = Extracted::new();
        for (k, v) in &second {
            right.push(k, v.clone(), false);
        }
        left.extend(right);

        for key in ["a", "b", "c"] {
            let expected: Vec<String> = first
                .iter()
                .chain(second.iter())
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .collect();
            match left.get(key) {
                Some(values) => prop_assert_eq!(values, expected.as_slice()),
                None => prop_assert!(expected.is_empty()),
            }
        }
    }
}
