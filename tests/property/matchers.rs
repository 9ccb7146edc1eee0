use probekit::context::Variables;
use probekit::enums::{MatcherKind, Protocol};
use probekit::evaluate::evaluate_matcher;
use probekit::response::ResponseView;
use probekit::types::Matcher;
use proptest::prelude::*;

fn view(body: &[u8]) -> ResponseView {
    ResponseView::new(Protocol::Http, "http://x.test", "")
        .with_status(200)
        .with_part("body", body.to_vec())
}

fn words(list: &[String]) -> Matcher {
    let mut m = Matcher::new(MatcherKind::Word);
    m.words = list.to_vec();
    m
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    // word (or) fires iff some word is a substring of the body.
    #[test]
    fn word_or_matches_std(
        body in "[a-z ]{0,40}",
        list in prop::collection::vec("[a-z]{1,4}", 1..5),
    ) {
        let expected = list.iter().any(|w| body.contains(w.as_str()));
        prop_assert_eq!(evaluate_matcher(&words(&list), &view(body.as_bytes()), &Variables::new(), None), expected);
    }

    // negative inverts a matcher that has conditions.
    #[test]
    fn negative_inverts(
        body in "[a-z ]{0,40}",
        list in prop::collection::vec("[a-z]{1,4}", 1..5),
    ) {
        let plain = words(&list);
        let mut negated = plain.clone();
        negated.negative = true;
        let v = view(body.as_bytes());
        prop_assert_eq!(
            evaluate_matcher(&negated, &v, &Variables::new(), None),
            !evaluate_matcher(&plain, &v, &Variables::new(), None)
        );
    }

    // A matcher with no conditions never fires, negated or not.
    #[test]
    fn empty_matcher_never_fires(
        body in prop::collection::vec(any::<u8>(), 0..64),
        negative in any::<bool>(),
        kind in prop_oneof![
            Just(MatcherKind::Word),
            Just(MatcherKind::Regex),
            Just(MatcherKind::Binary),
            Just(MatcherKind::Status),
            Just(MatcherKind::Size),
        ],
    ) {
        let mut m = Matcher::new(kind);
        m.negative = negative;
        prop_assert!(!evaluate_matcher(&m, &view(&body), &Variables::new(), None));
    }

    // size fires iff one of the listed sizes equals the body length.
    #[test]
    fn size_compares_length(body in prop::collection::vec(any::<u8>(), 0..64), sizes in prop::collection::vec(0usize..64, 1..4)) {
        let mut m = Matcher::new(MatcherKind::Size);
        m.size = sizes.clone();
        prop_assert_eq!(
            evaluate_matcher(&m, &view(&body), &Variables::new(), None),
            sizes.contains(&body.len())
        );
    }

    // binary fires iff the decoded bytes occur in the body.
    #[test]
    fn binary_finds_subsequence(body in prop::collection::vec(any::<u8>(), 1..64), start in 0usize..64, len in 1usize..8) {
        let start = start % body.len();
        let end = (start + len).min(body.len());
        let needle = &body[start..end];
        let mut m = Matcher::new(MatcherKind::Binary);
        m.binary = vec![hex::encode(needle)];
        prop_assert!(evaluate_matcher(&m, &view(&body), &Variables::new(), None));
    }
}
