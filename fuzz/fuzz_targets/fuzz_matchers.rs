#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use probekit::context::Variables;
use probekit::enums::{Condition, MatcherKind, Protocol};
use probekit::evaluate::evaluate_matchers;
use probekit::response::ResponseView;
use probekit::types::Matcher;

fn arbitrary_matcher(u: &mut Unstructured<'_>) -> arbitrary::Result<Matcher> {
    let kind = match u.int_in_range(0..=4)? {
        0 => MatcherKind::Word,
        1 => MatcherKind::Regex,
        2 => MatcherKind::Binary,
        3 => MatcherKind::Status,
        _ => MatcherKind::Size,
    };
    let mut m = Matcher::new(kind);
    m.part = Option::<String>::arbitrary(u)?;
    m.words = Vec::<String>::arbitrary(u)?;
    m.regex = Vec::<String>::arbitrary(u)?;
    m.binary = Vec::<String>::arbitrary(u)?;
    m.status = Vec::<i64>::arbitrary(u)?;
    m.size = Vec::<usize>::arbitrary(u)?;
    m.negative = bool::arbitrary(u)?;
    m.case_insensitive = bool::arbitrary(u)?;
    if bool::arbitrary(u)? {
        m.condition = Condition::And;
    }
    Ok(m)
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let Ok(count) = u.int_in_range(0..=4) else {
        return;
    };
    let mut matchers = Vec::with_capacity(count);
    for _ in 0..count {
        match arbitrary_matcher(&mut u) {
            Ok(m) => matchers.push(m),
            Err(_) => return,
        }
    }
    let body = u.take_rest();
    let view = ResponseView::new(Protocol::Http, "http://fuzz.test", "")
        .with_status(200)
        .with_part("body", body.to_vec());

    let outcome = evaluate_matchers(&matchers, Condition::Or, &view, &Variables::new(), None);
    if matchers.is_empty() {
        assert!(!outcome.fired);
    }
    assert!(outcome.matched_names.len() <= matchers.len());
});
