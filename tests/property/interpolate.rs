use probekit::context::Variables;
use probekit::primitives::{interpolate, placeholders};
use proptest::prelude::*;

fn arb_name() -> impl Strategy<Value = String> {
    "[A-Za-z_][A-Za-z0-9_]{0,10}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    // Text without braces passes through untouched.
    #[test]
    fn plain_text_is_identity(text in "[^{}\\\\]{0,60}") {
        prop_assert_eq!(interpolate(&text, &Variables::new()).unwrap(), text);
    }

    // A bound placeholder is replaced by its first value.
    #[test]
    fn bound_placeholder_substitutes(
        name in arb_name(),
        value in "[a-z0-9./:-]{0,20}",
        prefix in "[a-z ]{0,10}",
        suffix in "[a-z ]{0,10}",
    ) {
        let mut vars = Variables::new();
        vars.set_all(&name, vec![value.clone(), "ignored".to_string()]);
        let input = format!("{}{{{{{}}}}}{}", prefix, name, suffix);
        prop_assert_eq!(interpolate(&input, &vars).unwrap(), format!("{}{}{}", prefix, value, suffix));
    }

    // Every unbound name makes the string unresolvable and is named in the error.
    #[test]
    fn unbound_placeholder_is_an_error(name in arb_name(), other in arb_name()) {
        let mut vars = Variables::new();
        vars.set(&format!("{}-bound", other), "x");
        let err = interpolate(&format!("/{{{{{}}}}}/", name), &vars).unwrap_err();
        prop_assert!(err.to_string().contains(&name));
    }

    // placeholders() lists each name once, in order of first appearance.
    #[test]
    fn placeholders_are_deduplicated(names in prop::collection::vec(arb_name(), 0..6)) {
        let text: String = names.iter().map(|n| format!("{{{{{}}}}}-", n)).collect();
        let mut expected: Vec<String> = Vec::new();
        for n in &names {
            if !expected.contains(n) {
                expected.push(n.clone());
            }
        }
        prop_assert_eq!(placeholders(&text), expected);
    }

    // Interpolated output never contains a placeholder that was bound.
    #[test]
    fn resolved_output_has_no_bound_placeholders(
        names in prop::collection::vec(arb_name(), 1..5),
        value in "[a-z]{1,5}",
    ) {
        let mut vars = Variables::new();
        for n in &names {
            vars.set(n, value.clone());
        }
        let text: String = names.iter().map(|n| format!("{{{{{}}}}}", n)).collect();
        let out = interpolate(&text, &vars).unwrap();
        prop_assert!(!out.contains("{{"));
    }
}

#[test]
fn escaped_opener_stays_literal() {
    let mut vars = Variables::new();
    vars.set("Host", "a.test");
    assert_eq!(
        interpolate(r"\{{Host}} is {{Host}}", &vars).unwrap(),
        "{{Host}} is a.test"
    );
}

#[test]
fn unclosed_opener_passes_through() {
    assert_eq!(interpolate("a {{b", &Variables::new()).unwrap(), "a {{b");
}
