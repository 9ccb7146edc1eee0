//! Extractor Evaluator.

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::Variables;
use crate::enums::ExtractorKind;
use crate::evaluate::{CelEvaluator, dsl_context, resolve_part};
use crate::primitives::{compile_regex, value_to_string};
use crate::response::ResponseView;
use crate::types::{Extracted, Extractor};

/// Name an extractor's values are stored under when it carries none.
pub fn extractor_display_name(extractor: &Extractor, index: usize) -> String {
    extractor
        .name
        .clone()
        .unwrap_or_else(|| format!("extractor-{}", index + 1))
}

/// Runs every extractor against `view`, in declaration order.
///
/// Each extractor reads its part independently. Captures are appended under
/// the extractor's name in capture order without de-duplication. An extractor
/// that captures nothing leaves no key behind; empty captures are dropped so
/// an empty string never stands in for a missing value.
pub fn evaluate_extractors(
    extractors: &[Extractor],
    view: &ResponseView,
    vars: &Variables,
    cel: Option<&dyn CelEvaluator>,
) -> Extracted {
    let mut out = Extracted::new();
    for (index, extractor) in extractors.iter().enumerate() {
        let name = extractor_display_name(extractor, index);
        for value in evaluate_extractor(extractor, view, vars, cel) {
            if !value.is_empty() {
                out.push(&name, value, extractor.internal);
            }
        }
    }
    out
}

/// Captures of one extractor, in order.
pub fn evaluate_extractor(
    extractor: &Extractor,
    view: &ResponseView,
    vars: &Variables,
    cel: Option<&dyn CelEvaluator>,
) -> Vec<String> {
    match extractor.kind {
        ExtractorKind::Regex => extract_regex(extractor, view),
        ExtractorKind::Kval => extractor
            .kval
            .iter()
            .filter_map(|key| view.kv(key).map(str::to_string))
            .collect(),
        ExtractorKind::Json => extract_json(extractor, view),
        ExtractorKind::Dsl => extract_dsl(extractor, view, vars, cel),
    }
}

fn extract_regex(extractor: &Extractor, view: &ResponseView) -> Vec<String> {
    let Some(data) = resolve_part(extractor.part.as_deref(), view) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&data);
    let group = extractor.group.unwrap_or(0);

    let mut values = Vec::new();
    for pattern in &extractor.regex {
        let re = match compile_regex(pattern, extractor.case_insensitive) {
            Ok(re) => re,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid extractor regex");
                continue;
            }
        };
        for caps in re.captures_iter(&text) {
            if let Some(m) = caps.get(group) {
                values.push(m.as_str().to_string());
            }
        }
    }
    values
}

fn extract_json(extractor: &Extractor, view: &ResponseView) -> Vec<String> {
    let Some(data) = resolve_part(extractor.part.as_deref(), view) else {
        return Vec::new();
    };
    let document: Value = match serde_json::from_slice(&data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "response part is not JSON; json extractor skipped");
            return Vec::new();
        }
    };

    let mut values = Vec::new();
    for selector in &extractor.json {
        let path = match serde_json_path::JsonPath::parse(selector) {
            Ok(p) => p,
            Err(e) => {
                warn!(selector = %selector, error = %e, "invalid JSONPath");
                continue;
            }
        };
        for node in path.query(&document).all() {
            values.push(value_to_string(node));
        }
    }
    values
}

fn extract_dsl(
    extractor: &Extractor,
    view: &ResponseView,
    vars: &Variables,
    cel: Option<&dyn CelEvaluator>,
) -> Vec<String> {
    let Some(cel) = cel else {
        warn!("no expression evaluator configured; dsl extractor skipped");
        return Vec::new();
    };
    let context = dsl_context(view, vars);
    let mut values = Vec::new();
    for expression in &extractor.dsl {
        match cel.evaluate(expression, &context) {
            // Missing references evaluate to `false`; neither is a capture.
            Ok(Value::Null) | Ok(Value::Bool(false)) => {}
            Ok(value) => values.push(value_to_string(&value)),
            Err(e) => warn!(expression = %expression, error = %e, "dsl extractor failed"),
        }
    }
    values
}
