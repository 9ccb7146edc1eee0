//! Match Expression Evaluator.
//!
//! Given the matchers of one Request Block and the Response View of one
//! exchange, decides which matchers fired and whether the block-level
//! condition holds. Evaluation is pure and never branches on protocol: every
//! condition reads a named part of the view.

use crate::context::Variables;
use crate::enums::*;
use crate::error::ExecError;
use crate::parts::{default_part, is_known_part};
use crate::primitives::{compile_regex, decode_hex};
use crate::response::ResponseView;
use crate::types::Matcher;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::warn;

#[cfg(feature = "cel-eval")]
use std::collections::HashMap;

static CEL_IDENT_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

// ─── CelEvaluator ───────────────────────────────────────────────────────────

/// Extension point for `dsl` matcher and extractor expressions.
///
/// `context` is a JSON object where each key is a variable name available in
/// the expression. See [`dsl_context`] for what the engine puts there.
pub trait CelEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExecError>;
}

/// Default CEL evaluator backed by the `cel` crate.
#[cfg(feature = "cel-eval")]
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCelEvaluator;

/// Convenience constructor for [`DefaultCelEvaluator`].
#[cfg(feature = "cel-eval")]
pub fn default_cel_evaluator() -> DefaultCelEvaluator {
    DefaultCelEvaluator
}

#[cfg(feature = "cel-eval")]
impl CelEvaluator for DefaultCelEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExecError> {
        let program = cel::Program::compile(expression)
            .map_err(|e| ExecError::config(format!("CEL compile error in '{}': {}", expression, e)))?;

        let mut cel_ctx = cel::Context::default();
        if let Value::Object(map) = context {
            for (key, value) in map {
                cel_ctx.add_variable_from_value(key.as_str(), json_to_cel(value));
            }
        }

        match program.execute(&cel_ctx) {
            Ok(result) => Ok(cel_to_json(&result)),
            // A reference to something the response does not carry is a
            // non-match, not a failure.
            Err(cel::ExecutionError::NoSuchKey(_)) => Ok(Value::Bool(false)),
            Err(cel::ExecutionError::UndeclaredReference(_)) => Ok(Value::Bool(false)),
            Err(e) => Err(ExecError::config(format!(
                "CEL execution error in '{}': {}",
                expression, e
            ))),
        }
    }
}

#[cfg(feature = "cel-eval")]
fn json_to_cel(value: &Value) -> cel::Value {
    use std::sync::Arc;

    match value {
        Value::Null => cel::Value::Null,
        Value::Bool(b) => cel::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                cel::Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                cel::Value::UInt(u)
            } else if let Some(f) = n.as_f64() {
                cel::Value::Float(f)
            } else {
                cel::Value::Null
            }
        }
        Value::String(s) => cel::Value::String(Arc::new(s.clone())),
        Value::Array(arr) => {
            let items: Vec<cel::Value> = arr.iter().map(json_to_cel).collect();
            cel::Value::List(Arc::new(items))
        }
        Value::Object(map) => {
            let entries: HashMap<String, cel::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_cel(v)))
                .collect();
            entries.into()
        }
    }
}

#[cfg(feature = "cel-eval")]
fn cel_to_json(value: &cel::Value) -> Value {
    match value {
        cel::Value::Null => Value::Null,
        cel::Value::Bool(b) => Value::Bool(*b),
        cel::Value::Int(i) => Value::Number((*i).into()),
        cel::Value::UInt(u) => Value::Number((*u).into()),
        cel::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        cel::Value::String(s) => Value::String(s.to_string()),
        cel::Value::List(l) => Value::Array(l.iter().map(cel_to_json).collect()),
        cel::Value::Map(m) => {
            let mut obj = serde_json::Map::new();
            for (key, val) in m.map.iter() {
                let k = match key {
                    cel::objects::Key::String(s) => s.to_string(),
                    cel::objects::Key::Int(i) => i.to_string(),
                    cel::objects::Key::Uint(u) => u.to_string(),
                    cel::objects::Key::Bool(b) => b.to_string(),
                };
                obj.insert(k, cel_to_json(val));
            }
            Value::Object(obj)
        }
        _ => Value::Null,
    }
}

/// Builds the variable map a DSL expression sees.
///
/// Current bindings come first (first value of each, identifier-safe names
/// only), then key/value pairs, then every response part as text, then
/// `status_code`, `content_length` and `duration` (seconds). Later entries
/// shadow earlier ones.
pub fn dsl_context(view: &ResponseView, vars: &Variables) -> Value {
    let mut map = Map::new();
    for (name, values) in vars.iter() {
        if !CEL_IDENT_RE.is_match(name) {
            continue;
        }
        if let Some(first) = values.first() {
            map.insert(name.to_string(), Value::String(first.clone()));
        }
    }
    for (key, value) in view.kv_pairs() {
        if CEL_IDENT_RE.is_match(key) {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    for (name, data) in view.parts() {
        map.insert(
            name.to_string(),
            Value::String(String::from_utf8_lossy(data).into_owned()),
        );
    }
    if let Some(status) = view.status {
        map.insert("status_code".to_string(), Value::from(status));
    }
    map.insert("content_length".to_string(), Value::from(view.length() as u64));
    map.insert(
        "duration".to_string(),
        serde_json::Number::from_f64(view.elapsed.as_secs_f64())
            .map(Value::Number)
            .unwrap_or(Value::Null),
    );
    Value::Object(map)
}

// ─── Matchers ───────────────────────────────────────────────────────────────

/// Outcome of evaluating one Request Block's matchers against one response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Block-level verdict.
    pub fired: bool,
    /// Names of the matchers that fired, in declaration order.
    pub matched_names: Vec<String>,
}

/// Name reported for the matcher at `index` when it carries none.
pub fn matcher_display_name(matcher: &Matcher, index: usize) -> String {
    matcher
        .name
        .clone()
        .unwrap_or_else(|| format!("matcher-{}", index + 1))
}

/// Evaluates every matcher in declaration order and folds the results with
/// the block-level `condition`.
///
/// All matchers are evaluated even when the verdict is already decided, so
/// `matched_names` is complete. A block without matchers never fires.
pub fn evaluate_matchers(
    matchers: &[Matcher],
    condition: Condition,
    view: &ResponseView,
    vars: &Variables,
    cel: Option<&dyn CelEvaluator>,
) -> MatchOutcome {
    let mut results = Vec::with_capacity(matchers.len());
    let mut matched_names = Vec::new();
    for (index, matcher) in matchers.iter().enumerate() {
        let fired = evaluate_matcher(matcher, view, vars, cel);
        if fired {
            matched_names.push(matcher_display_name(matcher, index));
        }
        results.push(fired);
    }
    MatchOutcome {
        fired: condition.combine(results),
        matched_names,
    }
}

/// Evaluates a single matcher.
///
/// A matcher with no conditions, or one reading a part its protocol does not
/// expose, never fires, whatever its `negative` flag says. Otherwise
/// `negative` inverts the matcher's own combined result.
pub fn evaluate_matcher(
    matcher: &Matcher,
    view: &ResponseView,
    vars: &Variables,
    cel: Option<&dyn CelEvaluator>,
) -> bool {
    if matcher.condition_count() == 0 {
        return false;
    }

    let results: Vec<bool> = match matcher.kind {
        MatcherKind::Status => match view.status {
            Some(code) => matcher.status.iter().map(|s| *s == code).collect(),
            None => vec![false; matcher.status.len()],
        },
        MatcherKind::Dsl => {
            let context = dsl_context(view, vars);
            matcher
                .dsl
                .iter()
                .map(|expr| dsl_is_true(expr, &context, cel))
                .collect()
        }
        MatcherKind::Word => {
            let Some(data) = resolve_part(matcher.part.as_deref(), view) else {
                return false;
            };
            let text = String::from_utf8_lossy(&data);
            let haystack = fold_case(&text, matcher.case_insensitive);
            matcher
                .words
                .iter()
                .map(|word| haystack.contains(&*fold_case(word, matcher.case_insensitive)))
                .collect()
        }
        MatcherKind::Regex => {
            let Some(data) = resolve_part(matcher.part.as_deref(), view) else {
                return false;
            };
            let text = String::from_utf8_lossy(&data);
            matcher
                .regex
                .iter()
                .map(|pattern| {
                    match compile_regex(pattern, matcher.case_insensitive) {
                        Ok(re) => re.is_match(&text),
                        Err(e) => {
                            warn!(pattern = %pattern, error = %e, "invalid matcher regex");
                            false
                        }
                    }
                })
                .collect()
        }
        MatcherKind::Binary => {
            let Some(data) = resolve_part(matcher.part.as_deref(), view) else {
                return false;
            };
            matcher
                .binary
                .iter()
                .map(|pattern| match decode_hex(pattern) {
                    Ok(needle) => contains_bytes(&data, &needle),
                    Err(e) => {
                        warn!(error = %e, "invalid binary matcher pattern");
                        false
                    }
                })
                .collect()
        }
        MatcherKind::Size => {
            let Some(data) = resolve_part(matcher.part.as_deref(), view) else {
                return false;
            };
            matcher.size.iter().map(|s| *s == data.len()).collect()
        }
    };

    let combined = matcher.condition.combine(results);
    combined != matcher.negative
}

/// Reads the bytes a matcher or extractor targets.
///
/// Parts present on the view win (network inputs expose their read-back under
/// the input name). A part the protocol knows but this exchange lacks, such as
/// an interaction part with no callback, reads as empty. Anything else is a
/// configuration error: it is logged and `None` is returned.
pub(crate) fn resolve_part<'a>(part: Option<&str>, view: &'a ResponseView) -> Option<Cow<'a, [u8]>> {
    let name = part.unwrap_or_else(|| default_part(view.protocol));
    if let Some(data) = view.part(name) {
        return Some(Cow::Borrowed(data));
    }
    if is_known_part(view.protocol, name) {
        return Some(Cow::Owned(Vec::new()));
    }
    warn!(
        part = name,
        protocol = %view.protocol,
        "unknown response part; condition skipped"
    );
    None
}

fn fold_case(text: &str, insensitive: bool) -> Cow<'_, str> {
    if insensitive {
        Cow::Owned(text.to_lowercase())
    } else {
        Cow::Borrowed(text)
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn dsl_is_true(expression: &str, context: &Value, cel: Option<&dyn CelEvaluator>) -> bool {
    let Some(cel) = cel else {
        warn!(expression, "no expression evaluator configured; dsl condition skipped");
        return false;
    };
    match cel.evaluate(expression, context) {
        Ok(Value::Bool(b)) => b,
        Ok(_) => false,
        Err(e) => {
            warn!(expression, error = %e, "dsl condition failed");
            false
        }
    }
}
