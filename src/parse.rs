use serde_json::{Map, Value};

use crate::error::{ParseError, ParseErrorKind};
use crate::types::Template;

/// Protocol sections accepted at the top level as an alternative to a
/// `requests` list, with the protocol tag each one implies.
const PROTOCOL_SECTIONS: &[(&str, &str)] = &[
    ("http", "http"),
    ("dns", "dns"),
    ("network", "network"),
    ("tcp", "network"),
];

/// Hyphenated spellings accepted for underscore-named fields.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("matchers-condition", "matchers_condition"),
    ("stop-at-first-match", "stop_at_first_match"),
    ("case-insensitive", "case_insensitive"),
    ("read-size", "read_size"),
    ("on-extract", "on_extract"),
];

/// Fields whose keys are user data and must be left untouched.
const OPAQUE_FIELDS: &[&str] = &["headers", "variables", "metadata"];

/// Parse one YAML document into an unvalidated Template.
///
/// Performs YAML deserialization and type mapping only. Does NOT validate the
/// template or apply normalization. Top-level `http`, `dns`, `network` (or
/// `tcp`) lists are folded into `requests` with the matching protocol tag.
pub fn parse(input: &str) -> Result<Template, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError {
            kind: ParseErrorKind::Syntax,
            message: "empty input".to_string(),
            path: None,
        });
    }

    check_multi_document(input)?;

    // YAML → serde_json::Value → Template, so key rewriting happens on a
    // plain tree.
    let value: Value = serde_saphyr::from_str(input).map_err(|e| {
        let msg = e.to_string();
        ParseError {
            kind: classify_saphyr_error(&msg),
            message: msg,
            path: None,
        }
    })?;

    let Value::Object(mut root) = value else {
        return Err(ParseError {
            kind: ParseErrorKind::TypeMismatch,
            message: "template root must be a YAML mapping".to_string(),
            path: None,
        });
    };

    fold_protocol_sections(&mut root)?;
    let mut value = Value::Object(root);
    rewrite_aliases(&mut value);

    serde_json::from_value(value).map_err(|e| {
        let msg = e.to_string();
        ParseError {
            kind: classify_json_error(&msg),
            message: msg,
            path: None,
        }
    })
}

fn fold_protocol_sections(root: &mut Map<String, Value>) -> Result<(), ParseError> {
    let mut folded: Vec<Value> = Vec::new();
    for (section, protocol) in PROTOCOL_SECTIONS {
        let Some(entries) = root.remove(*section) else {
            continue;
        };
        let Value::Array(entries) = entries else {
            return Err(ParseError {
                kind: ParseErrorKind::TypeMismatch,
                message: format!("'{}' must be a list of request blocks", section),
                path: Some(section.to_string()),
            });
        };
        for (i, entry) in entries.into_iter().enumerate() {
            let Value::Object(mut block) = entry else {
                return Err(ParseError {
                    kind: ParseErrorKind::TypeMismatch,
                    message: "request block must be a mapping".to_string(),
                    path: Some(format!("{}[{}]", section, i)),
                });
            };
            block.insert("protocol".to_string(), Value::String(protocol.to_string()));
            folded.push(Value::Object(block));
        }
    }
    if folded.is_empty() {
        return Ok(());
    }

    match root.get_mut("requests") {
        Some(Value::Array(existing)) => existing.extend(folded),
        Some(_) => {
            return Err(ParseError {
                kind: ParseErrorKind::TypeMismatch,
                message: "'requests' must be a list of request blocks".to_string(),
                path: Some("requests".to_string()),
            });
        }
        None => {
            root.insert("requests".to_string(), Value::Array(folded));
        }
    }
    Ok(())
}

fn rewrite_aliases(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let renames: Vec<(String, &str)> = map
                .keys()
                .filter_map(|k| {
                    KEY_ALIASES
                        .iter()
                        .find(|(alias, _)| alias == k)
                        .map(|(_, canonical)| (k.clone(), *canonical))
                })
                .collect();
            for (alias, canonical) in renames {
                if let Some(v) = map.remove(&alias) {
                    map.entry(canonical.to_string()).or_insert(v);
                }
            }
            for (key, child) in map.iter_mut() {
                if !OPAQUE_FIELDS.contains(&key.as_str()) {
                    rewrite_aliases(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(rewrite_aliases),
        _ => {}
    }
}

/// Check for multiple YAML documents (--- separator).
/// Only matches `---` at column 0 to avoid false positives inside block scalars.
fn check_multi_document(input: &str) -> Result<(), ParseError> {
    let mut doc_count = 0;
    for line in input.lines() {
        if line.starts_with("---") && line[3..].trim().is_empty() {
            doc_count += 1;
            if doc_count > 1 {
                return Err(ParseError {
                    kind: ParseErrorKind::Syntax,
                    message: "multi-document YAML is not supported; load one template per document"
                        .to_string(),
                    path: None,
                });
            }
        }
    }
    Ok(())
}

fn classify_saphyr_error(msg: &str) -> ParseErrorKind {
    let lower = msg.to_lowercase();
    if lower.contains("unknown") || lower.contains("variant") {
        ParseErrorKind::UnknownVariant
    } else if lower.contains("type") || lower.contains("invalid") || lower.contains("expected") {
        ParseErrorKind::TypeMismatch
    } else {
        ParseErrorKind::Syntax
    }
}

fn classify_json_error(msg: &str) -> ParseErrorKind {
    let lower = msg.to_lowercase();
    if lower.contains("unknown variant") || lower.contains("unknown field") {
        ParseErrorKind::UnknownVariant
    } else if lower.contains("missing field") || lower.contains("invalid type") {
        ParseErrorKind::TypeMismatch
    } else {
        ParseErrorKind::Syntax
    }
}
