//! Shared utility operations used by the executors, evaluators and runner.

use rand::Rng;
use rand::distr::Alphanumeric;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use crate::context::Variables;
use crate::error::ExecError;

static PLACEHOLDER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap());

/// Patterns compiled by matchers and extractors, keyed by (pattern, case flag).
static REGEX_CACHE: LazyLock<RwLock<HashMap<(String, bool), Regex>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Upper bound on cached patterns; past it, patterns are compiled per call.
const REGEX_CACHE_LIMIT: usize = 4096;

// ─── compile_regex ──────────────────────────────────────────────────────────

/// Compiles `pattern`, reusing an earlier compilation of the same pattern and
/// case flag. Invalid patterns are never cached.
pub fn compile_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    let key = (pattern.to_string(), case_insensitive);
    if let Ok(cache) = REGEX_CACHE.read() {
        if let Some(re) = cache.get(&key) {
            return Ok(re.clone());
        }
    }
    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()?;
    if let Ok(mut cache) = REGEX_CACHE.write() {
        if cache.len() < REGEX_CACHE_LIMIT {
            cache.insert(key, re.clone());
        }
    }
    Ok(re)
}

// ─── interpolate ────────────────────────────────────────────────────────────

/// Stand-in for an escaped `\{{` while placeholders are scanned.
const ESCAPED_OPEN: &str = "\x00ESCAPED_OPEN_BRACE\x00";

/// Substitutes `{{name}}` placeholders with the first value bound to `name`.
///
/// `\{{` escapes a literal `{{`. An unclosed `{{` passes through unchanged.
/// Any placeholder without a binding makes the whole string unresolvable and
/// yields a configuration error listing every missing name.
pub fn interpolate(template: &str, vars: &Variables) -> Result<String, ExecError> {
    let working = template.replace("\\{{", ESCAPED_OPEN);

    let mut result = String::with_capacity(working.len());
    let mut missing: Vec<String> = Vec::new();
    let mut remaining = working.as_str();

    while let Some(start) = remaining.find("{{") {
        result.push_str(&remaining[..start]);
        let after_open = &remaining[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                match vars.first(name) {
                    Some(value) => result.push_str(value),
                    None => {
                        if !missing.iter().any(|m| m == name) {
                            missing.push(name.to_string());
                        }
                    }
                }
                remaining = &after_open[end + 2..];
            }
            None => {
                result.push_str("{{");
                remaining = after_open;
            }
        }
    }
    result.push_str(remaining);

    if !missing.is_empty() {
        return Err(ExecError::config(format!(
            "unresolved placeholder(s): {}",
            missing
                .iter()
                .map(|m| format!("{{{{{}}}}}", m))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(result.replace(ESCAPED_OPEN, "{{"))
}

/// Lists the placeholder names referenced by `template`, in order of first
/// appearance. Escaped and unclosed openers are ignored.
pub fn placeholders(template: &str) -> Vec<String> {
    let working = template.replace("\\{{", ESCAPED_OPEN);
    let mut names: Vec<String> = Vec::new();
    let mut remaining = working.as_str();
    while let Some(start) = remaining.find("{{") {
        let after_open = &remaining[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        let name = after_open[..end].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        remaining = &after_open[end + 2..];
    }
    names
}

/// Whether a placeholder name is syntactically valid.
pub fn is_valid_placeholder_name(name: &str) -> bool {
    PLACEHOLDER_NAME_RE.is_match(name)
}

// ─── target bindings ────────────────────────────────────────────────────────

/// Derives the built-in bindings for a target string.
///
/// Targets without a scheme are read as `http://`. Bare hosts and IPs work;
/// a target that cannot be parsed at all still binds `Input`.
pub fn target_bindings(target: &str) -> Vec<(String, String)> {
    let mut out = vec![("Input".to_string(), target.to_string())];
    let with_scheme = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    };

    let Ok(parsed) = url::Url::parse(&with_scheme) else {
        return out;
    };
    let Some(host) = parsed.host_str() else {
        return out;
    };
    let scheme = parsed.scheme().to_string();
    let port = parsed
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();
    let hostname = match parsed.port() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    };
    let root_url = match parsed.port() {
        Some(p) => format!("{}://{}:{}", scheme, host, p),
        None => format!("{}://{}", scheme, host),
    };
    let path = parsed.path().trim_end_matches('/').to_string();
    let base_url = format!("{}{}", root_url, path);

    out.push(("BaseURL".to_string(), base_url));
    out.push(("RootURL".to_string(), root_url));
    out.push(("Hostname".to_string(), hostname));
    out.push(("Host".to_string(), host.to_string()));
    out.push(("Port".to_string(), port));
    out.push(("Path".to_string(), path));
    out.push(("Scheme".to_string(), scheme));
    out.push(("FQDN".to_string(), host.trim_matches(['[', ']']).to_string()));
    out
}

// ─── encodings ──────────────────────────────────────────────────────────────

/// Decodes a hex pattern, tolerating whitespace between byte pairs.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, ExecError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|e| ExecError::config(format!("invalid hex pattern '{}': {}", input, e)))
}

/// Serialize a JSON value: scalars to their natural text, others to compact JSON.
pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(v).unwrap_or_default(),
    }
}

/// A random alphanumeric token, lower-cased so it survives DNS labels.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

// ─── retry backoff ──────────────────────────────────────────────────────────

/// Exponential backoff for the given attempt (1-based), capped at `max_ms`.
pub fn exponential_backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let factor = 1u64 << shift;
    let mut delay = base_ms.saturating_mul(factor);
    if delay == 0 {
        delay = base_ms;
    }
    Duration::from_millis(delay.min(max_ms))
}

// ─── raw HTTP ───────────────────────────────────────────────────────────────

/// A raw HTTP request split into its components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawHttpRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl RawHttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses `METHOD path HTTP/x` + headers + optional body. Both `\r\n` and
/// `\n` line endings are accepted; leading blank lines are skipped.
pub fn parse_raw_http(raw: &str) -> Result<RawHttpRequest, ExecError> {
    let normalized = raw.replace("\r\n", "\n");
    let text = normalized.trim_start_matches('\n');
    let (head, body) = match text.find("\n\n") {
        Some(pos) => (&text[..pos], Some(&text[pos + 2..])),
        None => (text, None),
    };

    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ExecError::config("empty raw request"))?;
    let mut fields = request_line.split_whitespace();
    let method = fields
        .next()
        .ok_or_else(|| ExecError::config("raw request is missing a method"))?;
    let path = fields
        .next()
        .ok_or_else(|| ExecError::config("raw request is missing a path"))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ExecError::config(format!("malformed raw header line '{}'", line)))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    let body = body
        .map(|b| b.trim_end_matches('\n').to_string())
        .filter(|b| !b.is_empty());

    Ok(RawHttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        body,
    })
}
