//! Template validation.
//!
//! Returns **all** errors and warnings, not just the first. Validation does not
//! modify the template. [`validate`] checks one template in isolation;
//! [`validate_set`] checks what only makes sense across a loaded set (unique
//! IDs, workflow references).

use regex::{Regex, RegexBuilder};
use serde_json_path::JsonPath;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::enums::*;
use crate::error::*;
use crate::parts::is_known_part;
use crate::primitives::{decode_hex, is_valid_placeholder_name, placeholders};
use crate::types::*;

// ─── Cached regexes ─────────────────────────────────────────────────────────

static TEMPLATE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").unwrap());

/// Validate one parsed template. Returns a ValidationResult containing all
/// errors and warnings found.
pub fn validate(template: &Template) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    template_id(template, &mut errors);
    template_body(template, &mut errors);
    template_variables(template, &mut errors);
    for (i, block) in template.requests.iter().enumerate() {
        let path = format!("requests[{}]", i);
        request_payload(block, &path, &mut errors);
        matchers(block, &path, &mut errors, &mut warnings);
        extractors(block, &path, &mut errors, &mut warnings);
    }
    workflow_steps(&template.workflows, "workflows", &mut errors);

    ValidationResult { errors, warnings }
}

/// Validate a set of templates together: each template on its own, then
/// ID uniqueness and workflow references across the set.
pub fn validate_set(templates: &[Template]) -> ValidationResult {
    let mut result = ValidationResult::default();
    for template in templates {
        let single = validate(template);
        result.errors.extend(single.errors);
        result.warnings.extend(single.warnings);
    }
    unique_ids(templates, &mut result.errors);
    workflow_references(templates, &mut result.errors, &mut result.warnings);
    result
}

fn error(rule: &str, path: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        path: path.into(),
        message: message.into(),
    }
}

fn warning(code: &str, path: impl Into<String>, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        severity: DiagnosticSeverity::Warning,
        code: code.to_string(),
        path: Some(path.into()),
        message: message.into(),
    }
}

// ─── template id ────────────────────────────────────────────────────────────

fn template_id(template: &Template, errors: &mut Vec<ValidationError>) {
    if template.id.trim().is_empty() {
        errors.push(error("template-id", "id", "template id must not be empty"));
    } else if !TEMPLATE_ID_RE.is_match(&template.id) {
        errors.push(error(
            "template-id",
            "id",
            format!(
                "template id '{}' may only contain letters, digits, '.', '_' and '-'",
                template.id
            ),
        ));
    }
}

// ─── template body ──────────────────────────────────────────────────────────

fn template_body(template: &Template, errors: &mut Vec<ValidationError>) {
    let has_code = template.code.as_deref().is_some_and(|c| !c.trim().is_empty());
    match (template.requests.is_empty(), template.workflows.is_empty()) {
        (false, false) => errors.push(error(
            "template-body",
            "",
            "a template defines either request blocks or workflow steps, not both",
        )),
        (true, true) if !has_code => errors.push(error(
            "template-body",
            "",
            "template defines no request blocks, workflow steps or code",
        )),
        _ => {}
    }
}

// ─── template variables ─────────────────────────────────────────────────────

fn template_variables(template: &Template, errors: &mut Vec<ValidationError>) {
    for (name, value) in &template.variables {
        let path = format!("variables.{}", name);
        if !is_valid_placeholder_name(name) {
            errors.push(error(
                "placeholder-syntax",
                path.clone(),
                format!("'{}' is not a valid variable name", name),
            ));
        }
        if let Some(text) = value.as_str() {
            check_placeholders(text, &path, errors);
        }
    }
}

// ─── request payloads ───────────────────────────────────────────────────────

fn request_payload(block: &RequestBlock, path: &str, errors: &mut Vec<ValidationError>) {
    match &block.request {
        ProtocolRequest::Http(http) => {
            if let Some(method) = &http.method
                && (method.trim().is_empty()
                    || !method.bytes().all(|b| b.is_ascii_alphabetic()))
            {
                errors.push(error(
                    "http-method",
                    format!("{}.method", path),
                    format!("'{}' is not a valid HTTP method", method),
                ));
            }
            if !http.path.is_empty() && !http.raw.is_empty() {
                errors.push(error(
                    "http-request",
                    path,
                    "'path' and 'raw' are mutually exclusive",
                ));
            }
            for (i, p) in http.path.iter().enumerate() {
                check_placeholders(p, &format!("{}.path[{}]", path, i), errors);
            }
            for (name, value) in &http.headers {
                check_placeholders(value, &format!("{}.headers.{}", path, name), errors);
            }
            if let Some(body) = &http.body {
                check_placeholders(body, &format!("{}.body", path), errors);
            }
            for (i, raw) in http.raw.iter().enumerate() {
                let raw_path = format!("{}.raw[{}]", path, i);
                if raw.trim().is_empty() {
                    errors.push(error("http-request", raw_path.clone(), "raw request is empty"));
                }
                check_placeholders(raw, &raw_path, errors);
            }
        }
        ProtocolRequest::Dns(dns) => {
            if let Some(name) = &dns.name {
                if name.trim().is_empty() {
                    errors.push(error("dns-name", format!("{}.name", path), "query name is empty"));
                }
                check_placeholders(name, &format!("{}.name", path), errors);
            }
            if let Some(resolver) = &dns.resolver {
                check_placeholders(resolver, &format!("{}.resolver", path), errors);
            }
        }
        ProtocolRequest::Network(net) => {
            for (i, host) in net.host.iter().enumerate() {
                let host_path = format!("{}.host[{}]", path, i);
                if host.trim_start().to_ascii_lowercase().starts_with("tls://") {
                    errors.push(error(
                        "network-host",
                        host_path.clone(),
                        "TLS network requests are not supported",
                    ));
                }
                check_placeholders(host, &host_path, errors);
            }
            if net.read_size == Some(0) {
                errors.push(error(
                    "network-read",
                    format!("{}.read_size", path),
                    "read_size must be greater than zero",
                ));
            }
            for (i, input) in net.inputs.iter().enumerate() {
                let input_path = format!("{}.inputs[{}]", path, i);
                check_placeholders(&input.data, &input_path, errors);
                // Hex inputs carrying placeholders are checked once rendered.
                if input.encoding == Some(InputEncoding::Hex)
                    && !input.data.contains("{{")
                    && let Err(e) = decode_hex(&input.data)
                {
                    errors.push(error("hex", format!("{}.data", input_path), e.to_string()));
                }
            }
        }
    }
}

// ─── placeholder syntax ─────────────────────────────────────────────────────

fn check_placeholders(text: &str, path: &str, errors: &mut Vec<ValidationError>) {
    for name in placeholders(text) {
        if !is_valid_placeholder_name(&name) {
            errors.push(error(
                "placeholder-syntax",
                path,
                format!("invalid placeholder '{{{{{}}}}}'", name),
            ));
        }
    }
}

// ─── matchers ───────────────────────────────────────────────────────────────

fn matchers(
    block: &RequestBlock,
    path: &str,
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<Diagnostic>,
) {
    let protocol = block.protocol();
    for (i, matcher) in block.matchers.iter().enumerate() {
        let m_path = format!("{}.matchers[{}]", path, i);
        if matcher.condition_count() == 0 {
            warnings.push(warning(
                "matcher-empty",
                m_path.clone(),
                "matcher has no conditions for its type and never fires",
            ));
        }
        if let Some(part) = &matcher.part {
            check_part(block, protocol, part, &m_path, errors);
        }
        match matcher.kind {
            MatcherKind::Regex => {
                for (j, pattern) in matcher.regex.iter().enumerate() {
                    check_regex(
                        pattern,
                        matcher.case_insensitive,
                        &format!("{}.regex[{}]", m_path, j),
                        errors,
                    );
                }
            }
            MatcherKind::Binary => {
                for (j, pattern) in matcher.binary.iter().enumerate() {
                    if let Err(e) = decode_hex(pattern) {
                        errors.push(error("hex", format!("{}.binary[{}]", m_path, j), e.to_string()));
                    }
                }
            }
            MatcherKind::Status => {
                for (j, code) in matcher.status.iter().enumerate() {
                    if !(0..=999).contains(code) {
                        errors.push(error(
                            "matcher-status",
                            format!("{}.status[{}]", m_path, j),
                            format!("status {} is out of range", code),
                        ));
                    }
                }
            }
            MatcherKind::Dsl => {
                for (j, expr) in matcher.dsl.iter().enumerate() {
                    check_cel(expr, &format!("{}.dsl[{}]", m_path, j), errors);
                }
            }
            MatcherKind::Word | MatcherKind::Size => {}
        }
    }
}

// ─── extractors ─────────────────────────────────────────────────────────────

fn extractors(
    block: &RequestBlock,
    path: &str,
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<Diagnostic>,
) {
    let protocol = block.protocol();
    for (i, extractor) in block.extractors.iter().enumerate() {
        let e_path = format!("{}.extractors[{}]", path, i);
        if let Some(name) = &extractor.name
            && !is_valid_placeholder_name(name)
        {
            errors.push(error(
                "extractor-name",
                format!("{}.name", e_path),
                format!("'{}' cannot be referenced as a placeholder", name),
            ));
        }
        if extractor.internal && extractor.name.is_none() {
            warnings.push(warning(
                "extractor-internal-unnamed",
                e_path.clone(),
                "internal extractor has no name; later steps can only use its generated name",
            ));
        }
        if let Some(part) = &extractor.part {
            check_part(block, protocol, part, &e_path, errors);
        }
        match extractor.kind {
            ExtractorKind::Regex => {
                if extractor.regex.is_empty() {
                    errors.push(error("extractor-config", e_path.clone(), "regex extractor has no patterns"));
                }
                for (j, pattern) in extractor.regex.iter().enumerate() {
                    let r_path = format!("{}.regex[{}]", e_path, j);
                    let Some(re) = check_regex(pattern, extractor.case_insensitive, &r_path, errors)
                    else {
                        continue;
                    };
                    let group = extractor.group.unwrap_or(0);
                    if group >= re.captures_len() {
                        errors.push(error(
                            "extractor-config",
                            format!("{}.group", e_path),
                            format!("pattern has no capture group {}", group),
                        ));
                    }
                }
            }
            ExtractorKind::Kval => {
                if extractor.kval.is_empty() {
                    errors.push(error("extractor-config", e_path.clone(), "kval extractor has no keys"));
                }
            }
            ExtractorKind::Json => {
                if extractor.json.is_empty() {
                    errors.push(error("extractor-config", e_path.clone(), "json extractor has no paths"));
                }
                for (j, query) in extractor.json.iter().enumerate() {
                    if let Err(e) = JsonPath::parse(query) {
                        errors.push(error(
                            "jsonpath",
                            format!("{}.json[{}]", e_path, j),
                            format!("invalid JSONPath '{}': {}", query, e),
                        ));
                    }
                }
            }
            ExtractorKind::Dsl => {
                if extractor.dsl.is_empty() {
                    errors.push(error("extractor-config", e_path.clone(), "dsl extractor has no expressions"));
                }
                for (j, expr) in extractor.dsl.iter().enumerate() {
                    check_cel(expr, &format!("{}.dsl[{}]", e_path, j), errors);
                }
            }
        }
    }
}

// ─── shared checks ──────────────────────────────────────────────────────────

fn check_part(
    block: &RequestBlock,
    protocol: Protocol,
    part: &str,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if is_known_part(protocol, part) {
        return;
    }
    // Named network inputs expose their read-back under the input name.
    if let ProtocolRequest::Network(net) = &block.request
        && net.inputs.iter().any(|i| i.name.as_deref() == Some(part))
    {
        return;
    }
    errors.push(error(
        "part",
        format!("{}.part", path),
        format!("'{}' is not a {} response part", part, protocol),
    ));
}

fn check_regex(
    pattern: &str,
    case_insensitive: bool,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            errors.push(error("regex", path, format!("invalid regex: {}", e)));
            None
        }
    }
}

#[cfg(feature = "cel-eval")]
fn check_cel(expr: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if let Err(e) = cel::Program::compile(expr) {
        errors.push(error("cel", path, format!("invalid CEL expression: {}", e)));
    }
}

#[cfg(not(feature = "cel-eval"))]
fn check_cel(expr: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if expr.trim().is_empty() {
        errors.push(error("cel", path, "empty expression"));
    }
}

// ─── workflow steps ─────────────────────────────────────────────────────────

fn workflow_steps(steps: &[WorkflowStep], path: &str, errors: &mut Vec<ValidationError>) {
    for (i, step) in steps.iter().enumerate() {
        let s_path = format!("{}[{}]", path, i);
        if step.template.trim().is_empty() {
            errors.push(error(
                "workflow-step",
                format!("{}.template", s_path),
                "workflow step names no template",
            ));
        }
        workflow_steps(&step.subtemplates, &format!("{}.subtemplates", s_path), errors);
        workflow_steps(&step.on_extract, &format!("{}.on_extract", s_path), errors);
        for (j, branch) in step.matchers.iter().enumerate() {
            let b_path = format!("{}.matchers[{}]", s_path, j);
            if branch.name.trim().is_empty() {
                errors.push(error(
                    "workflow-step",
                    format!("{}.name", b_path),
                    "matcher branch has no matcher name",
                ));
            }
            workflow_steps(&branch.subtemplates, &format!("{}.subtemplates", b_path), errors);
        }
    }
}

// ─── template set: unique ids ───────────────────────────────────────────────

fn unique_ids(templates: &[Template], errors: &mut Vec<ValidationError>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (i, template) in templates.iter().enumerate() {
        if let Some(first) = seen.insert(template.id.as_str(), i) {
            errors.push(error(
                "unique-id",
                format!("templates[{}].id", i),
                format!(
                    "duplicate template id '{}' (first defined at templates[{}])",
                    template.id, first
                ),
            ));
            // Keep pointing at the first definition.
            seen.insert(template.id.as_str(), first);
        }
    }
}

// ─── template set: workflow references ──────────────────────────────────────

fn workflow_references(
    templates: &[Template],
    errors: &mut Vec<ValidationError>,
    warnings: &mut Vec<Diagnostic>,
) {
    let kinds: HashMap<&str, TemplateKind> =
        templates.iter().map(|t| (t.id.as_str(), t.kind())).collect();

    for (i, template) in templates.iter().enumerate() {
        let mut refs: Vec<(String, &str)> = Vec::new();
        collect_refs(&template.workflows, &format!("templates[{}].workflows", i), &mut refs);
        for (path, target) in refs {
            match kinds.get(target) {
                None => errors.push(error(
                    "workflow-reference",
                    path,
                    format!("workflow '{}' references unknown template '{}'", template.id, target),
                )),
                Some(_) if target == template.id => errors.push(error(
                    "workflow-reference",
                    path,
                    format!("workflow '{}' references itself", template.id),
                )),
                Some(TemplateKind::Template) => {}
                Some(_) => warnings.push(warning(
                    "workflow-nested",
                    path,
                    format!(
                        "workflow '{}' step '{}' is not a plain template; the step is skipped at run time",
                        template.id, target
                    ),
                )),
            }
        }
    }
}

fn collect_refs<'a>(steps: &'a [WorkflowStep], path: &str, out: &mut Vec<(String, &'a str)>) {
    for (i, step) in steps.iter().enumerate() {
        let s_path = format!("{}[{}]", path, i);
        out.push((format!("{}.template", s_path), step.template.as_str()));
        collect_refs(&step.subtemplates, &format!("{}.subtemplates", s_path), out);
        collect_refs(&step.on_extract, &format!("{}.on_extract", s_path), out);
        for (j, branch) in step.matchers.iter().enumerate() {
            collect_refs(
                &branch.subtemplates,
                &format!("{}.matchers[{}].subtemplates", s_path, j),
                out,
            );
        }
    }
}
