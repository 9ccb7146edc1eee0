use crate::enums::*;
use crate::evaluate::matcher_display_name;
use crate::extract::extractor_display_name;
use crate::parts::default_part;
use crate::types::*;

/// Normalize a validated template into its fully-expanded form.
/// Every default the engine would otherwise infer at run time is
/// materialized, so reports and serialized templates show what actually runs.
///
/// This is idempotent: `normalize(normalize(t)) == normalize(t)`.
pub fn normalize(mut template: Template) -> Template {
    for block in template.requests.iter_mut() {
        let protocol = block.protocol();
        request_defaults(&mut block.request);
        matcher_defaults(&mut block.matchers, protocol);
        extractor_defaults(&mut block.extractors, protocol);
    }
    template
}

// ─── Request payload defaults ───────────────────────────────────────────────

fn request_defaults(request: &mut ProtocolRequest) {
    match request {
        ProtocolRequest::Http(http) => {
            // method → GET, upper-cased
            let method = http.method.as_deref().unwrap_or("GET").trim().to_ascii_uppercase();
            http.method = Some(method);
            // path → [{{BaseURL}}] unless raw requests are given
            if http.path.is_empty() && http.raw.is_empty() {
                http.path.push("{{BaseURL}}".to_string());
            }
        }
        ProtocolRequest::Dns(dns) => {
            if dns.name.is_none() {
                dns.name = Some("{{FQDN}}".to_string());
            }
            if dns.record_type.is_none() {
                dns.record_type = Some(DnsRecordType::A);
            }
            if dns.recursion.is_none() {
                dns.recursion = Some(true);
            }
        }
        ProtocolRequest::Network(net) => {
            if net.host.is_empty() {
                net.host.push("{{Hostname}}".to_string());
            }
            if net.transport.is_none() {
                net.transport = Some(Transport::Tcp);
            }
            for input in net.inputs.iter_mut() {
                if input.encoding.is_none() {
                    input.encoding = Some(InputEncoding::Text);
                }
            }
        }
    }
}

// ─── Matcher and extractor defaults ─────────────────────────────────────────

fn matcher_defaults(matchers: &mut [Matcher], protocol: Protocol) {
    for (i, matcher) in matchers.iter_mut().enumerate() {
        // name → "matcher-{N}" (1-based)
        if matcher.name.is_none() {
            matcher.name = Some(matcher_display_name(matcher, i));
        }
        // Status and DSL matchers read the whole view, not a part.
        let reads_part = !matches!(matcher.kind, MatcherKind::Status | MatcherKind::Dsl);
        if reads_part && matcher.part.is_none() {
            matcher.part = Some(default_part(protocol).to_string());
        }
    }
}

fn extractor_defaults(extractors: &mut [Extractor], protocol: Protocol) {
    for (i, extractor) in extractors.iter_mut().enumerate() {
        if extractor.name.is_none() {
            extractor.name = Some(extractor_display_name(extractor, i));
        }
        let reads_part = matches!(extractor.kind, ExtractorKind::Regex | ExtractorKind::Json);
        if reads_part && extractor.part.is_none() {
            extractor.part = Some(default_part(protocol).to_string());
        }
    }
}
