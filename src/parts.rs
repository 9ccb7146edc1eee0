use crate::enums::Protocol;

/// A part registry entry: a named slice of a response for one protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartEntry {
    pub part: &'static str,
    pub protocol: Protocol,
    /// Default part for matchers and extractors that name none.
    pub default: bool,
}

/// Parts every protocol exposes once an out-of-band listener reported back.
pub static INTERACTION_PARTS: &[&str] = &[
    "interaction_protocol",
    "interaction_request",
    "interaction_response",
];

/// Response parts known to each protocol executor, as a compile-time constant.
pub static PART_REGISTRY: &[PartEntry] = &[
    // HTTP parts
    PartEntry {
        part: "body",
        protocol: Protocol::Http,
        default: true,
    },
    PartEntry {
        part: "header",
        protocol: Protocol::Http,
        default: false,
    },
    PartEntry {
        part: "all",
        protocol: Protocol::Http,
        default: false,
    },
    PartEntry {
        part: "raw",
        protocol: Protocol::Http,
        default: false,
    },
    PartEntry {
        part: "status",
        protocol: Protocol::Http,
        default: false,
    },
    PartEntry {
        part: "request",
        protocol: Protocol::Http,
        default: false,
    },
    // DNS parts
    PartEntry {
        part: "raw",
        protocol: Protocol::Dns,
        default: true,
    },
    PartEntry {
        part: "answer",
        protocol: Protocol::Dns,
        default: false,
    },
    PartEntry {
        part: "question",
        protocol: Protocol::Dns,
        default: false,
    },
    PartEntry {
        part: "rcode",
        protocol: Protocol::Dns,
        default: false,
    },
    PartEntry {
        part: "request",
        protocol: Protocol::Dns,
        default: false,
    },
    // Network parts
    PartEntry {
        part: "data",
        protocol: Protocol::Network,
        default: true,
    },
    PartEntry {
        part: "raw",
        protocol: Protocol::Network,
        default: false,
    },
    PartEntry {
        part: "request",
        protocol: Protocol::Network,
        default: false,
    },
];

/// Default part for a protocol.
pub fn default_part(protocol: Protocol) -> &'static str {
    PART_REGISTRY
        .iter()
        .find(|e| e.protocol == protocol && e.default)
        .map(|e| e.part)
        .unwrap_or("raw")
}

/// Whether `part` can be read from responses of `protocol`.
///
/// Named network inputs also expose their read-back under the input name, so
/// callers validating network blocks should check those names separately.
pub fn is_known_part(protocol: Protocol, part: &str) -> bool {
    INTERACTION_PARTS.contains(&part)
        || PART_REGISTRY
            .iter()
            .any(|e| e.protocol == protocol && e.part == part)
}

/// Whether a matcher on `part` needs an out-of-band interaction token.
pub fn is_interaction_part(part: &str) -> bool {
    INTERACTION_PARTS.contains(&part)
}
