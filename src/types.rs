use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::enums::*;

// ─── Template ───────────────────────────────────────────────────────────────

/// A parsed probe definition. Immutable once loaded and shared read-only
/// across every concurrent run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub info: Info,
    /// Template-level constants, seeded into every run in declaration order.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<WorkflowStep>,
    /// Raw executable block of an advanced workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Template {
    pub fn kind(&self) -> TemplateKind {
        if self.code.as_deref().is_some_and(|c| !c.trim().is_empty()) {
            TemplateKind::AdvancedWorkflow
        } else if !self.workflows.is_empty() {
            TemplateKind::Workflow
        } else {
            TemplateKind::Template
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub severity: SeverityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

// ─── Request blocks ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub request: ProtocolRequest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extractors: Vec<Extractor>,
    #[serde(default)]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub stop_at_first_match: bool,
    #[serde(default)]
    pub extract: ExtractScope,
}

impl RequestBlock {
    pub fn protocol(&self) -> Protocol {
        match self.request {
            ProtocolRequest::Http(_) => Protocol::Http,
            ProtocolRequest::Dns(_) => Protocol::Dns,
            ProtocolRequest::Network(_) => Protocol::Network,
        }
    }
}

/// Protocol-specific request payload, selected by the `protocol` tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolRequest {
    Http(HttpRequest),
    Dns(DnsRequest),
    Network(NetworkRequest),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Complete raw HTTP requests; each one compiles to its own request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirects: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DnsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<DnsRecordType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<NetworkInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_size: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkInput {
    pub data: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<InputEncoding>,
    /// Bytes to read back after writing this input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ─── Matchers and extractors ────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: MatcherKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<i64>,
    /// Hex-encoded byte patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub size: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dsl: Vec<String>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub negative: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Matcher {
    /// Builds an empty matcher of the given kind.
    pub fn new(kind: MatcherKind) -> Self {
        Matcher {
            kind,
            name: None,
            part: None,
            words: Vec::new(),
            regex: Vec::new(),
            status: Vec::new(),
            binary: Vec::new(),
            size: Vec::new(),
            dsl: Vec::new(),
            condition: Condition::Or,
            negative: false,
            case_insensitive: false,
        }
    }

    /// Number of conditions relevant to this matcher's kind.
    pub fn condition_count(&self) -> usize {
        match self.kind {
            MatcherKind::Word => self.words.len(),
            MatcherKind::Regex => self.regex.len(),
            MatcherKind::Status => self.status.len(),
            MatcherKind::Binary => self.binary.len(),
            MatcherKind::Size => self.size.len(),
            MatcherKind::Dsl => self.dsl.len(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,
    /// Capture group selector for regex extractors (0 = whole match).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kval: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dsl: Vec<String>,
    /// Value stays in the execution context and is not surfaced in results.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Extractor {
    pub fn new(kind: ExtractorKind) -> Self {
        Extractor {
            kind,
            name: None,
            part: None,
            regex: Vec::new(),
            group: None,
            kval: Vec::new(),
            json: Vec::new(),
            dsl: Vec::new(),
            internal: false,
            case_insensitive: false,
        }
    }
}

// ─── Workflows ──────────────────────────────────────────────────────────────

/// One node of a workflow tree, as authored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// ID of the template this step invokes.
    pub template: String,
    /// Children visited when this step matched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtemplates: Vec<WorkflowStep>,
    /// Children visited when this step extracted at least one value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_extract: Vec<WorkflowStep>,
    /// Children keyed on individual matcher names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<WorkflowBranch>,
    #[serde(default)]
    pub stop_at_first_match: bool,
}

impl WorkflowStep {
    pub fn new(template: impl Into<String>) -> Self {
        WorkflowStep {
            template: template.into(),
            subtemplates: Vec::new(),
            on_extract: Vec::new(),
            matchers: Vec::new(),
            stop_at_first_match: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowBranch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtemplates: Vec<WorkflowStep>,
}

// ─── Extracted values ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub name: String,
    pub values: Vec<String>,
    pub internal: bool,
}

/// Ordered mapping from extractor name to captured values.
///
/// Keys keep first-insertion order and values keep capture order; nothing is
/// de-duplicated. A name that captured nothing is absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    entries: Vec<ExtractedEntry>,
}

impl Extracted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one captured value under `name`.
    pub fn push(&mut self, name: &str, value: String, internal: bool) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.values.push(value);
                entry.internal |= internal;
            }
            None => self.entries.push(ExtractedEntry {
                name: name.to_string(),
                values: vec![value],
                internal,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.values.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractedEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends every entry of `other`, keeping this map's key order first.
    pub fn extend(&mut self, other: Extracted) {
        for entry in other.entries {
            for value in entry.values {
                self.push(&entry.name, value, entry.internal);
            }
        }
    }

    /// A copy without the entries captured by internal extractors.
    pub fn without_internal(&self) -> Extracted {
        Extracted {
            entries: self.entries.iter().filter(|e| !e.internal).cloned().collect(),
        }
    }
}

impl Serialize for Extracted {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.name, &entry.values)?;
        }
        map.end()
    }
}

// ─── Out-of-band interactions ───────────────────────────────────────────────

/// One callback observed by the out-of-band listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub protocol: String,
    pub unique_id: String,
    #[serde(default)]
    pub raw_request: String,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Result record ──────────────────────────────────────────────────────────

/// One reported match. Immutable once emitted.
#[derive(Clone, Debug, Serialize)]
pub struct ResultRecord {
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    /// Workflow that invoked the template, when the match came from a workflow step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub target: String,
    /// Concrete endpoint of the request that produced the match.
    pub matched_at: String,
    pub timestamp: DateTime<Utc>,
    pub matcher_names: Vec<String>,
    pub extracted: Extracted,
    pub severity: SeverityLevel,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request: String,
}
