//! Closed enumerations used throughout the template model and the engine.
//!
//! These are "closed" enums: only the defined variants are valid. Open values
//! (response part names, header names) are represented as strings and checked
//! against the part registry during validation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity classification copied from template metadata into results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

impl SeverityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Info => "info",
            SeverityLevel::Low => "low",
            SeverityLevel::Medium => "medium",
            SeverityLevel::High => "high",
            SeverityLevel::Critical => "critical",
            SeverityLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol family of a request block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Dns,
    Network,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Dns => "dns",
            Protocol::Network => "network",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a list of boolean results combines. `Or` is the default everywhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    And,
    #[default]
    Or,
}

impl Condition {
    /// Folds results in declaration order. An empty input is `false` for both
    /// combinators: nothing was checked, so nothing fired.
    pub fn combine<I: IntoIterator<Item = bool>>(&self, results: I) -> bool {
        let mut seen = false;
        for result in results {
            seen = true;
            match self {
                Condition::And if !result => return false,
                Condition::Or if result => return true,
                _ => {}
            }
        }
        seen && *self == Condition::And
    }
}

/// Matcher type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Word,
    Regex,
    Status,
    Binary,
    Size,
    Dsl,
}

/// Extractor type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Regex,
    Kval,
    Json,
    Dsl,
}

/// When a request block runs its extractors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractScope {
    #[default]
    Always,
    AfterMatch,
}

/// DNS question type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    #[default]
    A,
    Aaaa,
    Cname,
    Ns,
    Txt,
    Mx,
    Ptr,
    Soa,
    Srv,
    Any,
}

/// Transport for raw network requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

/// Encoding of a raw network input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputEncoding {
    #[default]
    Text,
    Hex,
}

/// Classification of a loaded template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Template,
    Workflow,
    AdvancedWorkflow,
}

/// Workflow step states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Idle,
    Running,
    Matched,
    Unmatched,
    Fatal,
    Done,
}

/// Whether values captured by `internal` extractors appear in result records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalVariablePolicy {
    #[default]
    Hide,
    Report,
}

/// Final outcome of one (target, template) run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Matched,
    Unmatched,
    Failed,
    Cancelled,
}
