//! Protocol-neutral view of one request/response exchange.
//!
//! Every executor normalizes its wire response into a [`ResponseView`] so the
//! matcher and extractor evaluators never branch on protocol. One view exists
//! per dispatched request and is never shared across requests.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::enums::Protocol;
use crate::parts::default_part;
use crate::types::Interaction;

#[derive(Clone, Debug)]
pub struct ResponseView {
    pub protocol: Protocol,
    /// HTTP status code or DNS response code. `None` for raw network exchanges.
    pub status: Option<i64>,
    /// Concrete endpoint the request went to.
    pub matched_at: String,
    /// Rendered request, kept for audit.
    pub request: String,
    pub elapsed: Duration,
    parts: BTreeMap<String, Vec<u8>>,
    kv: BTreeMap<String, String>,
}

impl ResponseView {
    pub fn new(protocol: Protocol, matched_at: impl Into<String>, request: impl Into<String>) -> Self {
        let request = request.into();
        let mut parts = BTreeMap::new();
        parts.insert("request".to_string(), request.clone().into_bytes());
        ResponseView {
            protocol,
            status: None,
            matched_at: matched_at.into(),
            request,
            elapsed: Duration::ZERO,
            parts,
            kv: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: i64) -> Self {
        self.status = Some(status);
        self.parts
            .insert("status".to_string(), status.to_string().into_bytes());
        self
    }

    pub fn with_part(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.parts.insert(name.to_string(), data.into());
        self
    }

    /// Adds a key/value pair readable by `kval` extractors. Keys are stored
    /// lower-cased with `-` replaced by `_`.
    pub fn with_kv(mut self, key: &str, value: impl Into<String>) -> Self {
        self.kv.insert(normalize_key(key), value.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Raw bytes of a named part.
    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(|v| v.as_slice())
    }

    /// A named part decoded as UTF-8, lossily.
    pub fn part_text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.part(name).map(String::from_utf8_lossy)
    }

    pub fn parts(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn kv(&self, key: &str) -> Option<&str> {
        self.kv.get(&normalize_key(key)).map(|s| s.as_str())
    }

    pub fn kv_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.kv.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Length of the protocol's default part (body, raw answer, read data).
    pub fn length(&self) -> usize {
        self.part(default_part(self.protocol))
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Exposes out-of-band callbacks as the `interaction_*` parts. Multiple
    /// interactions are joined with newlines in arrival order.
    pub fn attach_interactions(&mut self, interactions: &[Interaction]) {
        if interactions.is_empty() {
            return;
        }
        let mut protocols = Vec::with_capacity(interactions.len());
        let mut requests = Vec::with_capacity(interactions.len());
        let mut responses = Vec::with_capacity(interactions.len());
        for interaction in interactions {
            protocols.push(interaction.protocol.as_str());
            requests.push(interaction.raw_request.as_str());
            responses.push(interaction.raw_response.as_str());
        }
        self.parts.insert(
            "interaction_protocol".to_string(),
            protocols.join("\n").into_bytes(),
        );
        self.parts.insert(
            "interaction_request".to_string(),
            requests.join("\n").into_bytes(),
        );
        self.parts.insert(
            "interaction_response".to_string(),
            responses.join("\n").into_bytes(),
        );
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('-', "_")
}
