//! Protocol executors.
//!
//! One [`ProtocolExecutor`] per protocol family, selected by the Request
//! Block's protocol tag through an [`ExecutorRegistry`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ScanConfig;
use crate::context::Variables;
use crate::enums::{DnsRecordType, Protocol, Transport};
use crate::error::ExecError;
use crate::response::ResponseView;
use crate::types::RequestBlock;

pub mod dns;
pub mod http;
pub mod network;

pub use dns::DnsExecutor;
pub use http::HttpExecutor;
pub use network::NetworkExecutor;

/// A fully-resolved request, ready for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledRequest {
    /// Concrete endpoint the request goes to (URL, DNS name, host:port).
    pub endpoint: String,
    /// Human-readable rendering of the request, kept for audit.
    pub rendered: String,
    pub payload: Payload,
}

impl CompiledRequest {
    pub fn protocol(&self) -> Protocol {
        match self.payload {
            Payload::Http(_) => Protocol::Http,
            Payload::Dns(_) => Protocol::Dns,
            Payload::Network(_) => Protocol::Network,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Http(HttpCall),
    Dns(DnsQuery),
    Network(NetworkCall),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Per-request override of the scan's redirect policy.
    pub follow_redirects: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub record_type: DnsRecordType,
    pub recursion: bool,
    pub resolver: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkCall {
    pub address: String,
    pub transport: Transport,
    pub inputs: Vec<CompiledInput>,
    pub read_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledInput {
    pub data: Vec<u8>,
    pub read: Option<usize>,
    pub name: Option<String>,
}

/// Uniform contract of every protocol family.
///
/// `compile` never performs I/O. Each element of its result is one request;
/// an unresolvable request fails alone without affecting its siblings.
/// `execute` performs the network operation; the caller applies the
/// deadline, cancellation, retries and rate limiting around it.
#[async_trait]
pub trait ProtocolExecutor: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>>;

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError>;
}

/// Executors keyed by protocol.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Protocol, Arc<dyn ProtocolExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("protocols", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in HTTP, DNS and network executors configured from `config`.
    pub fn with_defaults(config: &ScanConfig) -> Result<Self, ExecError> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpExecutor::new(config)?));
        registry.register(Arc::new(DnsExecutor::new(config)));
        registry.register(Arc::new(NetworkExecutor::new(config)));
        Ok(registry)
    }

    /// Installs `executor` for its protocol, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn ProtocolExecutor>) {
        self.executors.insert(executor.protocol(), executor);
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn ProtocolExecutor>> {
        self.executors.get(&protocol).cloned()
    }
}

/// Classifies an I/O failure as a transport error.
pub(crate) fn io_error(target: &str, e: std::io::Error) -> ExecError {
    use crate::error::TransportErrorKind;
    use std::io::ErrorKind;

    let kind = match e.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            TransportErrorKind::ConnectionRefused
        }
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
        _ => TransportErrorKind::Io,
    };
    ExecError::transport(kind, target, e.to_string())
}
