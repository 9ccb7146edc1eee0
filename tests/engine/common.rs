//! Local servers and scripted executors shared by the engine suites. Nothing
//! here touches the external network.

use async_trait::async_trait;
use probekit::cancel::CancelSignal;
use probekit::config::ScanConfig;
use probekit::context::{ExecutionContext, Variables};
use probekit::enums::Protocol;
use probekit::error::ExecError;
use probekit::protocols::http::compile_http;
use probekit::protocols::{CompiledRequest, ExecutorRegistry, ProtocolExecutor};
use probekit::response::ResponseView;
use probekit::runner::Engine;
use probekit::types::{ProtocolRequest, RequestBlock, Template};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Load a template through parse → validate → normalize, panicking on errors.
pub fn template(yaml: &str) -> Template {
    match probekit::load(yaml) {
        Ok(loaded) => loaded.template,
        Err(errors) => panic!("template should load: {:?}", errors),
    }
}

/// No rate limit, no retries, short deadlines.
pub fn quiet_config() -> ScanConfig {
    ScanConfig {
        rate_limit: 0,
        retries: 0,
        timeout_secs: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        interaction_wait_secs: 1,
        ..ScanConfig::default()
    }
}

pub fn engine_with(config: ScanConfig, executors: Vec<Arc<dyn ProtocolExecutor>>) -> Engine {
    let mut registry = ExecutorRegistry::new();
    for executor in executors {
        registry.register(executor);
    }
    Engine::new(config, registry)
}

pub fn context(target: &str, template: &Template) -> ExecutionContext {
    ExecutionContext::new(target, template, &Variables::new(), CancelSignal::new())
        .expect("context should seed")
}

// ─── HTTP server ────────────────────────────────────────────────────────────

/// (path, status, body)
pub type Route = (&'static str, u16, &'static str);

pub struct HttpServer {
    pub base: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl HttpServer {
    /// Request lines received so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Serves `routes` on 127.0.0.1; unknown paths get a 404.
pub async fn spawn_http(routes: Vec<Route>) -> HttpServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let routes = routes.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                let line = head.lines().next().unwrap_or_default().to_string();
                log.lock().unwrap().push(line.clone());

                let path = line.split_whitespace().nth(1).unwrap_or("/");
                let (status, body) = routes
                    .iter()
                    .find(|(p, _, _)| *p == path)
                    .map(|(_, s, b)| (*s, *b))
                    .unwrap_or((404, "not found"));
                let reason = match status {
                    200 => "OK",
                    302 => "Found",
                    404 => "Not Found",
                    500 => "Internal Server Error",
                    _ => "Unknown",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nX-Powered-By: probe-test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    HttpServer {
        base: format!("http://{}", addr),
        requests,
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// ─── DNS responder ──────────────────────────────────────────────────────────

/// Answers every question with one A record pointing at `answer`.
pub async fn spawn_dns(answer: Ipv4Addr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            if let Some(reply) = a_record_reply(&buf[..len], answer) {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    addr
}

fn a_record_reply(query: &[u8], answer: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }
    let mut end = 12;
    while end < query.len() && query[end] != 0 {
        end += query[end] as usize + 1;
    }
    // root label + QTYPE + QCLASS
    let question_end = end + 5;
    if question_end > query.len() {
        return None;
    }

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[0..2]);
    reply.extend_from_slice(&[0x81, 0x80]);
    reply.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
    reply.extend_from_slice(&query[12..question_end]);
    // pointer to the question name, type A, class IN, ttl 60, rdlength 4
    reply.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
    reply.extend_from_slice(&answer.octets());
    Some(reply)
}

// ─── TCP banner server ──────────────────────────────────────────────────────

/// Sends `banner` on connect, then answers each chunk with `ECHO <chunk>`.
pub async fn spawn_tcp_banner(banner: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if stream.write_all(banner.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let mut reply = b"ECHO ".to_vec();
                            reply.extend_from_slice(&buf[..n]);
                            if stream.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

// ─── Scripted executors ─────────────────────────────────────────────────────

type Respond = dyn Fn(&CompiledRequest, usize) -> Result<ResponseView, ExecError> + Send + Sync;

/// HTTP executor that compiles like the real one and answers from a closure.
/// The closure receives the 1-based dispatch count.
pub struct ScriptedHttp {
    respond: Box<Respond>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn new(
        respond: impl Fn(&CompiledRequest, usize) -> Result<ResponseView, ExecError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(ScriptedHttp {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Endpoints dispatched, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolExecutor for ScriptedHttp {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        match &block.request {
            ProtocolRequest::Http(request) => compile_http(request, vars),
            _ => vec![Err(ExecError::config("not an http block"))],
        }
    }

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.endpoint.clone());
            calls.len()
        };
        (self.respond)(request, count)
    }
}

/// HTTP executor whose requests never complete.
pub struct Stalled {
    pub started: Arc<tokio::sync::Notify>,
}

impl Stalled {
    pub fn new() -> Arc<Self> {
        Arc::new(Stalled {
            started: Arc::new(tokio::sync::Notify::new()),
        })
    }
}

#[async_trait]
impl ProtocolExecutor for Stalled {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        match &block.request {
            ProtocolRequest::Http(request) => compile_http(request, vars),
            _ => vec![Err(ExecError::config("not an http block"))],
        }
    }

    async fn execute(&self, _request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        self.started.notify_one();
        std::future::pending().await
    }
}

/// An HTTP view with a status and a body.
pub fn http_view(request: &CompiledRequest, status: i64, body: &str) -> ResponseView {
    ResponseView::new(Protocol::Http, &request.endpoint, &request.rendered)
        .with_status(status)
        .with_part("body", body)
}

/// HTTP executor that holds each request for `delay` and tracks how many
/// were in flight at once, overall and per final path segment.
pub struct Counting {
    delay: std::time::Duration,
    state: Mutex<CountingState>,
}

#[derive(Default)]
struct CountingState {
    in_flight: usize,
    peak: usize,
    by_key: std::collections::HashMap<String, (usize, usize)>,
}

impl Counting {
    pub fn new(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Counting {
            delay,
            state: Mutex::new(CountingState::default()),
        })
    }

    pub fn peak(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    pub fn peak_for(&self, key: &str) -> usize {
        self.state.lock().unwrap().by_key.get(key).map_or(0, |(_, peak)| *peak)
    }
}

#[async_trait]
impl ProtocolExecutor for Counting {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        match &block.request {
            ProtocolRequest::Http(request) => compile_http(request, vars),
            _ => vec![Err(ExecError::config("not an http block"))],
        }
    }

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        let key = request.endpoint.rsplit('/').next().unwrap_or_default().to_string();
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.peak = state.peak.max(state.in_flight);
            let entry = state.by_key.entry(key.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        tokio::time::sleep(self.delay).await;
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
            if let Some(entry) = state.by_key.get_mut(&key) {
                entry.0 -= 1;
            }
        }
        Ok(http_view(request, 200, "ok"))
    }
}
