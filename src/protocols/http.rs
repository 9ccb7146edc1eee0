//! HTTP executor backed by `reqwest`.

use async_trait::async_trait;
use reqwest::{Client, Method, redirect::Policy};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

use super::{CompiledRequest, HttpCall, Payload, ProtocolExecutor};
use crate::config::ScanConfig;
use crate::context::Variables;
use crate::enums::Protocol;
use crate::error::{ExecError, TransportErrorKind};
use crate::primitives::{interpolate, parse_raw_http};
use crate::response::ResponseView;
use crate::types::{HttpRequest, ProtocolRequest, RequestBlock};

const DEFAULT_PATH: &str = "{{BaseURL}}";

/// Two clients share one configuration and differ only in redirect policy,
/// so Request Blocks can override the scan-wide setting.
#[derive(Clone, Debug)]
pub struct HttpExecutor {
    direct: Client,
    following: Client,
    follow_by_default: bool,
}

impl HttpExecutor {
    pub fn new(config: &ScanConfig) -> Result<Self, ExecError> {
        let build = |policy: Policy| {
            Client::builder()
                .timeout(config.timeout())
                .danger_accept_invalid_certs(true)
                .redirect(policy)
                .user_agent(&config.user_agent)
                .build()
                .map_err(|e| ExecError::config(format!("failed to create HTTP client: {}", e)))
        };
        Ok(Self {
            direct: build(Policy::none())?,
            following: build(Policy::limited(config.max_redirects))?,
            follow_by_default: config.follow_redirects,
        })
    }

    fn client_for(&self, call: &HttpCall) -> &Client {
        if call.follow_redirects.unwrap_or(self.follow_by_default) {
            &self.following
        } else {
            &self.direct
        }
    }
}

#[async_trait]
impl ProtocolExecutor for HttpExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        let ProtocolRequest::Http(request) = &block.request else {
            return vec![Err(ExecError::config(format!(
                "{} block handed to the http executor",
                block.protocol()
            )))];
        };
        compile_http(request, vars)
    }

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        let Payload::Http(call) = &request.payload else {
            return Err(ExecError::config(format!(
                "{} request handed to the http executor",
                request.protocol()
            )));
        };

        let method = Method::from_bytes(call.method.as_bytes())
            .map_err(|e| ExecError::config(format!("invalid HTTP method '{}': {}", call.method, e)))?;
        let mut builder = self.client_for(call).request(method, &call.url);
        for (name, value) in &call.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &call.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| classify(&call.url, e))?;

        let status = response.status();
        let mut header_text = format!(
            "{:?} {} {}\r\n",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        let mut kv: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            header_text.push_str(&format!("{}: {}\r\n", name.as_str(), value));
            kv.entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ExecError::protocol(&call.url, format!("failed to read body: {}", e)))?;
        let elapsed = started.elapsed();
        debug!(url = %call.url, status = status.as_u16(), bytes = body.len(), "http response");

        let mut all = header_text.clone().into_bytes();
        all.extend_from_slice(b"\r\n");
        all.extend_from_slice(&body);

        let mut view = ResponseView::new(Protocol::Http, &request.endpoint, &request.rendered)
            .with_status(i64::from(status.as_u16()))
            .with_part("header", header_text)
            .with_part("body", body.to_vec())
            .with_part("raw", all.clone())
            .with_part("all", all)
            .with_elapsed(elapsed);
        for (name, value) in kv {
            view = view.with_kv(&name, value);
        }
        Ok(view)
    }
}

/// Compiles every `path` (or every `raw` request) of a block into its own
/// request. Failures stay per request.
pub fn compile_http(request: &HttpRequest, vars: &Variables) -> Vec<Result<CompiledRequest, ExecError>> {
    if !request.raw.is_empty() {
        return request
            .raw
            .iter()
            .map(|raw| compile_raw(raw, request.redirects, vars))
            .collect();
    }

    let method = request
        .method
        .as_deref()
        .unwrap_or("GET")
        .trim()
        .to_ascii_uppercase();
    let paths: Vec<&str> = if request.path.is_empty() {
        vec![DEFAULT_PATH]
    } else {
        request.path.iter().map(String::as_str).collect()
    };

    paths
        .into_iter()
        .map(|path| {
            let url = absolute_url(&interpolate(path, vars)?);
            let headers = request
                .headers
                .iter()
                .map(|(name, value)| Ok((name.clone(), interpolate(value, vars)?)))
                .collect::<Result<Vec<_>, ExecError>>()?;
            let body = request
                .body
                .as_deref()
                .map(|b| interpolate(b, vars))
                .transpose()?;
            build(HttpCall {
                method: method.clone(),
                url,
                headers,
                body,
                follow_redirects: request.redirects,
            })
        })
        .collect()
}

fn compile_raw(
    raw: &str,
    redirects: Option<bool>,
    vars: &Variables,
) -> Result<CompiledRequest, ExecError> {
    let parsed = parse_raw_http(&interpolate(raw, vars)?)?;
    let url = if parsed.path.contains("://") {
        parsed.path.clone()
    } else {
        let host = parsed
            .header("Host")
            .or_else(|| vars.first("Hostname"))
            .ok_or_else(|| ExecError::config("raw request has no Host header and no target host"))?;
        let scheme = vars.first("Scheme").unwrap_or("http");
        format!("{}://{}{}", scheme, host, parsed.path)
    };
    let headers = parsed
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect();
    build(HttpCall {
        method: parsed.method.to_ascii_uppercase(),
        url,
        headers,
        body: parsed.body,
        follow_redirects: redirects,
    })
}

/// Targets without a scheme are read as plain HTTP.
fn absolute_url(raw: &str) -> String {
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    }
}

fn build(call: HttpCall) -> Result<CompiledRequest, ExecError> {
    let parsed = url::Url::parse(&call.url)
        .map_err(|e| ExecError::config(format!("invalid URL '{}': {}", call.url, e)))?;
    let host = match (parsed.host_str(), parsed.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        (None, _) => return Err(ExecError::config(format!("URL '{}' has no host", call.url))),
    };
    let target = match parsed.query() {
        Some(q) => format!("{}?{}", parsed.path(), q),
        None => parsed.path().to_string(),
    };

    let mut rendered = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", call.method, target, host);
    for (name, value) in &call.headers {
        rendered.push_str(&format!("{}: {}\r\n", name, value));
    }
    rendered.push_str("\r\n");
    if let Some(body) = &call.body {
        rendered.push_str(body);
    }

    Ok(CompiledRequest {
        endpoint: call.url.clone(),
        rendered,
        payload: Payload::Http(call),
    })
}

fn classify(url: &str, e: reqwest::Error) -> ExecError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() {
        TransportErrorKind::ConnectionRefused
    } else if e.is_builder() {
        return ExecError::config(format!("cannot build request for {}: {}", url, e));
    } else if e.is_body() || e.is_decode() || e.is_redirect() {
        return ExecError::protocol(url, e.to_string());
    } else if e.is_request() {
        TransportErrorKind::Io
    } else {
        TransportErrorKind::Other
    };
    ExecError::transport(kind, url, e.to_string())
}
