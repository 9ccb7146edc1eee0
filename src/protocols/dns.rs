//! DNS executor: one UDP question per request, answers parsed with
//! `dns-parser`.

use async_trait::async_trait;
use dns_parser::{Builder, Packet, QueryClass, QueryType, RData, ResponseCode};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{CompiledRequest, DnsQuery, Payload, ProtocolExecutor, io_error};
use crate::config::ScanConfig;
use crate::context::Variables;
use crate::enums::{DnsRecordType, Protocol};
use crate::error::{ExecError, TransportErrorKind};
use crate::primitives::interpolate;
use crate::response::ResponseView;
use crate::types::{ProtocolRequest, RequestBlock};

const DEFAULT_NAME: &str = "{{FQDN}}";
const MAX_PACKET: usize = 4096;

#[derive(Clone, Debug)]
pub struct DnsExecutor {
    resolver: String,
}

impl DnsExecutor {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            resolver: config.dns_resolver.clone(),
        }
    }

    /// An executor sending to `resolver` (`host:port`).
    pub fn with_resolver(resolver: impl Into<String>) -> Self {
        Self {
            resolver: resolver.into(),
        }
    }
}

#[async_trait]
impl ProtocolExecutor for DnsExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Dns
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        let ProtocolRequest::Dns(request) = &block.request else {
            return vec![Err(ExecError::config(format!(
                "{} block handed to the dns executor",
                block.protocol()
            )))];
        };

        let compiled = (|| {
            let name = interpolate(request.name.as_deref().unwrap_or(DEFAULT_NAME), vars)?;
            let name = name.trim().trim_end_matches('.').to_string();
            if name.is_empty() {
                return Err(ExecError::config("dns request resolves to an empty name"));
            }
            let resolver = match &request.resolver {
                Some(r) => interpolate(r, vars)?,
                None => self.resolver.clone(),
            };
            let record_type = request.record_type.unwrap_or_default();
            let rendered = format!(";{}.\tIN\t{}", name, type_label(record_type));
            Ok(CompiledRequest {
                endpoint: name.clone(),
                rendered,
                payload: Payload::Dns(DnsQuery {
                    name,
                    record_type,
                    recursion: request.recursion.unwrap_or(true),
                    resolver: with_default_port(&resolver),
                }),
            })
        })();
        vec![compiled]
    }

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        let Payload::Dns(query) = &request.payload else {
            return Err(ExecError::config(format!(
                "{} request handed to the dns executor",
                request.protocol()
            )));
        };

        let resolver: SocketAddr = tokio::net::lookup_host(&query.resolver)
            .await
            .map_err(|e| io_error(&query.resolver, e))?
            .next()
            .ok_or_else(|| {
                ExecError::transport(
                    TransportErrorKind::Dns,
                    &query.resolver,
                    "resolver address did not resolve",
                )
            })?;

        let id: u16 = rand::random();
        let mut builder = Builder::new_query(id, query.recursion);
        builder.add_question(&query.name, false, query_type(query.record_type), QueryClass::IN);
        let packet = builder
            .build()
            .map_err(|_| ExecError::config(format!("dns question for '{}' is too large", query.name)))?;

        let bind_addr = if resolver.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| io_error(&query.resolver, e))?;

        let started = Instant::now();
        socket
            .send_to(&packet, resolver)
            .await
            .map_err(|e| io_error(&query.resolver, e))?;

        let mut buf = vec![0u8; MAX_PACKET];
        let len = loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| io_error(&query.resolver, e))?;
            if from != resolver {
                debug!(%from, "ignoring dns reply from unexpected peer");
                continue;
            }
            match Packet::parse(&buf[..len]) {
                Ok(reply) if reply.header.id == id => break len,
                Ok(reply) => debug!(id = reply.header.id, "ignoring dns reply with stale id"),
                Err(e) => {
                    return Err(ExecError::protocol(
                        &query.resolver,
                        format!("malformed dns reply: {}", e),
                    ));
                }
            }
        };
        let reply = Packet::parse(&buf[..len])
            .map_err(|e| ExecError::protocol(&query.resolver, format!("malformed dns reply: {}", e)))?;
        let elapsed = started.elapsed();

        let rcode = rcode_value(reply.header.response_code);
        let question: Vec<String> = reply
            .questions
            .iter()
            .map(|q| format!(";{}.\t{:?}\t{:?}", q.qname, q.qclass, q.qtype))
            .collect();
        let answer: Vec<String> = reply
            .answers
            .iter()
            .map(|rr| format!("{}.\t{}\tIN\t{}", rr.name, rr.ttl, rdata_text(&rr.data)))
            .collect();
        let authority: Vec<String> = reply
            .nameservers
            .iter()
            .map(|rr| format!("{}.\t{}\tIN\t{}", rr.name, rr.ttl, rdata_text(&rr.data)))
            .collect();

        let mut raw = format!(
            ";; ->>HEADER<<- status: {}, id: {}\n;; QUESTION SECTION:\n{}\n",
            rcode_label(reply.header.response_code),
            id,
            question.join("\n")
        );
        if !answer.is_empty() {
            raw.push_str(&format!("\n;; ANSWER SECTION:\n{}\n", answer.join("\n")));
        }
        if !authority.is_empty() {
            raw.push_str(&format!("\n;; AUTHORITY SECTION:\n{}\n", authority.join("\n")));
        }
        debug!(name = %query.name, rcode, answers = answer.len(), "dns response");

        Ok(
            ResponseView::new(Protocol::Dns, &request.endpoint, &request.rendered)
                .with_status(rcode)
                .with_part("rcode", rcode.to_string())
                .with_part("question", question.join("\n"))
                .with_part("answer", answer.join("\n"))
                .with_part("raw", raw)
                .with_elapsed(elapsed),
        )
    }
}

fn with_default_port(resolver: &str) -> String {
    let trimmed = resolver.trim();
    if trimmed.parse::<SocketAddr>().is_ok() {
        return trimmed.to_string();
    }
    if trimmed.starts_with('[') || trimmed.matches(':').count() == 1 {
        // `[v6]:port`, `[v6]` or `host:port`
        if trimmed.ends_with(']') {
            return format!("{}:53", trimmed);
        }
        return trimmed.to_string();
    }
    if trimmed.contains(':') {
        return format!("[{}]:53", trimmed);
    }
    format!("{}:53", trimmed)
}

fn query_type(t: DnsRecordType) -> QueryType {
    match t {
        DnsRecordType::A => QueryType::A,
        DnsRecordType::Aaaa => QueryType::AAAA,
        DnsRecordType::Cname => QueryType::CNAME,
        DnsRecordType::Ns => QueryType::NS,
        DnsRecordType::Txt => QueryType::TXT,
        DnsRecordType::Mx => QueryType::MX,
        DnsRecordType::Ptr => QueryType::PTR,
        DnsRecordType::Soa => QueryType::SOA,
        DnsRecordType::Srv => QueryType::SRV,
        DnsRecordType::Any => QueryType::All,
    }
}

fn type_label(t: DnsRecordType) -> &'static str {
    match t {
        DnsRecordType::A => "A",
        DnsRecordType::Aaaa => "AAAA",
        DnsRecordType::Cname => "CNAME",
        DnsRecordType::Ns => "NS",
        DnsRecordType::Txt => "TXT",
        DnsRecordType::Mx => "MX",
        DnsRecordType::Ptr => "PTR",
        DnsRecordType::Soa => "SOA",
        DnsRecordType::Srv => "SRV",
        DnsRecordType::Any => "ANY",
    }
}

fn rcode_value(code: ResponseCode) -> i64 {
    match code {
        ResponseCode::NoError => 0,
        ResponseCode::FormatError => 1,
        ResponseCode::ServerFailure => 2,
        ResponseCode::NameError => 3,
        ResponseCode::NotImplemented => 4,
        ResponseCode::Refused => 5,
        ResponseCode::Reserved(n) => i64::from(n),
    }
}

fn rcode_label(code: ResponseCode) -> &'static str {
    match code {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormatError => "FORMERR",
        ResponseCode::ServerFailure => "SERVFAIL",
        ResponseCode::NameError => "NXDOMAIN",
        ResponseCode::NotImplemented => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        ResponseCode::Reserved(_) => "RESERVED",
    }
}

fn rdata_text(data: &RData<'_>) -> String {
    match data {
        RData::A(a) => format!("A\t{}", a.0),
        RData::AAAA(a) => format!("AAAA\t{}", a.0),
        RData::CNAME(c) => format!("CNAME\t{}.", c.0),
        RData::NS(n) => format!("NS\t{}.", n.0),
        RData::PTR(p) => format!("PTR\t{}.", p.0),
        RData::MX(mx) => format!("MX\t{} {}.", mx.preference, mx.exchange),
        RData::TXT(txt) => {
            let chunks: Vec<String> = txt
                .iter()
                .map(|chunk| format!("\"{}\"", String::from_utf8_lossy(chunk)))
                .collect();
            format!("TXT\t{}", chunks.join(" "))
        }
        RData::SOA(soa) => format!(
            "SOA\t{}. {}. {} {} {} {} {}",
            soa.primary_ns,
            soa.mailbox,
            soa.serial,
            soa.refresh,
            soa.retry,
            soa.expire,
            soa.minimum_ttl
        ),
        RData::SRV(srv) => format!(
            "SRV\t{} {} {} {}.",
            srv.priority, srv.weight, srv.port, srv.target
        ),
        RData::Unknown(bytes) => format!("TYPE\t\\# {} {}", bytes.len(), hex::encode(bytes)),
        #[allow(unreachable_patterns)]
        _ => "UNKNOWN".to_string(),
    }
}
