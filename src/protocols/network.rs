//! Raw TCP/UDP executor.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{CompiledInput, CompiledRequest, NetworkCall, Payload, ProtocolExecutor, io_error};
use crate::config::ScanConfig;
use crate::context::Variables;
use crate::enums::{InputEncoding, Protocol, Transport};
use crate::error::{ExecError, TransportErrorKind};
use crate::primitives::{decode_hex, interpolate};
use crate::response::ResponseView;
use crate::types::{NetworkRequest, ProtocolRequest, RequestBlock};

const DEFAULT_HOST: &str = "{{Hostname}}";

#[derive(Clone, Debug)]
pub struct NetworkExecutor {
    read_size: usize,
    /// How long a read may sit idle before the data gathered so far is final.
    read_idle: Duration,
}

impl NetworkExecutor {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            read_size: config.network_read_size.max(1),
            read_idle: config.timeout() / 2,
        }
    }

    pub fn with_limits(read_size: usize, read_idle: Duration) -> Self {
        Self {
            read_size: read_size.max(1),
            read_idle,
        }
    }

    fn compile_one(
        &self,
        host: &str,
        request: &NetworkRequest,
        vars: &Variables,
    ) -> Result<CompiledRequest, ExecError> {
        let host = interpolate(host, vars)?;
        let (transport, address) = split_address(host.trim(), request.transport.unwrap_or_default())?;

        let mut inputs = Vec::with_capacity(request.inputs.len());
        let mut rendered = Vec::new();
        for input in &request.inputs {
            let text = interpolate(&input.data, vars)?;
            let data = match input.encoding.unwrap_or_default() {
                InputEncoding::Text => text.into_bytes(),
                InputEncoding::Hex => decode_hex(&text)?,
            };
            rendered.extend_from_slice(&data);
            inputs.push(CompiledInput {
                data,
                read: input.read,
                name: input.name.clone(),
            });
        }

        Ok(CompiledRequest {
            endpoint: address.clone(),
            rendered: String::from_utf8_lossy(&rendered).into_owned(),
            payload: Payload::Network(NetworkCall {
                address,
                transport,
                inputs,
                read_size: request.read_size.unwrap_or(self.read_size),
            }),
        })
    }

    async fn exchange_tcp(&self, call: &NetworkCall) -> Result<Exchange, ExecError> {
        let mut stream = TcpStream::connect(&call.address)
            .await
            .map_err(|e| io_error(&call.address, e))?;
        let mut exchange = Exchange::default();

        for input in &call.inputs {
            stream
                .write_all(&input.data)
                .await
                .map_err(|e| io_error(&call.address, e))?;
            if let Some(n) = input.read {
                let chunk = self.read_tcp(&mut stream, n, &call.address).await?;
                exchange.record(input.name.as_deref(), chunk);
            }
        }
        stream.flush().await.map_err(|e| io_error(&call.address, e))?;

        if call.read_size > 0 {
            let chunk = self.read_tcp(&mut stream, call.read_size, &call.address).await?;
            exchange.record(None, chunk);
        }
        Ok(exchange)
    }

    /// Reads up to `limit` bytes, stopping early at EOF or once the peer goes
    /// quiet for the idle interval.
    async fn read_tcp(
        &self,
        stream: &mut TcpStream,
        limit: usize,
        address: &str,
    ) -> Result<Vec<u8>, ExecError> {
        let mut out = Vec::with_capacity(limit.min(64 * 1024));
        let mut buf = vec![0u8; limit.clamp(1, 64 * 1024)];
        while out.len() < limit {
            let want = (limit - out.len()).min(buf.len());
            match tokio::time::timeout(self.read_idle, stream.read(&mut buf[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(io_error(address, e)),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    async fn exchange_udp(&self, call: &NetworkCall) -> Result<Exchange, ExecError> {
        let peer: SocketAddr = tokio::net::lookup_host(&call.address)
            .await
            .map_err(|e| io_error(&call.address, e))?
            .next()
            .ok_or_else(|| {
                ExecError::transport(
                    TransportErrorKind::Dns,
                    &call.address,
                    "address did not resolve",
                )
            })?;
        let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| io_error(&call.address, e))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| io_error(&call.address, e))?;
        let mut exchange = Exchange::default();

        for input in &call.inputs {
            socket
                .send(&input.data)
                .await
                .map_err(|e| io_error(&call.address, e))?;
            if let Some(n) = input.read {
                let chunk = self.read_udp(&socket, n, &call.address).await?;
                exchange.record(input.name.as_deref(), chunk);
            }
        }
        if call.read_size > 0 {
            let chunk = self.read_udp(&socket, call.read_size, &call.address).await?;
            exchange.record(None, chunk);
        }
        Ok(exchange)
    }

    async fn read_udp(
        &self,
        socket: &UdpSocket,
        limit: usize,
        address: &str,
    ) -> Result<Vec<u8>, ExecError> {
        let mut buf = vec![0u8; limit.clamp(1, 65_535)];
        match tokio::time::timeout(self.read_idle, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(io_error(address, e)),
            Err(_) => Ok(Vec::new()),
        }
    }
}

/// Bytes read back during one exchange.
#[derive(Debug, Default)]
struct Exchange {
    data: Vec<u8>,
    named: Vec<(String, Vec<u8>)>,
}

impl Exchange {
    fn record(&mut self, name: Option<&str>, chunk: Vec<u8>) {
        self.data.extend_from_slice(&chunk);
        if let Some(name) = name {
            self.named.push((name.to_string(), chunk));
        }
    }
}

#[async_trait]
impl ProtocolExecutor for NetworkExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Network
    }

    fn compile(
        &self,
        block: &RequestBlock,
        vars: &Variables,
    ) -> Vec<Result<CompiledRequest, ExecError>> {
        let ProtocolRequest::Network(request) = &block.request else {
            return vec![Err(ExecError::config(format!(
                "{} block handed to the network executor",
                block.protocol()
            )))];
        };
        let hosts: Vec<&str> = if request.host.is_empty() {
            vec![DEFAULT_HOST]
        } else {
            request.host.iter().map(String::as_str).collect()
        };
        hosts
            .into_iter()
            .map(|host| self.compile_one(host, request, vars))
            .collect()
    }

    async fn execute(&self, request: &CompiledRequest) -> Result<ResponseView, ExecError> {
        let Payload::Network(call) = &request.payload else {
            return Err(ExecError::config(format!(
                "{} request handed to the network executor",
                request.protocol()
            )));
        };

        let started = Instant::now();
        let exchange = match call.transport {
            Transport::Tcp => self.exchange_tcp(call).await?,
            Transport::Udp => self.exchange_udp(call).await?,
        };
        let elapsed = started.elapsed();
        debug!(address = %call.address, bytes = exchange.data.len(), "network exchange");

        let mut view = ResponseView::new(Protocol::Network, &request.endpoint, &request.rendered)
            .with_part("data", exchange.data.clone())
            .with_part("raw", exchange.data)
            .with_elapsed(elapsed);
        for (name, chunk) in exchange.named {
            view = view.with_part(&name, chunk);
        }
        Ok(view)
    }
}

/// Splits an optional `tcp://` / `udp://` prefix off a host and checks the
/// address carries a port. TLS is not supported.
fn split_address(host: &str, default: Transport) -> Result<(Transport, String), ExecError> {
    let (transport, rest) = if let Some(rest) = host.strip_prefix("tcp://") {
        (Transport::Tcp, rest)
    } else if let Some(rest) = host.strip_prefix("udp://") {
        (Transport::Udp, rest)
    } else if host.starts_with("tls://") {
        return Err(ExecError::config(format!("tls network hosts are not supported: '{}'", host)));
    } else if host.contains("://") {
        return Err(ExecError::config(format!("unsupported network scheme in '{}'", host)));
    } else {
        (default, host)
    };

    let has_port = rest
        .rsplit_once(':')
        .is_some_and(|(h, p)| !h.is_empty() && !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !has_port {
        return Err(ExecError::config(format!("network host '{}' has no port", rest)));
    }
    Ok((transport, rest.to_string()))
}
