use super::common::*;
use probekit::protocols::{NetworkExecutor, Payload, ProtocolExecutor};
use std::sync::Arc;
use std::time::Duration;

fn fast_network() -> Arc<dyn ProtocolExecutor> {
    Arc::new(NetworkExecutor::with_limits(2048, Duration::from_millis(200)))
}

#[tokio::test]
async fn banner_and_named_input_readback() {
    let addr = spawn_tcp_banner("HELLO probe-service 1.0\r\n").await;
    let t = template(
        r#"
id: service-banner
tcp:
  - host: ["{{Hostname}}"]
    inputs:
      - data: "ping\n"
        read: 64
        name: reply
    matchers-condition: and
    matchers:
      - type: word
        words: ["HELLO probe-service"]
      - type: word
        part: reply
        words: ["ECHO ping"]
"#,
    );
    let engine = engine_with(quiet_config(), vec![fast_network()]);
    let mut ctx = context(&addr.to_string(), &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();

    assert!(outcome.matched, "matched names: {:?}", outcome.matched_names);
    let records = ctx.into_records();
    assert_eq!(records[0].matched_at, addr.to_string());
}

#[tokio::test]
async fn hex_input_is_sent_as_bytes() {
    let addr = spawn_tcp_banner("").await;
    let t = template(
        r#"
id: hex-probe
network:
  - host: ["tcp://{{Hostname}}"]
    inputs:
      - data: "50494e47"
        type: hex
    matchers:
      - type: binary
        binary: ["4543484f2050494e47"]
"#,
    );
    let engine = engine_with(quiet_config(), vec![fast_network()]);
    let mut ctx = context(&addr.to_string(), &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(outcome.matched);
}

#[test]
fn compile_rejects_hosts_without_port_and_tls() {
    let t = template(
        r#"
id: bad-hosts
network:
  - host:
      - "{{Host}}"
      - "udp://{{Host}}:161"
"#,
    );
    let ctx = context("http://10.1.2.3", &t);
    let compiled = fast_network().compile(&t.requests[0], ctx.variables());
    assert_eq!(compiled.len(), 2);
    assert!(compiled[0].is_err(), "a host without a port cannot be dialed");
    let udp = compiled[1].as_ref().unwrap();
    match &udp.payload {
        Payload::Network(call) => {
            assert_eq!(call.address, "10.1.2.3:161");
            assert_eq!(call.transport, probekit::Transport::Udp);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn tls_hosts_fail_validation() {
    let errors = probekit::load(
        r#"
id: tls-host
network:
  - host: ["tls://{{Hostname}}"]
"#,
    )
    .unwrap_err();
    assert!(
        errors.iter().any(|e| e.to_string().contains("TLS")),
        "got {:?}",
        errors
    );
}

#[tokio::test]
async fn udp_exchange_reaches_ipv6_peers() {
    // Hosts without an IPv6 loopback cannot run this.
    let Ok(socket) = tokio::net::UdpSocket::bind("[::1]:0").await else {
        return;
    };
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let mut reply = b"ECHO ".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    let t = template(&format!(
        r#"
id: udp-v6
network:
  - host: ["udp://[::1]:{}"]
    inputs:
      - data: "ping"
    matchers:
      - type: word
        words: ["ECHO ping"]
"#,
        port
    ));
    let engine = engine_with(quiet_config(), vec![fast_network()]);
    let mut ctx = context("http://localhost", &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(outcome.matched);
    assert_eq!(ctx.requests_sent(), 1);
}
