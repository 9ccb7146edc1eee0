use super::common::*;
use probekit::protocols::{DnsExecutor, Payload, ProtocolExecutor};
use std::net::Ipv4Addr;
use std::sync::Arc;

const RESOLVE_A: &str = r#"
id: resolve-a
info:
  severity: info
dns:
  - name: "{{FQDN}}"
    type: A
    matchers-condition: and
    matchers:
      - type: status
        status: [0]
      - type: word
        part: answer
        words: ["93.184.216.34"]
    extractors:
      - type: regex
        name: ip
        part: answer
        group: 1
        regex: ['IN\tA\t([0-9.]+)']
"#;

#[tokio::test]
async fn answer_section_matches_and_extracts() {
    let resolver = spawn_dns(Ipv4Addr::new(93, 184, 216, 34)).await;
    let t = template(RESOLVE_A);
    let dns: Arc<dyn ProtocolExecutor> = Arc::new(DnsExecutor::with_resolver(resolver.to_string()));
    let engine = engine_with(quiet_config(), vec![dns]);

    let mut ctx = context("example.com", &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();

    assert!(outcome.matched);
    assert_eq!(outcome.extracted.get("ip").unwrap(), &["93.184.216.34"]);
    let records = ctx.into_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].matched_at, "example.com");
    assert_eq!(records[0].request, ";example.com.\tIN\tA");
}

#[test]
fn compile_uses_block_resolver_and_defaults() {
    let t = template(
        r#"
id: txt-lookup
dns:
  - name: "_dmarc.{{FQDN}}."
    type: TXT
    resolver: "10.0.0.53"
"#,
    );
    let executor = DnsExecutor::with_resolver("127.0.0.1:5353");
    let ctx = context("https://mail.example.org/", &t);
    let compiled = executor.compile(&t.requests[0], ctx.variables());
    let request = compiled[0].as_ref().unwrap();
    assert_eq!(request.endpoint, "_dmarc.mail.example.org");
    match &request.payload {
        Payload::Dns(q) => {
            assert_eq!(q.resolver, "10.0.0.53:53");
            assert!(q.recursion);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn silent_resolver_times_out_without_match() {
    // Bound but never answers.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let t = template(RESOLVE_A);
    let dns: Arc<dyn ProtocolExecutor> =
        Arc::new(DnsExecutor::with_resolver(silent.local_addr().unwrap().to_string()));
    let config = probekit::ScanConfig {
        timeout_secs: 1,
        ..quiet_config()
    };
    let engine = engine_with(config, vec![dns]);

    let mut ctx = context("example.com", &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(!outcome.matched);
    assert!(ctx.records().is_empty());
}
