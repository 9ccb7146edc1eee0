use super::common::*;
use probekit::context::Variables;
use probekit::primitives::target_bindings;
use probekit::protocols::http::compile_http;
use probekit::protocols::{HttpExecutor, Payload, ProtocolExecutor};
use probekit::types::{HttpRequest, ProtocolRequest};
use std::sync::Arc;

fn bindings(target: &str) -> Variables {
    let mut vars = Variables::new();
    for (name, value) in target_bindings(target) {
        vars.set(&name, value);
    }
    vars
}

fn http_block(yaml: &str) -> HttpRequest {
    let t = template(yaml);
    match &t.requests[0].request {
        ProtocolRequest::Http(r) => r.clone(),
        other => panic!("expected http block, got {:?}", other),
    }
}

fn real_http() -> Arc<dyn ProtocolExecutor> {
    Arc::new(HttpExecutor::new(&quiet_config()).expect("client builds"))
}

// ─── compile ────────────────────────────────────────────────────────────────

#[test]
fn each_path_compiles_to_one_request() {
    let request = http_block(
        r#"
id: multi-path
requests:
  - protocol: http
    path:
      - "{{BaseURL}}/.git/config"
      - "{{BaseURL}}/.env"
    headers:
      X-Probe: "{{Host}}"
"#,
    );
    let compiled = compile_http(&request, &bindings("https://shop.test:8443/app"));
    assert_eq!(compiled.len(), 2);
    let first = compiled[0].as_ref().unwrap();
    assert_eq!(first.endpoint, "https://shop.test:8443/app/.git/config");
    assert!(first.rendered.starts_with("GET /app/.git/config HTTP/1.1\r\nHost: shop.test:8443\r\n"));
    match &first.payload {
        Payload::Http(call) => {
            assert_eq!(call.method, "GET");
            assert_eq!(call.headers, vec![("X-Probe".to_string(), "shop.test".to_string())]);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn unresolved_placeholder_fails_only_its_request() {
    let request = http_block(
        r#"
id: partial
requests:
  - protocol: http
    path:
      - "{{BaseURL}}/ok"
      - "{{BaseURL}}/{{session}}"
"#,
    );
    let compiled = compile_http(&request, &bindings("http://app.test"));
    assert!(compiled[0].is_ok());
    let err = compiled[1].as_ref().unwrap_err();
    assert!(err.to_string().contains("session"), "got {}", err);
}

#[test]
fn raw_request_takes_host_header_and_target_scheme() {
    let request = http_block(
        r#"
id: raw-login
requests:
  - protocol: http
    raw:
      - |
        POST /login HTTP/1.1
        Host: {{Hostname}}
        Content-Type: application/x-www-form-urlencoded

        user=admin&pass=admin
"#,
    );
    let compiled = compile_http(&request, &bindings("https://portal.test"));
    let req = compiled[0].as_ref().unwrap();
    assert_eq!(req.endpoint, "https://portal.test/login");
    let Payload::Http(call) = &req.payload else {
        panic!("expected http payload");
    };
    assert_eq!(call.method, "POST");
    assert_eq!(call.body.as_deref(), Some("user=admin&pass=admin"));
    assert!(call.headers.iter().all(|(k, _)| !k.eq_ignore_ascii_case("host")));
}

// ─── execute against a local server ─────────────────────────────────────────

#[tokio::test]
async fn status_word_and_header_extraction() {
    let server = spawn_http(vec![("/admin", 200, "<h1>Dashboard</h1>")]).await;
    let t = template(
        r#"
id: admin-panel
info:
  name: Admin panel
  severity: medium
requests:
  - protocol: http
    path:
      - "{{BaseURL}}/admin"
    matchers-condition: and
    matchers:
      - type: status
        status: [200]
      - type: word
        words: ["Dashboard"]
    extractors:
      - type: kval
        name: powered
        kval: ["x_powered_by"]
"#,
    );
    let engine = engine_with(quiet_config(), vec![real_http()]);
    let mut ctx = context(&server.base, &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();

    assert!(outcome.matched);
    assert_eq!(outcome.extracted.get("powered").unwrap(), &["probe-test"]);
    let records = ctx.into_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].matched_at, format!("{}/admin", server.base));
    assert_eq!(records[0].severity, probekit::SeverityLevel::Medium);
    assert!(records[0].request.starts_with("GET /admin HTTP/1.1"));
    assert_eq!(server.requests(), vec!["GET /admin HTTP/1.1"]);
}

#[tokio::test]
async fn not_found_is_no_match() {
    let server = spawn_http(vec![]).await;
    let t = template(
        r#"
id: backup-file
requests:
  - protocol: http
    path: ["{{BaseURL}}/backup.zip"]
    matchers:
      - type: status
        status: [200]
"#,
    );
    let engine = engine_with(quiet_config(), vec![real_http()]);
    let mut ctx = context(&server.base, &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(!outcome.matched);
    assert!(ctx.records().is_empty());
}

#[tokio::test]
async fn refused_connection_is_no_match_not_error() {
    let addr = closed_port().await;
    let t = template(
        r#"
id: refused
requests:
  - protocol: http
    path: ["{{BaseURL}}/"]
    matchers:
      - type: status
        status: [200]
        negative: true
"#,
    );
    let engine = engine_with(quiet_config(), vec![real_http()]);
    let mut ctx = context(&format!("http://{}", addr), &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(!outcome.matched, "a failed request must not feed a negated matcher");
    assert_eq!(ctx.requests_sent(), 1);
}

#[tokio::test]
async fn extraction_feeds_later_request_of_same_template() {
    let server = spawn_http(vec![
        ("/", 200, "<a href=\"/portal-7f3a\">portal</a>"),
        ("/portal-7f3a", 200, "Portal login"),
    ])
    .await;
    let t = template(
        r#"
id: two-step
requests:
  - protocol: http
    path: ["{{BaseURL}}/"]
    extractors:
      - type: regex
        name: portal
        group: 1
        internal: true
        regex: ['href="/(portal-[0-9a-f]+)"']
  - protocol: http
    path: ["{{BaseURL}}/{{portal}}"]
    matchers:
      - type: word
        words: ["Portal login"]
"#,
    );
    let engine = engine_with(quiet_config(), vec![real_http()]);
    let mut ctx = context(&server.base, &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();

    assert!(outcome.matched);
    assert_eq!(
        server.requests(),
        vec!["GET / HTTP/1.1", "GET /portal-7f3a HTTP/1.1"]
    );
    let records = ctx.into_records();
    assert_eq!(records.len(), 1);
    assert!(records[0].extracted.is_empty(), "internal values are hidden by default");
}
