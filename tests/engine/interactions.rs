use super::common::*;
use chrono::Utc;
use probekit::interact::{CorrelationRegistry, InteractionClient};
use probekit::types::Interaction;
use std::sync::Arc;
use std::time::Duration;

const SSRF: &str = r#"
id: blind-ssrf
info:
  severity: high
requests:
  - protocol: http
    path: ["{{BaseURL}}/fetch?url=http://{{interaction-url}}/"]
    matchers:
      - type: word
        part: interaction_protocol
        words: ["dns"]
"#;

fn dns_callback(unique_id: &str) -> Interaction {
    Interaction {
        protocol: "dns".to_string(),
        unique_id: unique_id.to_string(),
        raw_request: format!("{} IN A", unique_id),
        raw_response: String::new(),
        remote_address: Some("198.51.100.7".to_string()),
        timestamp: Utc::now(),
    }
}

/// The token is the first label of the host embedded in `url=`.
fn token_in(endpoint: &str) -> Option<String> {
    let host = endpoint.split("url=http://").nth(1)?;
    host.split('.').next().map(str::to_string)
}

#[tokio::test]
async fn callback_carrying_the_token_matches() {
    let registry = Arc::new(CorrelationRegistry::new("oast.test"));
    let listener = registry.clone();
    let http = ScriptedHttp::new(move |request, _| {
        if let Some(token) = token_in(&request.endpoint) {
            listener.record(dns_callback(&format!("{}.oast.test", token)));
        }
        Ok(http_view(request, 200, "queued"))
    });
    let engine = engine_with(quiet_config(), vec![http.clone()]).with_interactions(registry.clone());

    let t = template(SSRF);
    let mut ctx = context("http://app.test", &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();

    assert!(outcome.matched);
    let calls = http.calls();
    assert!(calls[0].starts_with("http://app.test/fetch?url=http://"));
    assert!(calls[0].ends_with(".oast.test/"));
    let token = token_in(&calls[0]).unwrap();
    assert!(!registry.is_registered(&token), "token is released after the wait");
}

#[tokio::test]
async fn no_callback_before_deadline_is_no_match() {
    let registry = Arc::new(CorrelationRegistry::new("oast.test"));
    let http = ScriptedHttp::new(|request, _| Ok(http_view(request, 200, "queued")));
    let engine = engine_with(quiet_config(), vec![http]).with_interactions(registry);

    let t = template(SSRF);
    let mut ctx = context("http://app.test", &t);
    let scope = ctx.variables().clone();
    let outcome = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap();
    assert!(!outcome.matched);
    assert!(ctx.records().is_empty());
}

#[tokio::test]
async fn uncorrelated_callbacks_are_dropped() {
    let registry = CorrelationRegistry::new("oast.test");
    let url = registry.register("abc123").unwrap();
    assert_eq!(url, "abc123.oast.test");

    assert!(!registry.record(dns_callback("zzz999.oast.test")));
    assert!(registry.record(dns_callback("abc123.oast.test")));

    let seen = registry
        .wait_for("abc123", Duration::from_millis(50), &probekit::CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].remote_address.as_deref(), Some("198.51.100.7"));
}

#[tokio::test]
async fn wait_ends_on_cancel() {
    let registry = CorrelationRegistry::new("oast.test");
    registry.register("tok").unwrap();
    let cancel = probekit::CancelSignal::new();
    cancel.cancel();
    let err = registry
        .wait_for("tok", Duration::from_secs(30), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn token_is_released_when_the_block_is_cancelled() {
    let registry = Arc::new(CorrelationRegistry::new("oast.test"));
    let cancel = probekit::CancelSignal::new();
    let seen_token = Arc::new(std::sync::Mutex::new(None));

    let trigger = cancel.clone();
    let seen = seen_token.clone();
    let http = ScriptedHttp::new(move |request, _| {
        *seen.lock().unwrap() = token_in(&request.endpoint);
        trigger.cancel();
        Err(probekit::ExecError::Cancelled)
    });
    let engine = engine_with(quiet_config(), vec![http]).with_interactions(registry.clone());

    let t = template(SSRF);
    let mut ctx =
        probekit::ExecutionContext::new("http://app.test", &t, &probekit::Variables::new(), cancel)
            .unwrap();
    let scope = ctx.variables().clone();
    let err = engine.run_template(&mut ctx, &t, &scope, None).await.unwrap_err();
    assert!(err.is_cancelled());

    let token = seen_token.lock().unwrap().clone().expect("request carried a token");
    assert!(!registry.is_registered(&token));
}
