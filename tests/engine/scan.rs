use super::common::*;
use probekit::cancel::CancelSignal;
use probekit::catalog::Catalog;
use probekit::enums::{RunOutcome, TemplateKind};
use probekit::protocols::{HttpExecutor, ProtocolExecutor};
use probekit::scan::{ChannelSink, CollectingSink, Scanner};
use std::sync::Arc;
use tokio::sync::mpsc;

const EXPOSED_ENV: &str = r#"
id: exposed-env
info:
  name: Exposed .env file
  author: probe
  severity: high
  tags: [exposure, config]
requests:
  - protocol: http
    path: ["{{BaseURL}}/.env"]
    matchers-condition: and
    matchers:
      - type: status
        status: [200]
      - type: word
        words: ["DB_PASSWORD="]
"#;

const SERVER_HEADER: &str = r#"
id: powered-by
info:
  severity: info
requests:
  - protocol: http
    path: ["{{BaseURL}}/"]
    matchers:
      - type: word
        part: header
        words: ["probe-test"]
"#;

fn real_http() -> Arc<dyn ProtocolExecutor> {
    Arc::new(HttpExecutor::new(&quiet_config()).expect("client builds"))
}

#[tokio::test]
async fn cross_product_is_scanned_and_summarized() {
    let vulnerable = spawn_http(vec![("/.env", 200, "DB_PASSWORD=hunter2\n"), ("/", 200, "home")]).await;
    let clean = spawn_http(vec![("/", 200, "home")]).await;

    let catalog = Catalog::new(vec![template(EXPOSED_ENV), template(SERVER_HEADER)]);
    let scanner = Scanner::new(engine_with(quiet_config(), vec![real_http()]), catalog);
    let sink = CollectingSink::new();
    let targets = vec![vulnerable.base.clone(), clean.base.clone()];

    let summary = scanner.scan_all(&targets, &sink, &CancelSignal::new()).await;

    assert_eq!(summary.total_runs(), 4);
    // .env on one target, the header on both.
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.records, 3);
    assert_eq!(summary.exit_code(), 0);
    assert!(!summary.interrupted);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    let env = records.iter().find(|r| r.template_id == "exposed-env").unwrap();
    assert_eq!(env.target, vulnerable.base);
    assert_eq!(env.matched_at, format!("{}/.env", vulnerable.base));
    assert_eq!(env.template_name.as_deref(), Some("Exposed .env file"));
    assert_eq!(env.tags, vec!["exposure", "config"]);
    assert_eq!(env.severity, probekit::SeverityLevel::High);
}

#[tokio::test]
async fn channel_sink_streams_records() {
    let server = spawn_http(vec![("/", 200, "home")]).await;
    let scanner = Scanner::new(
        engine_with(quiet_config(), vec![real_http()]),
        Catalog::new(vec![template(SERVER_HEADER)]),
    );
    let (tx, mut rx) = mpsc::channel(8);
    let sink = ChannelSink::new(tx);

    let summary = scanner
        .scan_all(&[server.base.clone()], &sink, &CancelSignal::new())
        .await;
    drop(sink);

    assert_eq!(summary.matched, 1);
    let record = rx.recv().await.expect("one record");
    assert_eq!(record.template_id, "powered-by");
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn severity_filter_narrows_the_run_set() {
    let server = spawn_http(vec![("/", 200, "home")]).await;
    let catalog = Catalog::new(vec![template(EXPOSED_ENV), template(SERVER_HEADER)]);
    let selected = catalog.select(TemplateKind::Template, &["high,critical"]);
    assert_eq!(selected.len(), 1);

    let scanner = Scanner::new(engine_with(quiet_config(), vec![real_http()]), catalog);
    let sink = CollectingSink::new();
    let summary = scanner
        .run(&[server.base.clone()], &selected, &sink, &CancelSignal::new())
        .await;

    assert_eq!(summary.total_runs(), 1);
    assert_eq!(summary.runs[0].template_id, "exposed-env");
    assert_eq!(summary.runs[0].outcome, RunOutcome::Unmatched);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn workflows_run_alongside_templates() {
    let server = spawn_http(vec![("/", 200, "home"), ("/.env", 200, "DB_PASSWORD=x")]).await;
    let workflow = template(
        r#"
id: env-after-banner
workflows:
  - template: powered-by
    subtemplates:
      - template: exposed-env
"#,
    );
    let catalog = Catalog::new(vec![template(SERVER_HEADER), template(EXPOSED_ENV), workflow]);
    let scanner = Scanner::new(engine_with(quiet_config(), vec![real_http()]), catalog);
    let sink = CollectingSink::new();

    let summary = scanner
        .scan_all(&[server.base.clone()], &sink, &CancelSignal::new())
        .await;

    // Two plain templates plus one workflow.
    assert_eq!(summary.total_runs(), 3);
    assert_eq!(summary.matched, 3);
    let from_workflow: Vec<_> = sink
        .records()
        .into_iter()
        .filter(|r| r.workflow_id.as_deref() == Some("env-after-banner"))
        .map(|r| r.template_id)
        .collect();
    assert_eq!(from_workflow, vec!["powered-by", "exposed-env"]);
}

#[tokio::test]
async fn missing_executor_is_a_config_failure_not_fatal() {
    let catalog = Catalog::new(vec![template(
        r#"
id: dns-only
dns:
  - name: "{{FQDN}}"
    matchers:
      - type: status
        status: [0]
"#,
    )]);
    let scanner = Scanner::new(engine_with(quiet_config(), vec![real_http()]), catalog);
    let sink = CollectingSink::new();
    let summary = scanner
        .scan_all(&["example.com".to_string()], &sink, &CancelSignal::new())
        .await;

    // The block is skipped with a warning; the run itself completes.
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.exit_code(), 0);
}

/// Answers at once, except `/slow`, which waits for `release`.
struct Gated {
    release: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl ProtocolExecutor for Gated {
    fn protocol(&self) -> probekit::Protocol {
        probekit::Protocol::Http
    }

    fn compile(
        &self,
        block: &probekit::RequestBlock,
        vars: &probekit::Variables,
    ) -> Vec<Result<probekit::protocols::CompiledRequest, probekit::ExecError>> {
        match &block.request {
            probekit::ProtocolRequest::Http(request) => {
                probekit::protocols::http::compile_http(request, vars)
            }
            _ => vec![Err(probekit::ExecError::config("not an http block"))],
        }
    }

    async fn execute(
        &self,
        request: &probekit::protocols::CompiledRequest,
    ) -> Result<probekit::ResponseView, probekit::ExecError> {
        if request.endpoint.ends_with("/slow") {
            self.release.notified().await;
        }
        Ok(http_view(request, 200, "ok"))
    }
}

#[tokio::test]
async fn records_stream_while_the_workflow_is_still_running() {
    let fast = template(
        "id: fast-step\nrequests:\n  - protocol: http\n    path: [\"{{BaseURL}}/fast\"]\n    matchers:\n      - type: status\n        status: [200]\n",
    );
    let slow = template(
        "id: slow-step\nrequests:\n  - protocol: http\n    path: [\"{{BaseURL}}/slow\"]\n    matchers:\n      - type: status\n        status: [200]\n",
    );
    let workflow = template(
        r#"
id: fast-then-slow
workflows:
  - template: fast-step
    subtemplates:
      - template: slow-step
"#,
    );
    let release = Arc::new(tokio::sync::Notify::new());
    let gated: Arc<dyn ProtocolExecutor> = Arc::new(Gated {
        release: release.clone(),
    });
    let catalog = Catalog::new(vec![fast, slow, workflow]);
    let scanner = Scanner::new(engine_with(quiet_config(), vec![gated]), catalog);
    let (tx, mut rx) = mpsc::channel(8);
    let sink = ChannelSink::new(tx);
    let cancel = CancelSignal::new();
    let targets = vec!["http://app.test".to_string()];
    let selected = scanner.catalog().select(TemplateKind::Workflow, &[] as &[&str]);

    let scan = scanner.run(&targets, &selected, &sink, &cancel);
    let observe = async {
        let first = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("the first step's record arrives before the workflow ends")
            .expect("channel open");
        release.notify_one();
        first
    };
    let (summary, first) = tokio::join!(scan, observe);
    drop(sink);

    assert_eq!(first.template_id, "fast-step");
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.records, 2);
    let second = rx.recv().await.expect("second record");
    assert_eq!(second.template_id, "slow-step");
    assert!(rx.recv().await.is_none());
}
