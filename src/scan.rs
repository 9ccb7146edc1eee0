//! Scan Orchestrator.
//!
//! Fans the (target × template) cross-product out over a bounded worker pool.
//! Each run owns its Execution Context; runs never share mutable state besides
//! the engine's request ceilings, rate limiter and interaction registry.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cancel::CancelSignal;
use crate::catalog::Catalog;
use crate::context::ExecutionContext;
use crate::enums::{RunOutcome, TemplateKind};
use crate::error::ExecError;
use crate::runner::Engine;
use crate::types::{ResultRecord, Template};
use crate::workflow::{WorkflowEngine, WorkflowOutcome};

/// Destination of Result Records. Formatting and persistence live behind it.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn emit(&self, record: ResultRecord);
}

/// Forwards records into a channel. Records are dropped once the receiver
/// goes away.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<ResultRecord>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<ResultRecord>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn emit(&self, record: ResultRecord) {
        if self.sender.send(record).await.is_err() {
            debug!("result receiver closed; record dropped");
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<ResultRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn emit(&self, record: ResultRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

/// How one (target, template) run ended.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub target: String,
    pub template_id: String,
    pub outcome: RunOutcome,
    pub records: usize,
    pub requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was a fatal engine error rather than a configuration one.
    pub fatal: bool,
}

/// Aggregated outcome of a scan.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ScanSummary {
    pub matched: usize,
    pub unmatched: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub records: usize,
    pub fatal: usize,
    /// The scan-wide cancellation signal fired before the scan finished.
    pub interrupted: bool,
    pub runs: Vec<RunReport>,
}

impl ScanSummary {
    fn add(&mut self, report: RunReport) {
        match report.outcome {
            RunOutcome::Matched => self.matched += 1,
            RunOutcome::Unmatched => self.unmatched += 1,
            RunOutcome::Failed => self.failed += 1,
            RunOutcome::Cancelled => self.cancelled += 1,
        }
        if report.fatal {
            self.fatal += 1;
        }
        self.records += report.records;
        self.runs.push(report);
    }

    pub fn total_runs(&self) -> usize {
        self.runs.len()
    }

    /// Process exit status: 130 when interrupted, 1 when a run failed
    /// fatally, 0 otherwise. Non-matches and configuration errors are not
    /// failures of the scan.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.fatal > 0 {
            1
        } else {
            0
        }
    }
}

/// Drives runs to completion and reports their records.
#[derive(Clone, Debug)]
pub struct Scanner {
    engine: Arc<Engine>,
    catalog: Arc<Catalog>,
}

impl Scanner {
    pub fn new(engine: Engine, catalog: Catalog) -> Self {
        Self {
            engine: Arc::new(engine),
            catalog: Arc::new(catalog),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Runs every plain template and workflow of the catalog against every
    /// target.
    pub async fn scan_all(
        &self,
        targets: &[String],
        sink: &dyn ResultSink,
        cancel: &CancelSignal,
    ) -> ScanSummary {
        let no_filter: &[&str] = &[];
        let mut templates = self.catalog.select(TemplateKind::Template, no_filter);
        templates.extend(self.catalog.select(TemplateKind::Workflow, no_filter));
        self.run(targets, &templates, sink, cancel).await
    }

    /// Runs each (target, template) pair at most `concurrency` at a time.
    ///
    /// Records reach `sink` as their steps complete, in the order each run
    /// produced them; runs that end in cancellation or failure keep what they
    /// already delivered. Pairs not yet started when `cancel` fires are
    /// reported as cancelled without running.
    pub async fn run(
        &self,
        targets: &[String],
        templates: &[Arc<Template>],
        sink: &dyn ResultSink,
        cancel: &CancelSignal,
    ) -> ScanSummary {
        let concurrency = self.engine.config().concurrency.max(1);
        info!(
            targets = targets.len(),
            templates = templates.len(),
            concurrency,
            "starting scan"
        );

        let pairs = templates
            .iter()
            .flat_map(|template| targets.iter().map(move |target| (target, template)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runs = stream::iter(pairs)
            .map(|(target, template)| self.execute(target, template, cancel, Some(tx.clone())))
            .buffer_unordered(concurrency);

        let mut summary = ScanSummary::default();
        loop {
            tokio::select! {
                biased;
                Some(record) = rx.recv() => sink.emit(record).await,
                next = runs.next() => match next {
                    Some((report, _)) => summary.add(report),
                    None => break,
                },
            }
        }
        drop(runs);
        drop(tx);
        while let Some(record) = rx.recv().await {
            sink.emit(record).await;
        }
        summary.interrupted = cancel.is_cancelled();

        info!(
            matched = summary.matched,
            unmatched = summary.unmatched,
            failed = summary.failed,
            cancelled = summary.cancelled,
            records = summary.records,
            "scan finished"
        );
        summary
    }

    /// One (target, template) run from context creation to completion.
    pub async fn run_one(
        &self,
        target: &str,
        template: &Template,
        cancel: &CancelSignal,
    ) -> (RunReport, Vec<ResultRecord>) {
        self.execute(target, template, cancel, None).await
    }

    async fn execute(
        &self,
        target: &str,
        template: &Template,
        cancel: &CancelSignal,
        forward: Option<mpsc::UnboundedSender<ResultRecord>>,
    ) -> (RunReport, Vec<ResultRecord>) {
        let span = info_span!("run", template = %template.id, target = %target);
        async move {
            let mut report = RunReport {
                target: target.to_string(),
                template_id: template.id.clone(),
                outcome: RunOutcome::Unmatched,
                records: 0,
                requests: 0,
                error: None,
                fatal: false,
            };
            if cancel.is_cancelled() {
                report.outcome = RunOutcome::Cancelled;
                return (report, Vec::new());
            }

            let globals = self.engine.config().global_variables();
            let mut ctx = match ExecutionContext::new(target, template, &globals, cancel.clone()) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(error = %e, "run not started");
                    report.outcome = RunOutcome::Failed;
                    report.error = Some(e.to_string());
                    return (report, Vec::new());
                }
            };

            if let Some(tx) = forward {
                ctx.forward_records(tx);
            }
            let result = self.drive(&mut ctx, template).await;
            report.requests = ctx.requests_sent();
            match result {
                Ok(true) => report.outcome = RunOutcome::Matched,
                Ok(false) => report.outcome = RunOutcome::Unmatched,
                Err(ExecError::Cancelled) => {
                    debug!("run cancelled");
                    report.outcome = RunOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(error = %e, "run failed");
                    report.outcome = RunOutcome::Failed;
                    report.fatal = e.is_fatal();
                    report.error = Some(e.to_string());
                }
            }

            let records = ctx.into_records();
            report.records = records.len();
            (report, records)
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, ctx: &mut ExecutionContext, template: &Template) -> Result<bool, ExecError> {
        match template.kind() {
            TemplateKind::Template => {
                let scope = ctx.variables().clone();
                let outcome = self.engine.run_template(ctx, template, &scope, None).await?;
                Ok(outcome.matched)
            }
            TemplateKind::Workflow => {
                let mut trace = WorkflowOutcome::default();
                WorkflowEngine::new(&self.engine, &self.catalog)
                    .run(ctx, template, &mut trace)
                    .await?;
                Ok(trace.matched)
            }
            TemplateKind::AdvancedWorkflow => Err(ExecError::config(format!(
                "template '{}' carries an executable code block, which is not supported",
                template.id
            ))),
        }
    }
}
