//! Runs one template's Request Blocks against one target.
//!
//! Blocks run in declaration order and, within a block, compiled requests run
//! one after another. Every dispatch acquires a global permit, a per-template
//! permit and a rate-limit token, then races the executor against the request
//! deadline and the scan's cancellation signal. Transport failures are retried
//! with exponential backoff.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::ScanConfig;
use crate::context::{ExecutionContext, Variables};
use crate::enums::{ExtractScope, InternalVariablePolicy, TemplateKind};
use crate::error::{ExecError, TransportErrorKind};
use crate::evaluate::{CelEvaluator, evaluate_matchers};
use crate::extract::evaluate_extractors;
use crate::interact::InteractionClient;
use crate::parts::is_interaction_part;
use crate::primitives::exponential_backoff;
use crate::protocols::{CompiledRequest, ExecutorRegistry, ProtocolExecutor};
use crate::ratelimit::{RateLimiter, TokenBucket, Unlimited};
use crate::response::ResponseView;
use crate::types::{Extracted, RequestBlock, ResultRecord, Template};

/// Placeholder bound to the out-of-band listener URL.
pub const INTERACTION_URL_VAR: &str = "interaction-url";

/// What one template invocation produced.
#[derive(Clone, Debug, Default)]
pub struct TemplateOutcome {
    /// Whether any Request Block fired.
    pub matched: bool,
    /// Names of fired matchers across all blocks, in firing order.
    pub matched_names: Vec<String>,
    /// Everything extracted, internal values included.
    pub extracted: Extracted,
    /// Result Records emitted into the context.
    pub records: usize,
}

impl TemplateOutcome {
    fn absorb(&mut self, other: RequestOutcome) {
        if other.fired {
            self.matched = true;
            for name in other.matched_names {
                if !self.matched_names.contains(&name) {
                    self.matched_names.push(name);
                }
            }
        }
        self.extracted.extend(other.extracted);
    }
}

#[derive(Debug, Default)]
struct RequestOutcome {
    fired: bool,
    matched_names: Vec<String>,
    extracted: Extracted,
}

/// Shared, read-mostly machinery behind every run of a scan.
pub struct Engine {
    config: ScanConfig,
    executors: ExecutorRegistry,
    limiter: Arc<dyn RateLimiter>,
    interactions: Option<Arc<dyn InteractionClient>>,
    cel: Option<Arc<dyn CelEvaluator>>,
    global_permits: Arc<Semaphore>,
    template_permits: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("executors", &self.executors)
            .field("interactions", &self.interactions.is_some())
            .field("cel", &self.cel.is_some())
            .finish()
    }
}

impl Engine {
    /// An engine using `executors`, with the rate limiter and request ceilings
    /// described by `config` and the default expression evaluator.
    pub fn new(config: ScanConfig, executors: ExecutorRegistry) -> Self {
        let limiter: Arc<dyn RateLimiter> = if config.rate_limit == 0 {
            Arc::new(Unlimited)
        } else {
            Arc::new(TokenBucket::per_second(config.rate_limit))
        };
        Engine {
            global_permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            template_permits: RwLock::new(HashMap::new()),
            limiter,
            interactions: None,
            cel: default_cel(),
            executors,
            config,
        }
    }

    /// An engine with the built-in HTTP, DNS and network executors.
    pub fn from_config(config: ScanConfig) -> Result<Self, ExecError> {
        let executors = ExecutorRegistry::with_defaults(&config)?;
        Ok(Self::new(config, executors))
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_interactions(mut self, client: Arc<dyn InteractionClient>) -> Self {
        self.interactions = Some(client);
        self
    }

    pub fn with_cel(mut self, cel: Option<Arc<dyn CelEvaluator>>) -> Self {
        self.cel = cel;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Runs every Request Block of `template` in order.
    ///
    /// `scope` is the binding set the template starts from; the template's own
    /// variables are added without overriding it, and values extracted by one
    /// request are visible to every later request of the same invocation.
    /// Records for fired requests are pushed into `ctx` as they happen.
    pub async fn run_template(
        &self,
        ctx: &mut ExecutionContext,
        template: &Template,
        scope: &Variables,
        workflow_id: Option<&str>,
    ) -> Result<TemplateOutcome, ExecError> {
        match template.kind() {
            TemplateKind::Template => {}
            TemplateKind::Workflow => {
                return Err(ExecError::config(format!(
                    "template '{}' is a workflow and cannot run as a step",
                    template.id
                )));
            }
            TemplateKind::AdvancedWorkflow => {
                return Err(ExecError::config(format!(
                    "template '{}' carries an executable code block, which is not supported",
                    template.id
                )));
            }
        }

        let mut local = scope.clone();
        local.seed_template(template)?;

        let mut outcome = TemplateOutcome::default();
        for (index, block) in template.requests.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let block_outcome = self
                .run_block(ctx, template, index, block, &mut local, workflow_id, &mut outcome)
                .await;
            match block_outcome {
                Ok(()) => {}
                Err(e @ (ExecError::Cancelled | ExecError::Fatal { .. })) => return Err(e),
                Err(e) => warn!(
                    template = %template.id,
                    block = index,
                    error = %e,
                    "request block skipped"
                ),
            }
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_block(
        &self,
        ctx: &mut ExecutionContext,
        template: &Template,
        index: usize,
        block: &RequestBlock,
        local: &mut Variables,
        workflow_id: Option<&str>,
        outcome: &mut TemplateOutcome,
    ) -> Result<(), ExecError> {
        let protocol = block.protocol();
        let executor = self.executors.get(protocol).ok_or_else(|| {
            ExecError::config(format!("no executor registered for protocol {}", protocol))
        })?;

        let lease = self.register_interaction(block, local)?;
        let stop_at_first = block.stop_at_first_match || self.config.stop_at_first_match;

        let compiled = executor.compile(block, local);
        let mut pending: Vec<ResponseView> = Vec::new();
        for (req_index, request) in compiled.into_iter().enumerate() {
            let request = match request {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        template = %template.id,
                        block = index,
                        request = req_index,
                        error = %e,
                        "request not compiled"
                    );
                    continue;
                }
            };

            ctx.note_request();
            let view = match self
                .dispatch(executor.as_ref(), &request, &template.id, ctx.cancel_signal())
                .await
            {
                Ok(view) => view,
                Err(e @ (ExecError::Cancelled | ExecError::Fatal { .. })) => return Err(e),
                Err(e) => {
                    warn!(
                        template = %template.id,
                        endpoint = %request.endpoint,
                        error = %e,
                        "request failed; treated as no match"
                    );
                    continue;
                }
            };

            if lease.is_some() {
                pending.push(view);
                continue;
            }
            let result = self.evaluate(ctx, template, block, &view, local, workflow_id);
            let fired = result.fired;
            local.merge(&result.extracted);
            outcome.absorb(result);
            if fired && stop_at_first {
                break;
            }
        }

        if let Some(lease) = lease {
            let wait = if pending.is_empty() {
                std::time::Duration::ZERO
            } else {
                self.config.interaction_wait()
            };
            let interactions = lease
                .client
                .wait_for(&lease.token, wait, ctx.cancel_signal())
                .await?;
            debug!(template = %template.id, count = interactions.len(), "interactions received");
            for mut view in pending {
                view.attach_interactions(&interactions);
                let result = self.evaluate(ctx, template, block, &view, local, workflow_id);
                let fired = result.fired;
                local.merge(&result.extracted);
                outcome.absorb(result);
                if fired && stop_at_first {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Registers an interaction token when any matcher of `block` reads an
    /// interaction part, and binds the listener URL.
    fn register_interaction(
        &self,
        block: &RequestBlock,
        local: &mut Variables,
    ) -> Result<Option<InteractionLease>, ExecError> {
        let needs = block
            .matchers
            .iter()
            .any(|m| m.part.as_deref().is_some_and(is_interaction_part));
        if !needs {
            return Ok(None);
        }
        let Some(client) = &self.interactions else {
            warn!("block matches on interactions but no interaction client is configured");
            return Ok(None);
        };
        let token = client.new_token();
        let url = client.register(&token)?;
        local.set(INTERACTION_URL_VAR, url);
        Ok(Some(InteractionLease {
            client: client.clone(),
            token,
        }))
    }

    fn evaluate(
        &self,
        ctx: &mut ExecutionContext,
        template: &Template,
        block: &RequestBlock,
        view: &ResponseView,
        local: &Variables,
        workflow_id: Option<&str>,
    ) -> RequestOutcome {
        let cel = self.cel.as_deref();
        let matched = evaluate_matchers(&block.matchers, block.matchers_condition, view, local, cel);

        let extracted = if block.extract == ExtractScope::AfterMatch && !matched.fired {
            Extracted::new()
        } else {
            evaluate_extractors(&block.extractors, view, local, cel)
        };

        if matched.fired {
            let reported = match self.config.internal_variables {
                InternalVariablePolicy::Hide => extracted.without_internal(),
                InternalVariablePolicy::Report => extracted.clone(),
            };
            debug!(
                template = %template.id,
                matched_at = %view.matched_at,
                matchers = ?matched.matched_names,
                "matched"
            );
            ctx.push_record(ResultRecord {
                template_id: template.id.clone(),
                template_name: template.info.name.clone(),
                workflow_id: workflow_id.map(str::to_string),
                target: ctx.target.clone(),
                matched_at: view.matched_at.clone(),
                timestamp: Utc::now(),
                matcher_names: matched.matched_names.clone(),
                extracted: reported,
                severity: template.info.severity,
                tags: template.info.tags.clone(),
                metadata: template.info.metadata.clone(),
                request: view.request.clone(),
            });
        }

        RequestOutcome {
            fired: matched.fired,
            matched_names: matched.matched_names,
            extracted,
        }
    }

    /// Dispatches `request`, retrying transport failures up to the configured
    /// count.
    pub async fn dispatch(
        &self,
        executor: &dyn ProtocolExecutor,
        request: &CompiledRequest,
        template_id: &str,
        cancel: &CancelSignal,
    ) -> Result<ResponseView, ExecError> {
        let attempts = self.config.retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(executor, request, template_id, cancel).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = exponential_backoff(
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        attempt,
                    );
                    debug!(
                        endpoint = %request.endpoint,
                        attempt,
                        ?delay,
                        error = %e,
                        "transport error; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &self,
        executor: &dyn ProtocolExecutor,
        request: &CompiledRequest,
        template_id: &str,
        cancel: &CancelSignal,
    ) -> Result<ResponseView, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let _global = acquire(self.global_permits.clone(), cancel).await?;
        let _template = acquire(self.template_semaphore(template_id).await, cancel).await?;
        self.limiter.acquire(1, cancel).await?;

        let deadline = self.config.timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            result = tokio::time::timeout(deadline, executor.execute(request)) => match result {
                Ok(r) => r,
                Err(_) => Err(ExecError::transport(
                    TransportErrorKind::Timeout,
                    &request.endpoint,
                    format!("no response within {:?}", deadline),
                )),
            },
        }
    }

    async fn template_semaphore(&self, template_id: &str) -> Arc<Semaphore> {
        {
            let map = self.template_permits.read().await;
            if let Some(sem) = map.get(template_id) {
                return sem.clone();
            }
        }
        let mut map = self.template_permits.write().await;
        map.entry(template_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.template_concurrency.max(1))))
            .clone()
    }
}

/// A registered interaction token, released when the block is done with it.
struct InteractionLease {
    client: Arc<dyn InteractionClient>,
    token: String,
}

impl Drop for InteractionLease {
    fn drop(&mut self) {
        self.client.release(&self.token);
    }
}

async fn acquire(
    semaphore: Arc<Semaphore>,
    cancel: &CancelSignal,
) -> Result<OwnedSemaphorePermit, ExecError> {
    tokio::select! {
        permit = semaphore.acquire_owned() => {
            permit.map_err(|_| ExecError::fatal("request ceiling closed"))
        }
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
    }
}

#[cfg(feature = "cel-eval")]
fn default_cel() -> Option<Arc<dyn CelEvaluator>> {
    Some(Arc::new(crate::evaluate::DefaultCelEvaluator))
}

#[cfg(not(feature = "cel-eval"))]
fn default_cel() -> Option<Arc<dyn CelEvaluator>> {
    None
}
