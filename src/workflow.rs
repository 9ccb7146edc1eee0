//! Workflow engine.
//!
//! A workflow tree is flattened into an arena of [`StepNode`]s indexed by
//! position, then walked depth-first, left-to-right, preorder against one
//! Execution Context.
//!
//! Variable visibility follows execution order. A step sees the context plus
//! the extractions of its ancestors (which are only merged into the context
//! once their children are done). A step's extractions are merged into the
//! context after its children complete, whether or not it matched, so later
//! siblings see them and earlier steps never do. Blocks that extract only
//! after a match (`extract: after-match`) produce nothing to merge otherwise.

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::context::ExecutionContext;
use crate::enums::StepState;
use crate::error::ExecError;
use crate::runner::Engine;
use crate::types::{Extracted, Template, WorkflowStep};

/// Index of a step in a [`WorkflowPlan`].
pub type StepId = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepNode {
    /// ID of the template the step invokes.
    pub template: String,
    pub parent: Option<StepId>,
    /// Children visited when the step matched.
    pub on_match: Vec<StepId>,
    /// Children visited when the step extracted anything.
    pub on_extract: Vec<StepId>,
    /// Children visited when the named matcher fired.
    pub branches: Vec<(String, Vec<StepId>)>,
    pub stop_at_first_match: bool,
}

/// Arena form of a workflow tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkflowPlan {
    nodes: Vec<StepNode>,
    roots: Vec<StepId>,
}

impl WorkflowPlan {
    pub fn build(steps: &[WorkflowStep]) -> Self {
        let mut plan = WorkflowPlan::default();
        plan.roots = steps.iter().map(|s| plan.add(s, None)).collect();
        plan
    }

    fn add(&mut self, step: &WorkflowStep, parent: Option<StepId>) -> StepId {
        let id = self.nodes.len();
        self.nodes.push(StepNode {
            template: step.template.clone(),
            parent,
            on_match: Vec::new(),
            on_extract: Vec::new(),
            branches: Vec::new(),
            stop_at_first_match: step.stop_at_first_match,
        });
        let on_match: Vec<StepId> = step
            .subtemplates
            .iter()
            .map(|s| self.add(s, Some(id)))
            .collect();
        let on_extract: Vec<StepId> = step.on_extract.iter().map(|s| self.add(s, Some(id))).collect();
        let branches: Vec<(String, Vec<StepId>)> = step
            .matchers
            .iter()
            .map(|b| {
                let kids = b.subtemplates.iter().map(|s| self.add(s, Some(id))).collect();
                (b.name.clone(), kids)
            })
            .collect();
        let node = &mut self.nodes[id];
        node.on_match = on_match;
        node.on_extract = on_extract;
        node.branches = branches;
        id
    }

    pub fn roots(&self) -> &[StepId] {
        &self.roots
    }

    pub fn node(&self, id: StepId) -> Option<&StepNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every step, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = (StepId, &StepNode)> {
        self.nodes.iter().enumerate()
    }

    /// Number of ancestors of `id`.
    pub fn depth(&self, id: StepId) -> usize {
        let mut depth = 0;
        let mut current = self.node(id).and_then(|n| n.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.node(parent).and_then(|n| n.parent);
        }
        depth
    }
}

/// One state transition of one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepEvent {
    pub step: StepId,
    pub template: String,
    pub state: StepState,
}

/// Result of walking a workflow for one target.
#[derive(Clone, Debug, Default)]
pub struct WorkflowOutcome {
    /// Whether any step matched.
    pub matched: bool,
    /// Transitions in the order they happened.
    pub events: Vec<StepEvent>,
}

impl WorkflowOutcome {
    /// Final state of each visited step.
    pub fn final_state(&self, step: StepId) -> Option<StepState> {
        self.events
            .iter()
            .rev()
            .find(|e| e.step == step && e.state != StepState::Done)
            .map(|e| e.state)
    }
}

pub struct WorkflowEngine<'a> {
    engine: &'a Engine,
    catalog: &'a Catalog,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(engine: &'a Engine, catalog: &'a Catalog) -> Self {
        Self { engine, catalog }
    }

    /// Walks `workflow`'s step tree for the target owning `ctx`.
    ///
    /// A Fatal transition aborts the rest of the walk. The error is returned
    /// and `trace` keeps every transition recorded up to that point, as the
    /// context keeps every record already emitted.
    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        workflow: &Template,
        trace: &mut WorkflowOutcome,
    ) -> Result<(), ExecError> {
        let plan = WorkflowPlan::build(&workflow.workflows);
        let walk = Walk {
            engine: self.engine,
            catalog: self.catalog,
            plan: &plan,
            workflow_id: &workflow.id,
        };
        walk.visit(ctx, plan.roots(), Extracted::new(), trace).await?;
        Ok(())
    }
}

struct Walk<'w> {
    engine: &'w Engine,
    catalog: &'w Catalog,
    plan: &'w WorkflowPlan,
    workflow_id: &'w str,
}

impl<'w> Walk<'w> {
    /// Visits `siblings` in order. `pending` holds ancestor extractions that
    /// are not merged into the context yet. Returns whether any sibling matched.
    fn visit<'b>(
        &'b self,
        ctx: &'b mut ExecutionContext,
        siblings: &'b [StepId],
        pending: Extracted,
        trace: &'b mut WorkflowOutcome,
    ) -> BoxFuture<'b, Result<bool, ExecError>> {
        async move {
            let mut any = false;
            for &id in siblings {
                if ctx.is_cancelled() {
                    return Err(ExecError::Cancelled);
                }
                let node = self
                    .plan
                    .node(id)
                    .ok_or_else(|| ExecError::fatal(format!("workflow step {} out of range", id)))?;
                let matched = self.step(ctx, id, node, &pending, trace).await?;
                any |= matched;
                if matched && node.stop_at_first_match {
                    debug!(step = id, "stop at first match; skipping remaining siblings");
                    break;
                }
            }
            Ok(any)
        }
        .boxed()
    }

    async fn step(
        &self,
        ctx: &mut ExecutionContext,
        id: StepId,
        node: &StepNode,
        pending: &Extracted,
        trace: &mut WorkflowOutcome,
    ) -> Result<bool, ExecError> {
        let mark = |trace: &mut WorkflowOutcome, state| {
            trace.events.push(StepEvent {
                step: id,
                template: node.template.clone(),
                state,
            })
        };

        mark(trace, StepState::Running);
        let Some(template) = self.catalog.get(&node.template) else {
            mark(trace, StepState::Fatal);
            return Err(ExecError::fatal(format!(
                "workflow '{}' references unknown template '{}'",
                self.workflow_id, node.template
            )));
        };

        let scope = ctx.variables().overlay(pending);
        let outcome = match self
            .engine
            .run_template(ctx, template, &scope, Some(self.workflow_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(e @ ExecError::Cancelled) => return Err(e),
            Err(e @ ExecError::Fatal { .. }) => {
                mark(trace, StepState::Fatal);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    workflow = %self.workflow_id,
                    template = %node.template,
                    error = %e,
                    "workflow step failed; branch skipped"
                );
                mark(trace, StepState::Unmatched);
                mark(trace, StepState::Done);
                return Ok(false);
            }
        };

        let matched = outcome.matched;
        mark(
            trace,
            if matched {
                StepState::Matched
            } else {
                StepState::Unmatched
            },
        );
        if matched {
            trace.matched = true;
        }

        let mut inherited = pending.clone();
        inherited.extend(outcome.extracted.clone());

        if matched && !node.on_match.is_empty() {
            self.visit(ctx, &node.on_match, inherited.clone(), trace).await?;
        }
        for (name, children) in &node.branches {
            if outcome.matched_names.iter().any(|n| n == name) {
                self.visit(ctx, children, inherited.clone(), trace).await?;
            }
        }
        if !outcome.extracted.is_empty() && !node.on_extract.is_empty() {
            self.visit(ctx, &node.on_extract, inherited, trace).await?;
        }

        if !outcome.extracted.is_empty() {
            ctx.merge(&outcome.extracted);
        }
        mark(trace, StepState::Done);
        Ok(matched)
    }
}
