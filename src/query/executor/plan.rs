//! Execution plans
//!
//! A [`SelectExecutionPlan`] is a chain of steps that produces a fresh stream on
//! every `start`. An [`UpdateExecutionPlan`] wraps one for mutating statements:
//! the first run drains the pipeline into a buffer so that side effects happen
//! exactly once, and later starts replay the buffer until the plan is reset.

use super::context::CommandContext;
use super::record::Row;
use super::step::{ExecutionStep, StepDescription};
use super::stream::{self, StreamBox};
use super::ExecutionResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default indentation used when printing plan trees
pub const DEFAULT_INDENT: usize = 2;

/// Serializable description of a plan, detached from its execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDescription {
    pub plan_type: String,
    pub pretty_print: String,
    pub steps: Vec<StepDescription>,
    pub cost_ns: Option<u64>,
}

/// Read pipeline: an ordered chain of steps
#[derive(Debug, Clone, Default)]
pub struct SelectExecutionPlan {
    last: Option<Box<ExecutionStep>>,
}

impl SelectExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; it reads from the current last step
    pub fn chain(&mut self, mut step: ExecutionStep) {
        if let Some(prev) = self.last.take() {
            step.set_prev(*prev);
        }
        self.last = Some(Box::new(step));
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// Steps from source to sink
    pub fn steps(&self) -> Vec<&ExecutionStep> {
        let mut steps = Vec::new();
        let mut current = self.last.as_deref();
        while let Some(step) = current {
            steps.push(step);
            current = step.prev();
        }
        steps.reverse();
        steps
    }

    pub fn last_step(&self) -> Option<&ExecutionStep> {
        self.last.as_deref()
    }

    /// Enable or disable cost collection on every step, sub-plans included
    pub fn set_profiling(&mut self, profiling: bool) {
        let mut current = self.last.as_deref_mut();
        while let Some(step) = current {
            step.set_profiling(profiling);
            for plan in step.sub_plans_mut() {
                plan.set_profiling(profiling);
            }
            current = step.prev_mut();
        }
    }

    /// Start the pipeline; a plan without steps produces nothing
    pub fn start(&self, ctx: &mut CommandContext) -> ExecutionResult<StreamBox> {
        match &self.last {
            Some(last) => last.start(ctx),
            None => Ok(stream::empty()),
        }
    }

    /// Nothing is retained between starts, so there is nothing to clear
    pub fn reset(&mut self, _ctx: &mut CommandContext) -> ExecutionResult<()> {
        Ok(())
    }

    /// Independent deep copy with fresh cost counters
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Copy whose steps report into this plan's cost counters
    pub(crate) fn share(&self) -> Self {
        SelectExecutionPlan {
            last: self.last.as_ref().map(|step| Box::new(step.share())),
        }
    }

    pub fn can_be_cached(&self) -> bool {
        self.steps().iter().all(|s| s.can_be_cached())
    }

    pub fn pretty_print(&self, depth: usize, indent: usize) -> String {
        self.steps()
            .iter()
            .map(|s| s.pretty_print(depth, indent))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Total cost of the pipeline, when profiled
    pub fn cost(&self) -> Option<u64> {
        self.last.as_deref().filter(|s| s.is_profiling()).map(ExecutionStep::cost)
    }

    pub fn introspect(&self) -> PlanDescription {
        PlanDescription {
            plan_type: "SelectExecutionPlan".to_string(),
            pretty_print: self.pretty_print(0, DEFAULT_INDENT),
            steps: self.steps().iter().map(|s| s.introspect()).collect(),
            cost_ns: self.cost(),
        }
    }

    pub fn to_json(&self) -> ExecutionResult<String> {
        Ok(serde_json::to_string_pretty(&self.introspect())?)
    }

    /// Run the pipeline to completion
    pub fn execute_to_vec(&self, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let stream = self.start(ctx)?;
        stream::drain(stream, ctx)
    }
}

/// Execution state of a mutating plan
#[derive(Debug, Default)]
pub enum PlanState {
    #[default]
    Unexecuted,
    Materialized(Vec<Row>),
}

/// Mutating pipeline (INSERT, UPDATE, DELETE, FOR EACH, RETRY) whose result is
/// buffered on first execution
#[derive(Debug)]
pub struct UpdateExecutionPlan {
    pipeline: SelectExecutionPlan,
    state: PlanState,
}

impl Clone for UpdateExecutionPlan {
    /// The buffer is not shared: a clone starts unexecuted
    fn clone(&self) -> Self {
        UpdateExecutionPlan {
            pipeline: self.pipeline.clone(),
            state: PlanState::Unexecuted,
        }
    }
}

impl UpdateExecutionPlan {
    pub fn new(pipeline: SelectExecutionPlan) -> Self {
        UpdateExecutionPlan {
            pipeline,
            state: PlanState::Unexecuted,
        }
    }

    pub fn pipeline(&self) -> &SelectExecutionPlan {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut SelectExecutionPlan {
        &mut self.pipeline
    }

    pub fn chain(&mut self, step: ExecutionStep) {
        self.pipeline.chain(step);
    }

    pub fn state(&self) -> &PlanState {
        &self.state
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.state, PlanState::Materialized(_))
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> ExecutionResult<()> {
        let rows = self.pipeline.execute_to_vec(ctx)?;
        debug!("Mutating plan produced {} rows", rows.len());
        self.state = PlanState::Materialized(rows);
        Ok(())
    }

    /// Run the pipeline on first use, then expose the buffered rows
    pub fn start(&mut self, ctx: &mut CommandContext) -> ExecutionResult<StreamBox> {
        if let PlanState::Unexecuted = self.state {
            self.execute(ctx)?;
        }
        match &self.state {
            PlanState::Materialized(rows) => Ok(stream::from_rows(rows.clone())),
            PlanState::Unexecuted => Ok(stream::empty()),
        }
    }

    /// Drop the buffer and run the pipeline again
    pub fn reset(&mut self, ctx: &mut CommandContext) -> ExecutionResult<()> {
        self.state = PlanState::Unexecuted;
        self.execute(ctx)
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn can_be_cached(&self) -> bool {
        self.pipeline.can_be_cached()
    }

    pub fn pretty_print(&self, depth: usize, indent: usize) -> String {
        self.pipeline.pretty_print(depth, indent)
    }

    pub fn introspect(&self) -> PlanDescription {
        PlanDescription {
            plan_type: "UpdateExecutionPlan".to_string(),
            ..self.pipeline.introspect()
        }
    }

    pub fn to_json(&self) -> ExecutionResult<String> {
        Ok(serde_json::to_string_pretty(&self.introspect())?)
    }

    pub fn execute_to_vec(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let stream = self.start(ctx)?;
        stream::drain(stream, ctx)
    }
}

/// Any executable plan
#[derive(Debug, Clone)]
pub enum ExecutionPlan {
    Select(SelectExecutionPlan),
    Update(UpdateExecutionPlan),
}

impl ExecutionPlan {
    pub fn start(&mut self, ctx: &mut CommandContext) -> ExecutionResult<StreamBox> {
        match self {
            ExecutionPlan::Select(plan) => plan.start(ctx),
            ExecutionPlan::Update(plan) => plan.start(ctx),
        }
    }

    pub fn reset(&mut self, ctx: &mut CommandContext) -> ExecutionResult<()> {
        match self {
            ExecutionPlan::Select(plan) => plan.reset(ctx),
            ExecutionPlan::Update(plan) => plan.reset(ctx),
        }
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn can_be_cached(&self) -> bool {
        match self {
            ExecutionPlan::Select(plan) => plan.can_be_cached(),
            ExecutionPlan::Update(plan) => plan.can_be_cached(),
        }
    }

    pub fn set_profiling(&mut self, profiling: bool) {
        match self {
            ExecutionPlan::Select(plan) => plan.set_profiling(profiling),
            ExecutionPlan::Update(plan) => plan.pipeline_mut().set_profiling(profiling),
        }
    }

    pub fn pretty_print(&self, depth: usize, indent: usize) -> String {
        match self {
            ExecutionPlan::Select(plan) => plan.pretty_print(depth, indent),
            ExecutionPlan::Update(plan) => plan.pretty_print(depth, indent),
        }
    }

    pub fn introspect(&self) -> PlanDescription {
        match self {
            ExecutionPlan::Select(plan) => plan.introspect(),
            ExecutionPlan::Update(plan) => plan.introspect(),
        }
    }

    pub fn to_json(&self) -> ExecutionResult<String> {
        Ok(serde_json::to_string_pretty(&self.introspect())?)
    }

    pub fn execute_to_vec(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
        let stream = self.start(ctx)?;
        stream::drain(stream, ctx)
    }
}

impl From<SelectExecutionPlan> for ExecutionPlan {
    fn from(plan: SelectExecutionPlan) -> Self {
        ExecutionPlan::Select(plan)
    }
}

impl From<UpdateExecutionPlan> for ExecutionPlan {
    fn from(plan: UpdateExecutionPlan) -> Self {
        ExecutionPlan::Update(plan)
    }
}
