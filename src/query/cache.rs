//! Execution plan cache
//!
//! Keyed by statement text. The cache stores a private copy of each plan and
//! hands out copies, so a cached plan never shares cost counters or buffered
//! rows with an execution in progress.

use super::executor::ExecutionPlan;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, info};

pub struct PlanCache {
    /// `None` when caching is disabled
    plans: Option<Mutex<LruCache<String, ExecutionPlan>>>,
}

impl PlanCache {
    /// A cache holding up to `capacity` plans; 0 disables it
    pub fn new(capacity: usize) -> Self {
        PlanCache {
            plans: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.plans.is_some()
    }

    /// Copy of the plan cached for `statement`
    pub fn get(&self, statement: &str) -> Option<ExecutionPlan> {
        let plans = self.plans.as_ref()?;
        let mut plans = plans.lock().ok()?;
        let plan = plans.get(statement).map(ExecutionPlan::copy);
        if plan.is_some() {
            debug!("Plan cache hit: {}", statement);
        }
        plan
    }

    /// Cache a copy of `plan`; plans whose shape depends on the data are refused
    pub fn put(&self, statement: &str, plan: &ExecutionPlan) -> bool {
        let Some(plans) = self.plans.as_ref() else {
            return false;
        };
        if !plan.can_be_cached() {
            debug!("Plan for {} is not cacheable", statement);
            return false;
        }
        match plans.lock() {
            Ok(mut plans) => {
                if let Some((evicted, _)) = plans.push(statement.to_string(), plan.copy()) {
                    if evicted != statement {
                        info!("Plan cache evicted: {}", evicted);
                    }
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every cached plan, e.g. after a schema or index change
    pub fn clear(&self) {
        if let Some(Ok(mut plans)) = self.plans.as_ref().map(|p| p.lock()) {
            info!("Plan cache cleared ({} plans)", plans.len());
            plans.clear();
        }
    }

    pub fn len(&self) -> usize {
        match self.plans.as_ref().map(|p| p.lock()) {
            Some(Ok(plans)) => plans.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
