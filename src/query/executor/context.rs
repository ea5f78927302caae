//! Per-execution command context
//!
//! Holds the variable environment (`$current`, `$depth`, LET variables), the
//! statement parameters, the data session, and the cooperative cancellation
//! signal every pull consults.

use super::record::Value;
use super::{ExecutionError, ExecutionResult};
use crate::config::EngineConfig;
use crate::graph::{DataSession, PropertyValue};
use rustc_hash::FxHashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Variable bound to the record a traversal or nested plan is evaluated from
pub const CURRENT: &str = "$current";
/// Variable bound to the recursion depth of a WHILE traversal
pub const DEPTH: &str = "$depth";
/// Variable bound to the partial MATCH row while candidate filters run
pub const MATCHED: &str = "$matched";

/// Execution environment of one statement
pub struct CommandContext {
    session: Arc<dyn DataSession>,
    variables: FxHashMap<String, Value>,
    parameters: FxHashMap<String, PropertyValue>,
    deadline: Option<Instant>,
    interrupt: Arc<AtomicBool>,
    profiling: bool,
}

impl CommandContext {
    pub fn new(session: Arc<dyn DataSession>) -> Self {
        CommandContext {
            session,
            variables: FxHashMap::default(),
            parameters: FxHashMap::default(),
            deadline: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            profiling: false,
        }
    }

    /// Context with profiling and timeout taken from `config`
    pub fn with_config(session: Arc<dyn DataSession>, config: &EngineConfig) -> Self {
        let mut ctx = CommandContext::new(session);
        ctx.profiling = config.profiling;
        if let Some(timeout) = config.query_timeout() {
            ctx.set_timeout(timeout);
        }
        ctx
    }

    pub fn session(&self) -> &dyn DataSession {
        self.session.as_ref()
    }

    pub fn session_handle(&self) -> Arc<dyn DataSession> {
        Arc::clone(&self.session)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.variables.insert(name.into(), value)
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn parameter(&self, name: &str) -> Option<&PropertyValue> {
        self.parameters.get(name)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Bind `name` until the returned guard drops, then restore the previous binding
    pub fn scoped(&mut self, name: &str, value: Value) -> ScopedVariable<'_> {
        let previous = self.variables.insert(name.to_string(), value);
        ScopedVariable {
            ctx: self,
            name: name.to_string(),
            previous,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Shared flag; storing `true` aborts the execution at its next pull
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Fail when the execution was interrupted or its deadline has passed
    pub fn check_interrupted(&self) -> ExecutionResult<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(ExecutionError::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!("Execution deadline reached, aborting");
                Err(ExecutionError::Timeout("query exceeded its execution deadline".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
    }

    pub fn set_profiling(&mut self, profiling: bool) {
        self.profiling = profiling;
    }
}

/// Scoped variable binding; restores the previous value on drop, including
/// when evaluation inside the scope fails
pub struct ScopedVariable<'a> {
    ctx: &'a mut CommandContext,
    name: String,
    previous: Option<Value>,
}

impl Deref for ScopedVariable<'_> {
    type Target = CommandContext;

    fn deref(&self) -> &CommandContext {
        self.ctx
    }
}

impl DerefMut for ScopedVariable<'_> {
    fn deref_mut(&mut self) -> &mut CommandContext {
        self.ctx
    }
}

impl Drop for ScopedVariable<'_> {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => {
                self.ctx.variables.insert(std::mem::take(&mut self.name), value);
            }
            None => {
                self.ctx.variables.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDatabase;

    fn context() -> CommandContext {
        CommandContext::new(Arc::new(MemoryDatabase::new()))
    }

    #[test]
    fn test_scoped_variable_restores_previous() {
        let mut ctx = context();
        ctx.set_variable(CURRENT, Value::from(1i64));
        {
            let scope = ctx.scoped(CURRENT, Value::from(2i64));
            assert_eq!(scope.variable(CURRENT), Some(&Value::from(2i64)));
        }
        assert_eq!(ctx.variable(CURRENT), Some(&Value::from(1i64)));
    }

    #[test]
    fn test_scoped_variable_restores_on_error() {
        fn failing(ctx: &mut CommandContext) -> ExecutionResult<()> {
            let scope = ctx.scoped(CURRENT, Value::from(7i64));
            scope.check_interrupted()?;
            Err(ExecutionError::RuntimeError("boom".into()))
        }
        let mut ctx = context();
        assert!(failing(&mut ctx).is_err());
        assert!(ctx.variable(CURRENT).is_none());
    }

    #[test]
    fn test_interrupt_and_deadline() {
        let mut ctx = context();
        assert!(ctx.check_interrupted().is_ok());

        ctx.interrupt_handle().store(true, Ordering::Relaxed);
        assert!(matches!(ctx.check_interrupted(), Err(ExecutionError::Interrupted)));

        let mut ctx = context();
        ctx.set_deadline(Some(Instant::now() - Duration::from_millis(1)));
        assert!(matches!(ctx.check_interrupted(), Err(ExecutionError::Timeout(_))));
    }

    #[test]
    fn test_parameters() {
        let mut ctx = context();
        ctx.set_parameter("minAge", 18i64);
        assert_eq!(ctx.parameter("minAge"), Some(&PropertyValue::Integer(18)));
        assert!(ctx.parameter("other").is_none());
    }
}
