//! Lazy pull-based row streams
//!
//! Every step produces an [`ExecutionStream`]. Combinators never pull from
//! their upstream until they are pulled themselves. Streams are single-use
//! and single-threaded; whoever owns a stream must call `close` on every
//! exit path, and `close` is idempotent.

use super::context::CommandContext;
use super::record::Row;
use super::{ExecutionError, ExecutionResult};
use std::collections::VecDeque;
use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Pull protocol shared by every step
pub trait ExecutionStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool>;

    /// Next row; fails with [`ExecutionError::Exhausted`] when none remain
    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row>;

    /// Release underlying resources; safe to call more than once
    fn close(&mut self, ctx: &mut CommandContext);
}

pub type StreamBox = Box<dyn ExecutionStream>;

/// Deferred stream constructor
pub type StreamFactory = Box<dyn FnOnce(&mut CommandContext) -> ExecutionResult<StreamBox>>;

/// A stream with no rows
pub fn empty() -> StreamBox {
    from_rows(Vec::new())
}

/// A stream with exactly one row
pub fn singleton(row: Row) -> StreamBox {
    from_rows(vec![row])
}

pub fn from_rows(rows: Vec<Row>) -> StreamBox {
    from_iter(rows.into_iter())
}

/// Iterator-backed stream
pub fn from_iter<I>(iter: I) -> StreamBox
where
    I: Iterator<Item = Row> + 'static,
{
    Box::new(IterStream {
        iter: iter.peekable(),
        closed: false,
    })
}

/// Stream whose rows are produced on demand; `None` ends it
pub fn produce<F>(producer: F) -> StreamBox
where
    F: FnMut(&mut CommandContext) -> ExecutionResult<Option<Row>> + 'static,
{
    Box::new(ProducerStream {
        producer,
        pending: None,
        done: false,
    })
}

/// Stream built on first pull, after `prelude` has been drained and closed
pub fn deferred(prelude: Option<StreamBox>, factory: StreamFactory) -> StreamBox {
    Box::new(DeferredStream {
        prelude,
        factory: Some(factory),
        inner: None,
    })
}

/// Streams built one after another as each predecessor runs dry
pub fn concat(factories: Vec<StreamFactory>) -> StreamBox {
    Box::new(ConcatStream {
        factories: factories.into(),
        current: None,
    })
}

/// Stream that drains `upstream` on first pull and yields `f` applied to the
/// buffered rows; blocking operators (sort, cartesian product) build on it
pub fn materialized<F>(upstream: StreamBox, f: F) -> StreamBox
where
    F: FnOnce(Vec<Row>, &mut CommandContext) -> ExecutionResult<Vec<Row>> + 'static,
{
    Box::new(MaterializedStream {
        upstream: Some(upstream),
        f: Some(f),
        rows: VecDeque::new(),
    })
}

/// Pull every row of `stream`, closing it on success and on failure
pub fn drain(mut stream: StreamBox, ctx: &mut CommandContext) -> ExecutionResult<Vec<Row>> {
    let mut rows = Vec::new();
    let result = pull_all(stream.as_mut(), ctx, &mut rows);
    stream.close(ctx);
    result.map(|_| rows)
}

fn pull_all(stream: &mut dyn ExecutionStream, ctx: &mut CommandContext, rows: &mut Vec<Row>) -> ExecutionResult<()> {
    while stream.has_next(ctx)? {
        rows.push(stream.next(ctx)?);
    }
    Ok(())
}

/// Lazy combinators over boxed streams
pub trait StreamExt {
    /// One output row per input row
    fn map<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Row> + 'static;

    /// Rows for which `f` yields `None` are dropped
    fn filter<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Option<Row>> + 'static;

    /// Each input row unrolls into a sub-stream, in input order
    fn flat_map<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<StreamBox> + 'static;

    fn limit(self, count: usize) -> StreamBox;

    fn skip(self, count: usize) -> StreamBox;

    /// Run `hook` once, after the stream closes
    fn on_close<F>(self, hook: F) -> StreamBox
    where
        F: FnOnce(&mut CommandContext) + 'static;

    /// Consult the context's interrupt flag and deadline on every pull
    fn interruptible(self) -> StreamBox;

    /// Accumulate time spent in pulls into `cost` (nanoseconds)
    fn profiled(self, cost: Arc<AtomicU64>) -> StreamBox;
}

impl StreamExt for StreamBox {
    fn map<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Row> + 'static,
    {
        Box::new(MapStream { upstream: self, f })
    }

    fn filter<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Option<Row>> + 'static,
    {
        Box::new(FilterStream {
            upstream: self,
            f,
            pending: None,
        })
    }

    fn flat_map<F>(self, f: F) -> StreamBox
    where
        F: FnMut(Row, &mut CommandContext) -> ExecutionResult<StreamBox> + 'static,
    {
        Box::new(FlatMapStream {
            upstream: self,
            f,
            current: None,
        })
    }

    fn limit(self, count: usize) -> StreamBox {
        Box::new(LimitStream {
            upstream: self,
            remaining: count,
        })
    }

    fn skip(self, count: usize) -> StreamBox {
        Box::new(SkipStream {
            upstream: self,
            to_skip: count,
        })
    }

    fn on_close<F>(self, hook: F) -> StreamBox
    where
        F: FnOnce(&mut CommandContext) + 'static,
    {
        Box::new(OnCloseStream {
            upstream: self,
            hook: Some(Box::new(hook)),
        })
    }

    fn interruptible(self) -> StreamBox {
        Box::new(InterruptibleStream { upstream: self })
    }

    fn profiled(self, cost: Arc<AtomicU64>) -> StreamBox {
        Box::new(ProfiledStream { upstream: self, cost })
    }
}

struct IterStream<I: Iterator<Item = Row>> {
    iter: Peekable<I>,
    closed: bool,
}

impl<I: Iterator<Item = Row>> ExecutionStream for IterStream<I> {
    fn has_next(&mut self, _ctx: &mut CommandContext) -> ExecutionResult<bool> {
        Ok(!self.closed && self.iter.peek().is_some())
    }

    fn next(&mut self, _ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if self.closed {
            return Err(ExecutionError::Exhausted);
        }
        self.iter.next().ok_or(ExecutionError::Exhausted)
    }

    fn close(&mut self, _ctx: &mut CommandContext) {
        self.closed = true;
    }
}

struct ProducerStream<F> {
    producer: F,
    pending: Option<Row>,
    done: bool,
}

impl<F> ExecutionStream for ProducerStream<F>
where
    F: FnMut(&mut CommandContext) -> ExecutionResult<Option<Row>>,
{
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.done {
            return Ok(false);
        }
        match (self.producer)(ctx)? {
            Some(row) => {
                self.pending = Some(row);
                Ok(true)
            }
            None => {
                self.done = true;
                Ok(false)
            }
        }
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if !self.has_next(ctx)? {
            return Err(ExecutionError::Exhausted);
        }
        self.pending.take().ok_or(ExecutionError::Exhausted)
    }

    fn close(&mut self, _ctx: &mut CommandContext) {
        self.done = true;
        self.pending = None;
    }
}

struct DeferredStream {
    prelude: Option<StreamBox>,
    factory: Option<StreamFactory>,
    inner: Option<StreamBox>,
}

impl DeferredStream {
    fn init(&mut self, ctx: &mut CommandContext) -> ExecutionResult<()> {
        if let Some(prelude) = self.prelude.take() {
            drain(prelude, ctx)?;
        }
        if let Some(factory) = self.factory.take() {
            self.inner = Some(factory(ctx)?);
        }
        Ok(())
    }
}

impl ExecutionStream for DeferredStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        self.init(ctx)?;
        match self.inner.as_mut() {
            Some(inner) => inner.has_next(ctx),
            None => Ok(false),
        }
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        self.init(ctx)?;
        match self.inner.as_mut() {
            Some(inner) => inner.next(ctx),
            None => Err(ExecutionError::Exhausted),
        }
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        if let Some(mut prelude) = self.prelude.take() {
            prelude.close(ctx);
        }
        self.factory = None;
        if let Some(inner) = self.inner.as_mut() {
            inner.close(ctx);
        }
    }
}

struct ConcatStream {
    factories: VecDeque<StreamFactory>,
    current: Option<StreamBox>,
}

impl ExecutionStream for ConcatStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if current.has_next(ctx)? {
                    return Ok(true);
                }
                current.close(ctx);
                self.current = None;
            }
            match self.factories.pop_front() {
                Some(factory) => self.current = Some(factory(ctx)?),
                None => return Ok(false),
            }
        }
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if !self.has_next(ctx)? {
            return Err(ExecutionError::Exhausted);
        }
        match self.current.as_mut() {
            Some(current) => current.next(ctx),
            None => Err(ExecutionError::Exhausted),
        }
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.factories.clear();
        if let Some(mut current) = self.current.take() {
            current.close(ctx);
        }
    }
}

struct MaterializedStream<F> {
    upstream: Option<StreamBox>,
    f: Option<F>,
    rows: VecDeque<Row>,
}

impl<F> MaterializedStream<F>
where
    F: FnOnce(Vec<Row>, &mut CommandContext) -> ExecutionResult<Vec<Row>>,
{
    fn init(&mut self, ctx: &mut CommandContext) -> ExecutionResult<()> {
        if let Some(upstream) = self.upstream.take() {
            let rows = drain(upstream, ctx)?;
            if let Some(f) = self.f.take() {
                self.rows = f(rows, ctx)?.into();
            }
        }
        Ok(())
    }
}

impl<F> ExecutionStream for MaterializedStream<F>
where
    F: FnOnce(Vec<Row>, &mut CommandContext) -> ExecutionResult<Vec<Row>>,
{
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        self.init(ctx)?;
        Ok(!self.rows.is_empty())
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        self.init(ctx)?;
        self.rows.pop_front().ok_or(ExecutionError::Exhausted)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close(ctx);
        }
        self.f = None;
        self.rows.clear();
    }
}

struct MapStream<F> {
    upstream: StreamBox,
    f: F,
}

impl<F> ExecutionStream for MapStream<F>
where
    F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Row>,
{
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        self.upstream.has_next(ctx)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        let row = self.upstream.next(ctx)?;
        (self.f)(row, ctx)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
    }
}

struct FilterStream<F> {
    upstream: StreamBox,
    f: F,
    pending: Option<Row>,
}

impl<F> ExecutionStream for FilterStream<F>
where
    F: FnMut(Row, &mut CommandContext) -> ExecutionResult<Option<Row>>,
{
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        while self.pending.is_none() {
            if !self.upstream.has_next(ctx)? {
                return Ok(false);
            }
            let row = self.upstream.next(ctx)?;
            self.pending = (self.f)(row, ctx)?;
        }
        Ok(true)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if !self.has_next(ctx)? {
            return Err(ExecutionError::Exhausted);
        }
        self.pending.take().ok_or(ExecutionError::Exhausted)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.pending = None;
        self.upstream.close(ctx);
    }
}

struct FlatMapStream<F> {
    upstream: StreamBox,
    f: F,
    current: Option<StreamBox>,
}

impl<F> ExecutionStream for FlatMapStream<F>
where
    F: FnMut(Row, &mut CommandContext) -> ExecutionResult<StreamBox>,
{
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if current.has_next(ctx)? {
                    return Ok(true);
                }
                current.close(ctx);
                self.current = None;
            }
            if !self.upstream.has_next(ctx)? {
                return Ok(false);
            }
            let row = self.upstream.next(ctx)?;
            self.current = Some((self.f)(row, ctx)?);
        }
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if !self.has_next(ctx)? {
            return Err(ExecutionError::Exhausted);
        }
        match self.current.as_mut() {
            Some(current) => current.next(ctx),
            None => Err(ExecutionError::Exhausted),
        }
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        if let Some(mut current) = self.current.take() {
            current.close(ctx);
        }
        self.upstream.close(ctx);
    }
}

struct LimitStream {
    upstream: StreamBox,
    remaining: usize,
}

impl ExecutionStream for LimitStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.upstream.has_next(ctx)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if self.remaining == 0 {
            return Err(ExecutionError::Exhausted);
        }
        let row = self.upstream.next(ctx)?;
        self.remaining -= 1;
        Ok(row)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
    }
}

struct SkipStream {
    upstream: StreamBox,
    to_skip: usize,
}

impl ExecutionStream for SkipStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        while self.to_skip > 0 {
            if !self.upstream.has_next(ctx)? {
                return Ok(false);
            }
            self.upstream.next(ctx)?;
            self.to_skip -= 1;
        }
        self.upstream.has_next(ctx)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        if !self.has_next(ctx)? {
            return Err(ExecutionError::Exhausted);
        }
        self.upstream.next(ctx)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
    }
}

struct OnCloseStream {
    upstream: StreamBox,
    hook: Option<Box<dyn FnOnce(&mut CommandContext)>>,
}

impl ExecutionStream for OnCloseStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        self.upstream.has_next(ctx)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        self.upstream.next(ctx)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
        if let Some(hook) = self.hook.take() {
            hook(ctx);
        }
    }
}

struct InterruptibleStream {
    upstream: StreamBox,
}

impl ExecutionStream for InterruptibleStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        ctx.check_interrupted()?;
        self.upstream.has_next(ctx)
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        ctx.check_interrupted()?;
        self.upstream.next(ctx)
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
    }
}

struct ProfiledStream {
    upstream: StreamBox,
    cost: Arc<AtomicU64>,
}

impl ProfiledStream {
    fn record(&self, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.cost.fetch_add(nanos, Ordering::Relaxed);
    }
}

impl ExecutionStream for ProfiledStream {
    fn has_next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<bool> {
        let started = Instant::now();
        let result = self.upstream.has_next(ctx);
        self.record(started);
        result
    }

    fn next(&mut self, ctx: &mut CommandContext) -> ExecutionResult<Row> {
        let started = Instant::now();
        let result = self.upstream.next(ctx);
        self.record(started);
        result
    }

    fn close(&mut self, ctx: &mut CommandContext) {
        self.upstream.close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDatabase;
    use crate::query::executor::record::Value;
    use std::cell::Cell;
    use std::rc::Rc;

    fn context() -> CommandContext {
        CommandContext::new(Arc::new(MemoryDatabase::new()))
    }

    fn numbers(n: i64) -> StreamBox {
        from_iter((0..n).map(|i| Row::from_pairs([("n", i)])))
    }

    fn values(rows: &[Row]) -> Vec<i64> {
        rows.iter().map(|r| r.property("n").as_integer().unwrap()).collect()
    }

    #[test]
    fn test_map_preserves_count_and_order() {
        let mut ctx = context();
        let stream = numbers(5).map(|mut row, _| {
            let n = row.property("n").as_integer().unwrap_or(0);
            row.set("n", n * 10);
            Ok(row)
        });
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn test_filter_removes_exactly_dropped_rows() {
        let mut ctx = context();
        let stream = numbers(7).filter(|row, _| {
            let n = row.property("n").as_integer().unwrap_or(0);
            Ok(if n % 3 == 0 { None } else { Some(row) })
        });
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_flat_map_preserves_group_order() {
        let mut ctx = context();
        let stream = numbers(4).flat_map(|row, _| {
            let n = row.property("n").as_integer().unwrap_or(0);
            Ok(from_iter((0..n).map(move |_| Row::from_pairs([("n", n)]))))
        });
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![1, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_combinators_are_lazy() {
        let mut ctx = context();
        let pulls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&pulls);
        let source = produce(move |_| {
            counter.set(counter.get() + 1);
            Ok(if counter.get() <= 3 { Some(Row::new()) } else { None })
        });
        let mut stream = source.map(|row, _| Ok(row)).limit(2);
        assert_eq!(pulls.get(), 0);

        assert!(stream.has_next(&mut ctx).unwrap());
        assert_eq!(pulls.get(), 1);
        stream.next(&mut ctx).unwrap();
        stream.next(&mut ctx).unwrap();
        assert!(!stream.has_next(&mut ctx).unwrap());
        assert_eq!(pulls.get(), 2);
        stream.close(&mut ctx);
    }

    #[test]
    fn test_next_on_exhausted_stream_fails() {
        let mut ctx = context();
        let mut stream = empty();
        assert!(!stream.has_next(&mut ctx).unwrap());
        assert!(matches!(stream.next(&mut ctx), Err(ExecutionError::Exhausted)));

        let mut one = singleton(Row::new());
        one.next(&mut ctx).unwrap();
        assert!(matches!(one.next(&mut ctx), Err(ExecutionError::Exhausted)));
    }

    #[test]
    fn test_close_is_idempotent_and_runs_hook_once() {
        let mut ctx = context();
        let closed = Rc::new(Cell::new(0));
        let hook_counter = Rc::clone(&closed);
        let mut stream = numbers(3).on_close(move |_| hook_counter.set(hook_counter.get() + 1));
        stream.next(&mut ctx).unwrap();
        stream.close(&mut ctx);
        stream.close(&mut ctx);
        assert_eq!(closed.get(), 1);
        assert!(!stream.has_next(&mut ctx).unwrap());
    }

    #[test]
    fn test_skip_and_limit() {
        let mut ctx = context();
        let rows = drain(numbers(10).skip(3).limit(4), &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_interruptible_aborts_pull() {
        let mut ctx = context();
        let mut stream = numbers(3).interruptible();
        stream.next(&mut ctx).unwrap();
        ctx.interrupt_handle().store(true, Ordering::Relaxed);
        assert!(matches!(stream.has_next(&mut ctx), Err(ExecutionError::Interrupted)));
        stream.close(&mut ctx);
    }

    #[test]
    fn test_deferred_drains_prelude_first() {
        let mut ctx = context();
        let prelude = numbers(2).map(|row, ctx| {
            ctx.set_variable("seen", row.property("n"));
            Ok(row)
        });
        let stream = deferred(
            Some(prelude),
            Box::new(|ctx: &mut CommandContext| {
                let seen = ctx.variable("seen").cloned().unwrap_or(Value::Null);
                Ok(singleton(Row::from_pairs([("seen", seen)])))
            }),
        );
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property("seen"), Value::from(1i64));
    }

    #[test]
    fn test_materialized_waits_for_first_pull() {
        let mut ctx = context();
        let pulls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&pulls);
        let source = numbers(4).map(move |row, _| {
            counter.set(counter.get() + 1);
            Ok(row)
        });
        let mut stream = materialized(source, |mut rows, _| {
            rows.reverse();
            Ok(rows)
        });
        assert_eq!(pulls.get(), 0);
        assert!(stream.has_next(&mut ctx).unwrap());
        assert_eq!(pulls.get(), 4);
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_concat_runs_factories_in_order() {
        let mut ctx = context();
        let stream = concat(vec![
            Box::new(|_: &mut CommandContext| Ok(numbers(2))) as StreamFactory,
            Box::new(|_: &mut CommandContext| Ok(empty())),
            Box::new(|_: &mut CommandContext| Ok(numbers(1))),
        ]);
        let rows = drain(stream, &mut ctx).unwrap();
        assert_eq!(values(&rows), vec![0, 1, 0]);
    }
}
