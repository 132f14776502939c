//! Splitter with aggregation.
//!
//! Each part is routed as a copy of the parent exchange with its own unit of
//! work. Parts run one at a time, in order; part `i + 1` is created only after
//! part `i` has finished and been folded into the parent.

use std::collections::VecDeque;
use std::sync::Arc;

use switchyard_core::exchange::{SPLIT_COMPLETE, SPLIT_INDEX, SPLIT_SIZE};
use switchyard_core::{AsyncCallback, Completion, Exchange, Failure, Processor, Value};
use tracing::{debug, warn};

use crate::engine::handoff::Invocation;
use crate::engine::pipeline::may_continue;
use crate::engine::{call, run, Step, Task};

type SplitFn = Arc<dyn Fn(&Exchange) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// Folds finished parts back into the parent exchange.
pub trait AggregationStrategy: Send + Sync {
    /// Called once per part, in part order. `collected` belongs to this
    /// split alone and starts empty. Taking the part's exception marks its
    /// failure as handled; a failure left on the part is reported to the
    /// parent.
    fn aggregate(&self, parent: &mut Exchange, part: &mut Exchange, collected: &mut Vec<Value>);

    /// Called after the last part with whatever `aggregate` collected.
    fn complete(&self, _parent: &mut Exchange, _collected: Vec<Value>) {}
}

/// Replaces the parent body with the bodies of all successful parts, as a
/// `Vec<Value>` in part order.
#[derive(Debug, Default)]
pub struct CollectBodies;

impl AggregationStrategy for CollectBodies {
    fn aggregate(&self, _parent: &mut Exchange, part: &mut Exchange, collected: &mut Vec<Value>) {
        if let (false, Some(body)) = (part.is_failed(), part.body()) {
            collected.push(body.clone());
        }
    }

    fn complete(&self, parent: &mut Exchange, collected: Vec<Value>) {
        parent.set_body(Value::new(collected));
    }
}

/// Keeps the body of the last successful part.
#[derive(Debug, Default)]
pub struct LatestBody;

impl AggregationStrategy for LatestBody {
    fn aggregate(&self, parent: &mut Exchange, part: &mut Exchange, _collected: &mut Vec<Value>) {
        if let (false, Some(body)) = (part.is_failed(), part.body()) {
            parent.set_body(body.clone());
        }
    }
}

/// Splits the body into parts and routes each through `inner`.
///
/// Without an aggregation strategy the parent keeps its own message. Part
/// failures that no strategy handled fail the parent once all parts have run,
/// or right away with `stop_on_exception`.
pub struct Splitter {
    split: SplitFn,
    inner: Arc<dyn Processor>,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    stop_on_exception: bool,
}

impl Splitter {
    pub fn new<F>(split: F, inner: Arc<dyn Processor>) -> Self
    where
        F: Fn(&Exchange) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            split: Arc::new(split),
            inner,
            strategy: None,
            stop_on_exception: false,
        }
    }

    /// Splits a text body into its lines.
    #[must_use]
    pub fn lines(inner: Arc<dyn Processor>) -> Self {
        Self::new(
            |exchange: &Exchange| {
                let text = exchange
                    .body()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("split by lines needs a text body"))?;
                Ok(text.lines().map(Value::from).collect())
            },
            inner,
        )
    }

    #[must_use]
    pub fn aggregate_with(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }
}

impl Processor for Splitter {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let parts = match (self.split)(&exchange) {
            Ok(parts) => parts,
            Err(e) => {
                exchange.set_exception(e.context("splitting exchange"));
                return Completion::Sync(exchange);
            }
        };
        debug!(exchange_id = %exchange.id(), parts = parts.len(), "splitting");
        let task = Fan {
            parts: parts.into_iter().enumerate().collect(),
            size: 0,
            inner: Arc::clone(&self.inner),
            strategy: self.strategy.clone(),
            stop_on_exception: self.stop_on_exception,
            parent: None,
            collected: Vec::new(),
        };
        run(task, exchange, callback)
    }

    fn name(&self) -> &str {
        "split"
    }
}

struct Fan {
    parts: VecDeque<(usize, Value)>,
    size: usize,
    inner: Arc<dyn Processor>,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    stop_on_exception: bool,
    parent: Option<Exchange>,
    collected: Vec<Value>,
}

impl Fan {
    /// Folds a finished part into the parent. Returns `false` when splitting
    /// should stop.
    fn fold(&mut self, parent: &mut Exchange, mut part: Exchange) -> bool {
        if let Some(strategy) = &self.strategy {
            strategy.aggregate(parent, &mut part, &mut self.collected);
        }
        let failed = part.is_failed();
        part.unit_of_work().done(&part);
        !(failed && self.stop_on_exception)
    }

    fn finish(&mut self, mut parent: Exchange) -> Exchange {
        if let Some(strategy) = &self.strategy {
            strategy.complete(&mut parent, std::mem::take(&mut self.collected));
        }
        let failures = parent.unit_of_work().take_child_failures();
        if let (false, Some(first)) = (parent.is_failed(), failures.first()) {
            warn!(
                exchange_id = %parent.id(),
                failed_parts = failures.len(),
                error = %first,
                "split part failed"
            );
            parent.set_failure(Failure::clone(first));
        }
        parent
    }
}

impl Task for Fan {
    fn advance(&mut self, exchange: Exchange) -> Step {
        let mut parent = match self.parent.take() {
            None => {
                self.size = self.parts.len();
                exchange
            }
            Some(mut parent) => {
                if !self.fold(&mut parent, exchange) {
                    return Step::Finished(self.finish(parent));
                }
                parent
            }
        };

        while let Some((index, body)) = self.parts.pop_front() {
            if !may_continue(&mut parent) {
                break;
            }
            let mut part = parent.copy();
            part.set_body(body);
            part.set_property(SPLIT_INDEX, index);
            part.set_property(SPLIT_SIZE, self.size);
            part.set_property(SPLIT_COMPLETE, index + 1 == self.size);
            match call(self.inner.as_ref(), part) {
                Invocation::Done(part) => {
                    if !self.fold(&mut parent, part) {
                        return Step::Finished(self.finish(parent));
                    }
                }
                Invocation::Pending(pending) => {
                    self.parent = Some(parent);
                    return Step::Await(pending);
                }
            }
        }
        Step::Finished(self.finish(parent))
    }
}
