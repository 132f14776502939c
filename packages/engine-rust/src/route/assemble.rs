//! Turns a [`RouteDefinition`] into a processor graph.
//!
//! Every reference is resolved up front, so a route with a missing name or
//! an include cycle fails before it accepts any exchange.

use std::sync::Arc;

use switchyard_core::{DataFormat, Processor};

use super::definition::{RouteDefinition, SplitDefinition, StepDefinition, WhenDefinition};
use crate::context::MediationContext;
use crate::engine::{Pipeline, Supervised};
use crate::error::ResolveError;
use crate::error_handler::{DeadLetter, ErrorHandler, ErrorHandlerDefinition};
use crate::observability::Instrumented;
use crate::processor::{Choice, Filter, Marshal, SendTo, Splitter, Unmarshal};

pub(crate) struct Assembler<'a> {
    context: &'a MediationContext,
    route_id: &'a str,
    /// Step lists currently being expanded, outermost first.
    including: Vec<String>,
}

impl<'a> Assembler<'a> {
    pub(crate) fn new(context: &'a MediationContext, route_id: &'a str) -> Self {
        Self {
            context,
            route_id,
            including: Vec::new(),
        }
    }

    /// Builds the route's pipeline wrapped in its error handler.
    pub(crate) fn route(
        &mut self,
        definition: &RouteDefinition,
    ) -> Result<ErrorHandler, ResolveError> {
        let steps = self.steps(&definition.steps)?;
        let pipeline: Arc<dyn Processor> = Arc::new(Pipeline::new(self.route_id, steps));

        let handler = definition.error_handler.clone().unwrap_or_default();
        let ErrorHandlerDefinition {
            redelivery,
            exceptions,
            dead_letter,
        } = handler;
        let redelivery =
            redelivery.unwrap_or_else(|| self.context.config().default_redelivery.clone());

        let mut handler = ErrorHandler::new(pipeline, redelivery)
            .with_exceptions(exceptions)
            .with_route_id(self.route_id);
        if let Some(dead_letter) = dead_letter {
            handler = handler.with_dead_letter(self.dead_letter(&dead_letter)?);
        }
        Ok(handler)
    }

    fn dead_letter(&self, dead_letter: &DeadLetter) -> Result<Arc<dyn Processor>, ResolveError> {
        match dead_letter {
            DeadLetter::Processor(p) => Ok(Arc::clone(p)),
            DeadLetter::Uri(uri) => self.send_to(uri),
            DeadLetter::Ref(name) => self.reference(name),
        }
    }

    fn steps(
        &mut self,
        definitions: &[StepDefinition],
    ) -> Result<Vec<Arc<dyn Processor>>, ResolveError> {
        let mut steps = Vec::with_capacity(definitions.len());
        for definition in definitions {
            self.step(definition, &mut steps)?;
        }
        Ok(steps)
    }

    /// A nested step list as one processor.
    fn nested(
        &mut self,
        label: &str,
        definitions: &[StepDefinition],
    ) -> Result<Arc<dyn Processor>, ResolveError> {
        let mut steps = self.steps(definitions)?;
        if steps.len() == 1 {
            if let Some(only) = steps.pop() {
                return Ok(only);
            }
        }
        let name = format!("{}/{label}", self.route_id);
        Ok(Arc::new(Pipeline::new(name, steps)))
    }

    fn step(
        &mut self,
        definition: &StepDefinition,
        out: &mut Vec<Arc<dyn Processor>>,
    ) -> Result<(), ResolveError> {
        let processor: Arc<dyn Processor> = match definition {
            StepDefinition::Process(p) => self.leaf(Arc::clone(p)),
            StepDefinition::Ref(name) => self.leaf(self.reference(name)?),
            StepDefinition::To(uri) => self.leaf(self.send_to(uri)?),
            StepDefinition::Marshal(name) => {
                let format = self.data_format(name)?;
                self.leaf(Arc::new(Marshal::new(format)))
            }
            StepDefinition::Unmarshal(name) => {
                let format = self.data_format(name)?;
                let registry = Arc::clone(self.context.registry());
                self.leaf(Arc::new(Unmarshal::new(format, registry)))
            }
            StepDefinition::Filter { predicate, steps } => {
                let inner = self.nested("filter", steps)?;
                Arc::new(Filter::from_parts(Arc::clone(predicate), inner))
            }
            StepDefinition::Choice {
                branches,
                otherwise,
            } => Arc::new(self.choice(branches, otherwise.as_deref())?),
            StepDefinition::Split(split) => Arc::new(self.split(split)?),
            StepDefinition::Include(name) => {
                out.extend(self.include(name)?);
                return Ok(());
            }
        };
        out.push(processor);
        Ok(())
    }

    fn choice(
        &mut self,
        branches: &[WhenDefinition],
        otherwise: Option<&[StepDefinition]>,
    ) -> Result<Choice, ResolveError> {
        let mut resolved = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            let then = self.nested(&format!("when[{i}]"), &branch.steps)?;
            resolved.push((Arc::clone(&branch.predicate), then));
        }
        let otherwise = match otherwise {
            Some(steps) => Some(self.nested("otherwise", steps)?),
            None => None,
        };
        Ok(Choice::from_parts(resolved, otherwise))
    }

    fn split(&mut self, split: &SplitDefinition) -> Result<Splitter, ResolveError> {
        let inner = self.nested("split", &split.steps)?;
        let expression = Arc::clone(&split.expression);
        let mut splitter = Splitter::new(move |exchange| expression(exchange), inner)
            .stop_on_exception(split.stop_on_exception);
        if let Some(strategy) = &split.aggregation {
            splitter = splitter.aggregate_with(Arc::clone(strategy));
        }
        Ok(splitter)
    }

    fn include(&mut self, name: &str) -> Result<Vec<Arc<dyn Processor>>, ResolveError> {
        if let Some(start) = self.including.iter().position(|n| n == name) {
            let mut cycle = self.including[start..].to_vec();
            cycle.push(name.to_string());
            return Err(ResolveError::CyclicInclude {
                route_id: self.route_id.to_string(),
                cycle,
            });
        }
        let definitions =
            self.context
                .step_list(name)
                .ok_or_else(|| ResolveError::UnknownStepList {
                    route_id: self.route_id.to_string(),
                    name: name.to_string(),
                })?;
        self.including.push(name.to_string());
        let steps = self.steps(&definitions);
        self.including.pop();
        steps
    }

    fn reference(&self, name: &str) -> Result<Arc<dyn Processor>, ResolveError> {
        self.context
            .processor(name)
            .ok_or_else(|| ResolveError::UnknownProcessor {
                route_id: self.route_id.to_string(),
                name: name.to_string(),
            })
    }

    fn data_format(&self, name: &str) -> Result<Arc<dyn DataFormat>, ResolveError> {
        self.context
            .data_format(name)
            .ok_or_else(|| ResolveError::UnknownDataFormat {
                route_id: self.route_id.to_string(),
                name: name.to_string(),
            })
    }

    fn send_to(&self, uri: &str) -> Result<Arc<dyn Processor>, ResolveError> {
        let endpoint = self.context.resolve_endpoint(self.route_id, uri)?;
        let producer = endpoint
            .create_producer()
            .map_err(|source| ResolveError::Endpoint {
                route_id: self.route_id.to_string(),
                uri: uri.to_string(),
                source,
            })?;
        Ok(Arc::new(SendTo::new(endpoint.uri(), producer)))
    }

    /// Wraps a step that does its own work, as opposed to one that only
    /// dispatches to children.
    fn leaf(&self, step: Arc<dyn Processor>) -> Arc<dyn Processor> {
        let config = self.context.config();
        let step: Arc<dyn Processor> = match config.async_step_timeout {
            Some(deadline) => Arc::new(Supervised::new(step, Some(deadline))),
            None => step,
        };
        if config.instrument_steps {
            Arc::new(Instrumented::new(step, self.route_id))
        } else {
            step
        }
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::{AsyncCallback, Completion, Exchange, Value};

    use super::*;
    use crate::config::EngineConfig;
    use crate::processor::process_fn;

    fn context() -> MediationContext {
        MediationContext::new(EngineConfig::default().with_instrumentation(false))
    }

    fn run(processor: &dyn Processor, exchange: Exchange) -> Exchange {
        match processor.process(exchange, AsyncCallback::noop()) {
            Completion::Sync(ex) => ex,
            Completion::Async => panic!("expected inline completion"),
        }
    }

    fn append(suffix: &'static str) -> StepDefinition {
        StepDefinition::process_fn(suffix, move |ex| {
            let body = ex.body().and_then(Value::as_str).unwrap_or_default().to_string();
            ex.set_body(format!("{body}{suffix}"));
            Ok(())
        })
    }

    #[test]
    fn includes_are_inlined_in_place() {
        let ctx = context();
        ctx.register_step_list("bc", vec![append("b"), append("c")]);
        let route = RouteDefinition::new("r", "direct:r")
            .step(append("a"))
            .include("bc")
            .step(append("d"));
        let handler = Assembler::new(&ctx, "r").route(&route).unwrap();
        let ex = run(&handler, Exchange::with_body(""));
        assert_eq!(ex.body().and_then(Value::as_str), Some("abcd"));
    }

    #[test]
    fn include_cycles_are_reported_with_their_path() {
        let ctx = context();
        ctx.register_step_list("a", vec![StepDefinition::include("b")]);
        ctx.register_step_list("b", vec![append("x"), StepDefinition::include("a")]);
        let route = RouteDefinition::new("r", "direct:r").include("a");
        let err = Assembler::new(&ctx, "r").route(&route).err().unwrap();
        match err {
            ResolveError::CyclicInclude { cycle, .. } => assert_eq!(cycle, ["a", "b", "a"]),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn the_same_list_may_be_included_twice_in_sequence() {
        let ctx = context();
        ctx.register_step_list("x", vec![append("x")]);
        let route = RouteDefinition::new("r", "direct:r").include("x").include("x");
        let handler = Assembler::new(&ctx, "r").route(&route).unwrap();
        let ex = run(&handler, Exchange::with_body(""));
        assert_eq!(ex.body().and_then(Value::as_str), Some("xx"));
    }

    #[test]
    fn unresolved_names_fail() {
        let ctx = context();
        let cases = [
            (RouteDefinition::new("r", "direct:r").reference("nope"), "no processor"),
            (RouteDefinition::new("r", "direct:r").include("nope"), "no step list"),
            (RouteDefinition::new("r", "direct:r").marshal("yaml"), "no data format"),
            (RouteDefinition::new("r", "direct:r").to("ftp:host"), "no component"),
            (RouteDefinition::new("r", "direct:r").to("no-scheme"), "invalid endpoint"),
        ];
        for (route, expected) in cases {
            let err = Assembler::new(&ctx, "r").route(&route).err().unwrap();
            assert!(err.to_string().contains(expected), "{err}");
        }
    }

    #[test]
    fn unresolved_dead_letter_fails() {
        let ctx = context();
        let route = RouteDefinition::new("r", "direct:r").error_handler(
            ErrorHandlerDefinition::default().with_dead_letter(DeadLetter::Ref("dlq".into())),
        );
        assert!(matches!(
            Assembler::new(&ctx, "r").route(&route),
            Err(ResolveError::UnknownProcessor { .. })
        ));
    }

    #[test]
    fn branches_and_refs_resolve() {
        let ctx = context();
        ctx.register_processor(
            "shout",
            process_fn("shout", |ex| {
                let body = ex.body().and_then(Value::as_str).unwrap_or_default().to_uppercase();
                ex.set_body(body);
                Ok(())
            }),
        );
        let route = RouteDefinition::new("r", "direct:r").choice(
            vec![WhenDefinition::new(
                |ex: &Exchange| ex.body().and_then(Value::as_str) == Some("hi"),
                vec![StepDefinition::reference("shout"), append("!")],
            )],
            Some(vec![append("?")]),
        );
        let handler = Assembler::new(&ctx, "r").route(&route).unwrap();
        let hi = run(&handler, Exchange::with_body("hi"));
        assert_eq!(hi.body().and_then(Value::as_str), Some("HI!"));
        let other = run(&handler, Exchange::with_body("yo"));
        assert_eq!(other.body().and_then(Value::as_str), Some("yo?"));
    }
}
