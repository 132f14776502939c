//! Route definitions: the unresolved form a route is assembled from.
//!
//! Names (`Ref`, `Include`, `Marshal`, `Unmarshal`) and endpoint URIs (`To`,
//! `from`) are resolved against the mediation context when the route starts.

use std::fmt;
use std::sync::Arc;

use switchyard_core::{Exchange, Processor, Value};

use crate::error_handler::ErrorHandlerDefinition;
use crate::processor::{process_fn, AggregationStrategy, Predicate};

pub type SplitExpression = Arc<dyn Fn(&Exchange) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// One step of a route or of a named step list.
#[derive(Clone)]
pub enum StepDefinition {
    /// A ready-made processor.
    Process(Arc<dyn Processor>),
    /// A processor registered on the context under this name.
    Ref(String),
    /// Sends to the endpoint at this URI.
    To(String),
    Filter {
        predicate: Arc<dyn Predicate>,
        steps: Vec<StepDefinition>,
    },
    Choice {
        branches: Vec<WhenDefinition>,
        otherwise: Option<Vec<StepDefinition>>,
    },
    Split(SplitDefinition),
    /// Inlines the step list registered on the context under this name.
    Include(String),
    /// Marshals with the data format registered under this name.
    Marshal(String),
    Unmarshal(String),
}

impl StepDefinition {
    pub fn process_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Process(process_fn(name, f))
    }

    pub fn to(uri: impl Into<String>) -> Self {
        Self::To(uri.into())
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::Ref(name.into())
    }

    pub fn include(name: impl Into<String>) -> Self {
        Self::Include(name.into())
    }

    pub fn filter(predicate: impl Predicate + 'static, steps: Vec<StepDefinition>) -> Self {
        Self::Filter {
            predicate: Arc::new(predicate),
            steps,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::Ref(_) => "ref",
            Self::To(_) => "to",
            Self::Filter { .. } => "filter",
            Self::Choice { .. } => "choice",
            Self::Split(_) => "split",
            Self::Include(_) => "include",
            Self::Marshal(_) => "marshal",
            Self::Unmarshal(_) => "unmarshal",
        }
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(p) => write!(f, "process({})", p.name()),
            Self::Ref(name)
            | Self::To(name)
            | Self::Include(name)
            | Self::Marshal(name)
            | Self::Unmarshal(name) => write!(f, "{}({name})", self.kind()),
            Self::Filter { steps, .. } => f.debug_tuple("filter").field(steps).finish(),
            Self::Choice {
                branches,
                otherwise,
            } => f
                .debug_struct("choice")
                .field("branches", &branches.len())
                .field("otherwise", otherwise)
                .finish(),
            Self::Split(split) => f.debug_tuple("split").field(&split.steps).finish(),
        }
    }
}

/// A `when` branch of a choice.
#[derive(Clone)]
pub struct WhenDefinition {
    pub predicate: Arc<dyn Predicate>,
    pub steps: Vec<StepDefinition>,
}

impl WhenDefinition {
    pub fn new(predicate: impl Predicate + 'static, steps: Vec<StepDefinition>) -> Self {
        Self {
            predicate: Arc::new(predicate),
            steps,
        }
    }
}

/// A splitter: how to split the body, what each part runs through and how
/// parts are folded back.
#[derive(Clone)]
pub struct SplitDefinition {
    pub expression: SplitExpression,
    pub steps: Vec<StepDefinition>,
    pub aggregation: Option<Arc<dyn AggregationStrategy>>,
    pub stop_on_exception: bool,
}

impl SplitDefinition {
    pub fn new<F>(expression: F, steps: Vec<StepDefinition>) -> Self
    where
        F: Fn(&Exchange) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            expression: Arc::new(expression),
            steps,
            aggregation: None,
            stop_on_exception: false,
        }
    }

    #[must_use]
    pub fn aggregate_with(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.aggregation = Some(strategy);
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self) -> Self {
        self.stop_on_exception = true;
        self
    }
}

/// A route before assembly.
#[derive(Clone, Debug)]
pub struct RouteDefinition {
    pub id: String,
    /// URI of the endpoint whose consumer feeds the route.
    pub from: String,
    pub steps: Vec<StepDefinition>,
    /// Falls back to the context's default redelivery with no dead letter.
    pub error_handler: Option<ErrorHandlerDefinition>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            steps: Vec::new(),
            error_handler: None,
        }
    }

    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn process(self, processor: Arc<dyn Processor>) -> Self {
        self.step(StepDefinition::Process(processor))
    }

    #[must_use]
    pub fn process_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.step(StepDefinition::process_fn(name, f))
    }

    #[must_use]
    pub fn reference(self, name: impl Into<String>) -> Self {
        self.step(StepDefinition::reference(name))
    }

    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::to(uri))
    }

    #[must_use]
    pub fn filter(self, predicate: impl Predicate + 'static, steps: Vec<StepDefinition>) -> Self {
        self.step(StepDefinition::filter(predicate, steps))
    }

    #[must_use]
    pub fn choice(
        self,
        branches: Vec<WhenDefinition>,
        otherwise: Option<Vec<StepDefinition>>,
    ) -> Self {
        self.step(StepDefinition::Choice {
            branches,
            otherwise,
        })
    }

    #[must_use]
    pub fn split(self, split: SplitDefinition) -> Self {
        self.step(StepDefinition::Split(split))
    }

    #[must_use]
    pub fn include(self, name: impl Into<String>) -> Self {
        self.step(StepDefinition::include(name))
    }

    #[must_use]
    pub fn marshal(self, format: impl Into<String>) -> Self {
        self.step(StepDefinition::Marshal(format.into()))
    }

    #[must_use]
    pub fn unmarshal(self, format: impl Into<String>) -> Self {
        self.step(StepDefinition::Unmarshal(format.into()))
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_step_order() {
        let route = RouteDefinition::new("orders", "direct:orders")
            .reference("validate")
            .include("enrich")
            .marshal("json")
            .to("mock:out");
        let kinds: Vec<_> = route.steps.iter().map(StepDefinition::kind).collect();
        assert_eq!(kinds, ["ref", "include", "marshal", "to"]);
        assert_eq!(format!("{:?}", route.steps[3]), "to(mock:out)");
    }
}
