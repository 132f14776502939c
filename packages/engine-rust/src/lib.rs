//! Switchyard Engine — continuation-based routing, error handling, route
//! lifecycle and in-process components.

pub mod component;
pub mod config;
pub mod context;
pub mod dataformat;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod observability;
pub mod processor;
pub mod route;

pub use config::EngineConfig;
pub use context::MediationContext;
pub use engine::{Pipeline, Supervised};
pub use error::{ResolveError, RouteError};
pub use error_handler::{
    DeadLetter, ErrorHandler, ErrorHandlerDefinition, ErrorHandlerStats, ExceptionMatcher,
    ExceptionPolicy, RedeliverFrom, RedeliveryPolicy,
};
pub use route::{
    Route, RouteDefinition, RouteHandle, RouteState, RouteStats, SplitDefinition, StepDefinition,
    WhenDefinition,
};
