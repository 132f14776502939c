//! Route definitions, assembly and lifecycle.

mod assemble;
pub mod definition;
pub mod entry;
pub mod handle;
pub mod lifecycle;

pub use definition::{
    RouteDefinition, SplitDefinition, SplitExpression, StepDefinition, WhenDefinition,
};
pub use entry::{RouteState, RouteStats};
pub use handle::RouteHandle;
pub use lifecycle::Route;
