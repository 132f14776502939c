//! Type converter registry: on-demand conversion of bodies, headers and
//! properties between arbitrary Rust types.

mod builtin;
mod hierarchy;
mod registry;

use serde::{Deserialize, Serialize};

pub use builtin::BuiltinConverters;
pub use registry::TypeConverterRegistry;

/// What `add_converter` does when the `(source, target)` pair is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterExists {
    /// Replace the existing converter. The replacement counts as a new
    /// registration for tie-breaking.
    #[default]
    Override,
    /// Keep the existing converter.
    Ignore,
    /// Reject the registration.
    Fail,
}

/// Snapshot of registry lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConverterStatistics {
    pub attempts: u64,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

/// Registers converters from an external module at startup.
pub trait TypeConverterLoader: Send + Sync {
    /// # Errors
    ///
    /// Any registration error aborts the load.
    fn load(&self, registry: &TypeConverterRegistry) -> anyhow::Result<()>;
}
