//! Built-in processors.
//!
//! Leaf steps (`transform`, `marshal`, `send`, `adapter`) touch only the
//! exchange they are handed. Composite steps (`routing`, `split`) hand the
//! exchange on to child processors under the same completion contract.

pub mod adapter;
pub mod marshal;
pub mod routing;
pub mod send;
pub mod split;
pub mod transform;

pub use adapter::{async_fn, AsyncStep, ServiceStep};
pub use marshal::{Marshal, Unmarshal};
pub use routing::{Choice, Filter, Predicate, FILTER_MATCHED};
pub use send::SendTo;
pub use split::{AggregationStrategy, CollectBodies, LatestBody, Splitter};
pub use transform::{process_fn, ConvertBodyTo, FnProcessor, SetBody, SetHeader};
