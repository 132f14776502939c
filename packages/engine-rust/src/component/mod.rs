//! In-process components registered with every context.

pub mod direct;
pub mod log;
pub mod mock;
pub mod seda;

pub use direct::{DirectComponent, NoConsumer};
pub use log::LogComponent;
pub use mock::{MockComponent, MockEndpoint, MockFailure, Received};
pub use seda::{QueueFull, SedaComponent, DEFAULT_QUEUE_SIZE};
