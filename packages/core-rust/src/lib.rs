//! Switchyard Core — exchange model, type conversion, unit of work and the
//! collaborator contracts (processors, endpoints, data formats).

pub mod convert;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod traits;
pub mod unit_of_work;
pub mod value;

pub use convert::{
    BuiltinConverters, ConverterExists, ConverterStatistics, TypeConverterLoader,
    TypeConverterRegistry,
};
pub use endpoint::{Component, Consumer, Endpoint, EndpointUri, UriError};
pub use error::{
    CancelReason, ContractViolation, DeadLetterFailed, ExchangeCancelled, Failure,
    RouteNotStarted, TypeConversionError, UnitOfWorkError,
};
pub use exchange::{Exchange, ExchangePattern};
pub use message::{Attachment, Headers, Message};
pub use traits::{AsyncCallback, AsyncProcessor, Completion, DataFormat, Processor};
pub use unit_of_work::{Synchronization, UnitOfWork};
pub use value::{TypeKey, Value};

/// Re-exported so collaborators share the engine's cancellation type.
pub use tokio_util::sync::CancellationToken;
