//! Producer invocation.

use std::sync::Arc;

use switchyard_core::exchange::TO_ENDPOINT;
use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};

/// Sends the exchange to an endpoint's producer, recording the endpoint URI
/// under [`TO_ENDPOINT`].
pub struct SendTo {
    uri: String,
    producer: Arc<dyn Processor>,
    name: String,
}

impl SendTo {
    #[must_use]
    pub fn new(uri: impl Into<String>, producer: Arc<dyn Processor>) -> Self {
        let uri = uri.into();
        Self {
            name: format!("to({uri})"),
            uri,
            producer,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Processor for SendTo {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        exchange.set_property(TO_ENDPOINT, self.uri.clone());
        self.producer.process(exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
