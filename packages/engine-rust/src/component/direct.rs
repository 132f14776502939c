//! `direct:` synchronous in-process hand-off.
//!
//! A producer calls the consuming route's entry processor on the caller's
//! thread. Each name has at most one consumer.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use switchyard_core::{
    AsyncCallback, Completion, Component, Consumer, Endpoint, EndpointUri, Exchange, Processor,
};
use tracing::debug;

type Consumers = Arc<DashMap<String, Arc<dyn Processor>>>;

/// No route consumes the `direct:` name an exchange was sent to.
#[derive(Debug, thiserror::Error)]
#[error("no consumer on direct:{0}")]
pub struct NoConsumer(pub String);

#[derive(Default)]
pub struct DirectComponent {
    consumers: Consumers,
}

impl DirectComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_consumer(&self, name: &str) -> bool {
        self.consumers.contains_key(name)
    }
}

impl Component for DirectComponent {
    fn scheme(&self) -> &str {
        "direct"
    }

    fn create_endpoint(&self, uri: &EndpointUri) -> anyhow::Result<Arc<dyn Endpoint>> {
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            name: uri.path().to_string(),
            consumers: Arc::clone(&self.consumers),
        }))
    }
}

struct DirectEndpoint {
    uri: String,
    name: String,
    consumers: Consumers,
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Processor>> {
        Ok(Arc::new(DirectProducer {
            name: self.name.clone(),
            label: format!("direct:{}", self.name),
            consumers: Arc::clone(&self.consumers),
        }))
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>) -> anyhow::Result<Box<dyn Consumer>> {
        Ok(Box::new(DirectConsumer {
            name: self.name.clone(),
            processor,
            consumers: Arc::clone(&self.consumers),
        }))
    }
}

struct DirectProducer {
    name: String,
    label: String,
    consumers: Consumers,
}

impl Processor for DirectProducer {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let target = self.consumers.get(&self.name).map(|c| Arc::clone(c.value()));
        match target {
            Some(processor) => processor.process(exchange, callback),
            None => {
                exchange.set_exception(NoConsumer(self.name.clone()));
                Completion::Sync(exchange)
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

struct DirectConsumer {
    name: String,
    processor: Arc<dyn Processor>,
    consumers: Consumers,
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        match self.consumers.entry(self.name.clone()) {
            Entry::Occupied(_) => anyhow::bail!("direct:{} already has a consumer", self.name),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&self.processor));
                debug!(endpoint = %self.name, "direct consumer started");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let ours = &self.processor;
        self.consumers
            .remove_if(&self.name, |_, registered| Arc::ptr_eq(registered, ours));
        Ok(())
    }
}
