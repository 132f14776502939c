//! `mock:` recording endpoint for tests.
//!
//! Every exchange sent to `mock:name` is recorded on the shared
//! [`MockEndpoint`] for that name, which tests fetch with
//! [`MockComponent::endpoint`]. `mock:name?fail_first=2` fails the first two
//! deliveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_core::{
    AsyncCallback, Completion, Component, Consumer, Endpoint, EndpointUri, Exchange, Failure,
    Message, Processor, Value,
};
use tokio::sync::Notify;

/// Failure injected by a mock endpoint told to fail deliveries.
#[derive(Debug, thiserror::Error)]
#[error("mock:{endpoint} failed delivery {delivery}")]
pub struct MockFailure {
    pub endpoint: String,
    pub delivery: usize,
}

/// Snapshot of one exchange as it reached the endpoint.
#[derive(Debug, Clone)]
pub struct Received {
    pub exchange_id: String,
    pub message: Message,
    pub properties: HashMap<String, Value>,
    pub redelivery_count: u32,
    pub exception: Option<Failure>,
}

#[derive(Default)]
pub struct MockComponent {
    endpoints: DashMap<String, Arc<MockEndpoint>>,
}

impl MockComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint registered under `name`, created on first use.
    pub fn endpoint(&self, name: &str) -> Arc<MockEndpoint> {
        Arc::clone(
            self.endpoints
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MockEndpoint::new(name)))
                .value(),
        )
    }
}

impl Component for MockComponent {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn create_endpoint(&self, uri: &EndpointUri) -> anyhow::Result<Arc<dyn Endpoint>> {
        let endpoint = self.endpoint(uri.path());
        if let Some(raw) = uri.param("fail_first") {
            let n = raw
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("{uri}: fail_first must be a count"))?;
            endpoint.fail_first(n);
        }
        Ok(endpoint)
    }
}

struct Recorder {
    name: String,
    received: Mutex<Vec<Received>>,
    fail_remaining: AtomicU32,
    arrived: Notify,
}

pub struct MockEndpoint {
    uri: String,
    recorder: Arc<Recorder>,
}

impl MockEndpoint {
    fn new(name: &str) -> Self {
        Self {
            uri: format!("mock:{name}"),
            recorder: Arc::new(Recorder {
                name: name.to_string(),
                received: Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(0),
                arrived: Notify::new(),
            }),
        }
    }

    /// Fails the next `n` deliveries with [`MockFailure`].
    pub fn fail_first(&self, n: u32) {
        self.recorder.fail_remaining.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn received(&self) -> Vec<Received> {
        self.recorder.received.lock().clone()
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.recorder.received.lock().len()
    }

    /// Bodies in arrival order. Deliveries without a body are skipped.
    #[must_use]
    pub fn received_bodies(&self) -> Vec<Value> {
        self.recorder
            .received
            .lock()
            .iter()
            .filter_map(|r| r.message.body().cloned())
            .collect()
    }

    pub fn reset(&self) {
        self.recorder.received.lock().clear();
        self.recorder.fail_remaining.store(0, Ordering::SeqCst);
    }

    /// Waits until at least `count` exchanges arrived. Returns `false` on
    /// timeout.
    pub async fn await_count(&self, count: usize, timeout: Duration) -> bool {
        let recorder = &self.recorder;
        tokio::time::timeout(timeout, async {
            loop {
                let arrived = recorder.arrived.notified();
                if recorder.received.lock().len() >= count {
                    return;
                }
                arrived.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Processor>> {
        Ok(Arc::new(MockProducer {
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn create_consumer(&self, _processor: Arc<dyn Processor>) -> anyhow::Result<Box<dyn Consumer>> {
        anyhow::bail!("{} cannot consume", self.uri)
    }
}

struct MockProducer {
    recorder: Arc<Recorder>,
}

impl Processor for MockProducer {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        let delivery = {
            let mut received = self.recorder.received.lock();
            received.push(Received {
                exchange_id: exchange.id().to_string(),
                message: exchange.message().clone(),
                properties: exchange.properties().clone(),
                redelivery_count: exchange.redelivery_count(),
                exception: exchange.exception().cloned(),
            });
            received.len()
        };
        self.recorder.arrived.notify_waiters();

        let fail = self
            .recorder
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            exchange.set_exception(MockFailure {
                endpoint: self.recorder.name.clone(),
                delivery,
            });
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.recorder.name
    }
}
