//! `seda:` queue-backed asynchronous hand-off.
//!
//! Producers enqueue without blocking; one background worker per consumer
//! feeds queued exchanges to the route, one at a time. `InOnly` exchanges are
//! copied into the queue and the producer returns at once; `InOut` exchanges
//! travel through the queue and the producer completes when the consuming
//! route has replied.
//!
//! URI parameters: `size` (queue capacity, default 1000).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_core::{
    AsyncCallback, Completion, Component, Consumer, Endpoint, EndpointUri, Exchange,
    ExchangePattern, Processor,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// A `seda:` queue had no room for the exchange.
#[derive(Debug, thiserror::Error)]
#[error("seda:{name} queue is full ({capacity})")]
pub struct QueueFull {
    pub name: String,
    pub capacity: usize,
}

struct Delivery {
    exchange: Exchange,
    reply: Option<AsyncCallback>,
}

struct Queue {
    name: String,
    capacity: usize,
    tx: mpsc::Sender<Delivery>,
    /// Held by the queue while no consumer is running.
    rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
}

impl Queue {
    fn new(name: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn pending(&self) -> usize {
        self.capacity.max(1) - self.tx.capacity()
    }
}

#[derive(Default)]
pub struct SedaComponent {
    queues: DashMap<String, Arc<Queue>>,
}

impl SedaComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchanges waiting in the named queue.
    #[must_use]
    pub fn queue_size(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.pending())
    }
}

impl Component for SedaComponent {
    fn scheme(&self) -> &str {
        "seda"
    }

    fn create_endpoint(&self, uri: &EndpointUri) -> anyhow::Result<Arc<dyn Endpoint>> {
        let capacity = uri.param_or("size", DEFAULT_QUEUE_SIZE);
        let queue = self
            .queues
            .entry(uri.path().to_string())
            .or_insert_with(|| Arc::new(Queue::new(uri.path(), capacity)))
            .clone();
        Ok(Arc::new(SedaEndpoint {
            uri: uri.to_string(),
            queue,
        }))
    }
}

struct SedaEndpoint {
    uri: String,
    queue: Arc<Queue>,
}

impl Endpoint for SedaEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Processor>> {
        Ok(Arc::new(SedaProducer {
            label: format!("seda:{}", self.queue.name),
            queue: Arc::clone(&self.queue),
        }))
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>) -> anyhow::Result<Box<dyn Consumer>> {
        Ok(Box::new(SedaConsumer {
            queue: Arc::clone(&self.queue),
            processor,
            worker: Mutex::new(None),
        }))
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct SedaProducer {
    label: String,
    queue: Arc<Queue>,
}

impl SedaProducer {
    fn full(&self) -> QueueFull {
        QueueFull {
            name: self.queue.name.clone(),
            capacity: self.queue.capacity,
        }
    }
}

impl Processor for SedaProducer {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        match exchange.pattern() {
            ExchangePattern::InOnly => {
                let delivery = Delivery {
                    exchange: exchange.copy(),
                    reply: None,
                };
                if self.queue.tx.try_send(delivery).is_err() {
                    exchange.set_exception(self.full());
                }
                Completion::Sync(exchange)
            }
            ExchangePattern::InOut => {
                let delivery = Delivery {
                    exchange,
                    reply: Some(callback),
                };
                match self.queue.tx.try_send(delivery) {
                    Ok(()) => Completion::Async,
                    Err(
                        mpsc::error::TrySendError::Full(rejected)
                        | mpsc::error::TrySendError::Closed(rejected),
                    ) => {
                        let mut exchange = rejected.exchange;
                        exchange.set_exception(self.full());
                        Completion::Sync(exchange)
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<mpsc::Receiver<Delivery>>,
}

struct SedaConsumer {
    queue: Arc<Queue>,
    processor: Arc<dyn Processor>,
    worker: Mutex<Option<Worker>>,
}

/// Routes one exchange and waits until the route hands it back.
async fn deliver(processor: &dyn Processor, exchange: Exchange) -> Option<Exchange> {
    let (tx, rx) = oneshot::channel();
    let callback = AsyncCallback::from_fn(move |ex| {
        let _ = tx.send(ex);
    });
    match processor.process(exchange, callback) {
        Completion::Sync(ex) => Some(ex),
        Completion::Async => rx.await.ok(),
    }
}

#[async_trait]
impl Consumer for SedaConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let Some(mut rx) = self.queue.rx.lock().take() else {
            anyhow::bail!("seda:{} already has a consumer", self.queue.name);
        };
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let processor = Arc::clone(&self.processor);
        let name = self.queue.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    delivery = rx.recv() => {
                        let Some(Delivery { exchange, reply }) = delivery else {
                            break;
                        };
                        let id = exchange.id().to_string();
                        match (deliver(processor.as_ref(), exchange).await, reply) {
                            (Some(done), Some(reply)) => reply.done(done),
                            (Some(_), None) => {}
                            (None, _) => {
                                warn!(queue = %name, exchange_id = %id, "exchange lost by route");
                            }
                        }
                    }
                }
            }
            debug!(queue = %name, "seda worker stopped");
            rx
        });

        *self.worker.lock() = Some(Worker { shutdown, handle });
        debug!(queue = %self.queue.name, "seda consumer started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let worker = self.worker.lock().take();
        if let Some(Worker { shutdown, handle }) = worker {
            let _ = shutdown.send(());
            let rx = handle.await?;
            // Hand the queue back so a restarted consumer resumes it.
            *self.queue.rx.lock() = Some(rx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchyard_core::Value;

    use super::*;
    use crate::processor::process_fn;

    fn endpoint(component: &SedaComponent, uri: &str) -> Arc<dyn Endpoint> {
        component
            .create_endpoint(&EndpointUri::parse(uri).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn in_only_returns_at_once_and_delivers_a_copy() {
        let component = SedaComponent::new();
        let ep = endpoint(&component, "seda:work");
        let producer = ep.create_producer().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = ep
            .create_consumer(process_fn("collect", move |ex| {
                let body = ex.body().and_then(Value::as_str).map(String::from);
                let _ = tx.send((ex.id().to_string(), body));
                Ok(())
            }))
            .unwrap();

        let exchange = Exchange::with_body("job");
        let original_id = exchange.id().to_string();
        let out = producer.process(exchange, AsyncCallback::noop());
        assert!(out.is_sync());
        assert_eq!(component.queue_size("work"), 1);

        consumer.start().await.unwrap();
        let (id, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(id, original_id);
        assert_eq!(body.as_deref(), Some("job"));
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn in_out_waits_for_the_reply() {
        let component = SedaComponent::new();
        let ep = endpoint(&component, "seda:rpc");
        let consumer = ep
            .create_consumer(process_fn("reply", |ex| {
                ex.set_body("pong");
                Ok(())
            }))
            .unwrap();
        consumer.start().await.unwrap();

        let producer = ep.create_producer().unwrap();
        let mut exchange = Exchange::with_body("ping");
        exchange.set_pattern(ExchangePattern::InOut);
        let (tx, rx) = oneshot::channel();
        let out = producer.process(
            exchange,
            AsyncCallback::from_fn(move |ex| {
                let _ = tx.send(ex);
            }),
        );
        assert!(!out.is_sync());
        let ex = rx.await.unwrap();
        assert_eq!(ex.body().and_then(Value::as_str), Some("pong"));
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_fails_the_exchange() {
        let component = SedaComponent::new();
        let producer = endpoint(&component, "seda:tiny?size=1").create_producer().unwrap();
        assert!(producer.process(Exchange::new(), AsyncCallback::noop()).is_sync());
        match producer.process(Exchange::new(), AsyncCallback::noop()) {
            Completion::Sync(ex) => assert!(ex.exception().unwrap().is::<QueueFull>()),
            Completion::Async => panic!("expected sync"),
        }
    }

    #[tokio::test]
    async fn restarted_consumer_resumes_the_queue() {
        let component = SedaComponent::new();
        let ep = endpoint(&component, "seda:again");
        let consumer = ep.create_consumer(process_fn("noop", |_| Ok(()))).unwrap();
        consumer.start().await.unwrap();
        assert!(ep
            .create_consumer(process_fn("other", |_| Ok(())))
            .unwrap()
            .start()
            .await
            .is_err());
        consumer.stop().await.unwrap();
        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
    }
}
