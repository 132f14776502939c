//! `log:` writes each exchange it receives to `tracing`.
//!
//! `log:orders?level=debug&show_body=false`. The level defaults to `info`
//! and the body is shown unless `show_body=false`.

use std::sync::Arc;

use switchyard_core::{
    AsyncCallback, Completion, Component, Consumer, Endpoint, EndpointUri, Exchange, Processor,
};
use tracing::{debug, error, info, trace, warn, Level};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogComponent;

impl Component for LogComponent {
    fn scheme(&self) -> &str {
        "log"
    }

    fn create_endpoint(&self, uri: &EndpointUri) -> anyhow::Result<Arc<dyn Endpoint>> {
        let level = match uri.param("level") {
            None => Level::INFO,
            Some(raw) => raw
                .parse::<Level>()
                .map_err(|_| anyhow::anyhow!("log: unknown level '{raw}'"))?,
        };
        Ok(Arc::new(LogEndpoint {
            uri: uri.to_string(),
            logger: uri.path().to_string(),
            level,
            show_body: uri.param_or("show_body", true),
        }))
    }
}

struct LogEndpoint {
    uri: String,
    logger: String,
    level: Level,
    show_body: bool,
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Processor>> {
        Ok(Arc::new(LogProducer {
            label: format!("log:{}", self.logger),
            logger: self.logger.clone(),
            level: self.level,
            show_body: self.show_body,
        }))
    }

    fn create_consumer(&self, _processor: Arc<dyn Processor>) -> anyhow::Result<Box<dyn Consumer>> {
        anyhow::bail!("{} cannot consume", self.uri)
    }
}

struct LogProducer {
    label: String,
    logger: String,
    level: Level,
    show_body: bool,
}

impl LogProducer {
    fn describe(&self, exchange: &Exchange) -> String {
        if !self.show_body {
            return String::new();
        }
        match exchange.body() {
            None => "<no body>".to_string(),
            Some(body) => body
                .as_str()
                .map_or_else(|| format!("<{}>", body.type_name()), str::to_string),
        }
    }
}

impl Processor for LogProducer {
    fn process(&self, exchange: Exchange, _callback: AsyncCallback) -> Completion {
        let body = self.describe(&exchange);
        let exchange_id = exchange.id();
        let logger = self.logger.as_str();
        let pattern = exchange.pattern();
        let failed = exchange.is_failed();
        match self.level {
            Level::ERROR => error!(logger, exchange_id, ?pattern, failed, body = %body, "exchange"),
            Level::WARN => warn!(logger, exchange_id, ?pattern, failed, body = %body, "exchange"),
            Level::INFO => info!(logger, exchange_id, ?pattern, failed, body = %body, "exchange"),
            Level::DEBUG => debug!(logger, exchange_id, ?pattern, failed, body = %body, "exchange"),
            _ => trace!(logger, exchange_id, ?pattern, failed, body = %body, "exchange"),
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.label
    }
}
