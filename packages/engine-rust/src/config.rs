//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_handler::RedeliveryPolicy;

/// Settings shared by every route in a mediation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long `stop()` waits for in-flight exchanges before cancelling them.
    pub drain_timeout: Duration,
    /// Time cancelled exchanges get to reach a step boundary before their
    /// units of work are completed on their behalf.
    pub cancel_grace: Duration,
    /// Deadline for an asynchronous step to hand its exchange back. `None`
    /// waits forever.
    pub async_step_timeout: Option<Duration>,
    /// Redelivery policy for routes that do not configure their own.
    pub default_redelivery: RedeliveryPolicy,
    /// Wraps every leaf step in timing and outcome instrumentation.
    pub instrument_steps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_millis(100),
            async_step_timeout: None,
            default_redelivery: RedeliveryPolicy::default(),
            instrument_steps: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    #[must_use]
    pub fn with_async_step_timeout(mut self, timeout: Duration) -> Self {
        self.async_step_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_default_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.default_redelivery = policy;
        self
    }

    #[must_use]
    pub fn with_instrumentation(mut self, enabled: bool) -> Self {
        self.instrument_steps = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.cancel_grace, Duration::from_millis(100));
        assert!(config.async_step_timeout.is_none());
        assert_eq!(config.default_redelivery.max_redeliveries, 0);
        assert!(config.instrument_steps);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"drain_timeout":{"secs":5,"nanos":0},"default_redelivery":{"max_redeliveries":3}}"#,
        )
        .unwrap();
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.default_redelivery.max_redeliveries, 3);
        assert_eq!(
            config.default_redelivery.redelivery_delay,
            Duration::from_secs(1)
        );
        assert!(config.instrument_steps);
    }
}
