//! The exchange: one message's journey through a route activation.
//!
//! An [`Exchange`] is deliberately not `Clone`. Processors receive it by value
//! and hand it back when they finish, so exactly one step owns it at a time,
//! including across asynchronous suspensions. [`Exchange::copy`] produces an
//! independent exchange with a fresh id for splitting and multicast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Failure;
use crate::message::Message;
use crate::unit_of_work::UnitOfWork;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Well-known property keys
// ---------------------------------------------------------------------------

/// Failure moved off the exchange before it was handed to a dead letter.
pub const EXCEPTION_CAUGHT: &str = "switchyard.exception_caught";
/// Zero-based index of the pipeline step that failed.
pub const FAILURE_STEP: &str = "switchyard.failure_step";
/// Route in which the failure occurred.
pub const FAILURE_ROUTE_ID: &str = "switchyard.failure_route_id";
/// Zero-based position of a split part.
pub const SPLIT_INDEX: &str = "switchyard.split_index";
/// Total number of split parts.
pub const SPLIT_SIZE: &str = "switchyard.split_size";
/// Set on the last split part.
pub const SPLIT_COMPLETE: &str = "switchyard.split_complete";
/// URI of the endpoint the exchange was last sent to.
pub const TO_ENDPOINT: &str = "switchyard.to_endpoint";
/// Set when redeliveries ran out and no dead letter handled the failure.
pub const REDELIVERY_EXHAUSTED: &str = "switchyard.redelivery_exhausted";

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// Fire and forget.
    #[default]
    InOnly,
    /// Request and reply.
    InOut,
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    message: Message,
    response: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<Failure>,
    unit_of_work: Arc<UnitOfWork>,
    redelivery_count: u32,
    created: SystemTime,
    route_stop: bool,
    failure_handled: bool,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange {
    /// Creates an `InOnly` exchange with a generated id and an empty message.
    #[must_use]
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        let unit_of_work = UnitOfWork::new(id.clone());
        Self::from_parts(id, ExchangePattern::InOnly, Message::new(), unit_of_work)
    }

    #[must_use]
    pub fn with_body(body: impl Into<Value>) -> Self {
        let mut exchange = Self::new();
        exchange.message.set_body(body);
        exchange
    }

    #[must_use]
    pub fn with_message(message: Message) -> Self {
        let mut exchange = Self::new();
        exchange.message = message;
        exchange
    }

    fn from_parts(
        id: String,
        pattern: ExchangePattern,
        message: Message,
        unit_of_work: Arc<UnitOfWork>,
    ) -> Self {
        Self {
            id,
            pattern,
            message,
            response: None,
            properties: HashMap::new(),
            exception: None,
            unit_of_work,
            redelivery_count: 0,
            created: SystemTime::now(),
            route_stop: false,
            failure_handled: false,
        }
    }

    /// Rebuilds a failed exchange after the original was lost by a step.
    ///
    /// Keeps identity and unit of work so completion still fires for the
    /// right exchange; message and properties are gone.
    #[must_use]
    pub fn stub(
        id: String,
        pattern: ExchangePattern,
        unit_of_work: Arc<UnitOfWork>,
        failure: Failure,
    ) -> Self {
        let mut exchange = Self::from_parts(id, pattern, Message::new(), unit_of_work);
        exchange.exception = Some(failure);
        exchange
    }

    /// Copies this exchange for independent routing.
    ///
    /// The copy has a fresh id, cloned messages and properties, no exception,
    /// and a new unit of work that reports unhandled failures to this one.
    #[must_use]
    pub fn copy(&self) -> Self {
        let id = Uuid::new_v4().to_string();
        let unit_of_work = UnitOfWork::child_of(id.clone(), &self.unit_of_work);
        let mut copy = Self::from_parts(id, self.pattern, self.message.clone(), unit_of_work);
        copy.response.clone_from(&self.response);
        copy.properties.clone_from(&self.properties);
        copy
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    #[must_use]
    pub fn created(&self) -> SystemTime {
        self.created
    }

    #[must_use]
    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.unit_of_work
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// The request message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn set_message(&mut self, message: Message) {
        self.message = message;
    }

    /// Shorthand for `message().body()`.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.message.body()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.set_body(body);
    }

    #[must_use]
    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Returns the response message, creating an empty one if needed.
    pub fn response_mut(&mut self) -> &mut Message {
        self.response.get_or_insert_with(Message::new)
    }

    pub fn set_response(&mut self, message: Message) {
        self.response = Some(message);
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response.take()
    }

    /// Moves a pending response into the request slot, so the next step
    /// reads what the previous one produced.
    pub fn promote_response(&mut self) {
        if let Some(response) = self.response.take() {
            self.message = response;
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    #[must_use]
    pub fn property_as<T: 'static>(&self, key: &str) -> Option<&T> {
        self.properties.get(key).and_then(Value::downcast_ref::<T>)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // -----------------------------------------------------------------------
    // Failure state
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn exception(&self) -> Option<&Failure> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Attaches an error as the exchange's failure, replacing any previous one.
    pub fn set_exception(&mut self, error: impl Into<anyhow::Error>) {
        self.exception = Some(Failure::new(error));
    }

    pub fn set_failure(&mut self, failure: Failure) {
        self.exception = Some(failure);
    }

    pub fn take_exception(&mut self) -> Option<Failure> {
        self.exception.take()
    }

    /// Set once a dead letter handled the failure.
    #[must_use]
    pub fn is_failure_handled(&self) -> bool {
        self.failure_handled
    }

    pub fn set_failure_handled(&mut self, handled: bool) {
        self.failure_handled = handled;
    }

    #[must_use]
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub fn increment_redelivery_count(&mut self) -> u32 {
        self.redelivery_count = self.redelivery_count.saturating_add(1);
        self.redelivery_count
    }

    #[must_use]
    pub fn is_redelivered(&self) -> bool {
        self.redelivery_count > 0
    }

    /// `true` once a step asked to end routing early.
    #[must_use]
    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_exchange_defaults() {
        let ex = Exchange::new();
        assert_eq!(ex.pattern(), ExchangePattern::InOnly);
        assert!(ex.body().is_none());
        assert!(!ex.is_failed());
        assert_eq!(ex.redelivery_count(), 0);
        assert_eq!(ex.unit_of_work().exchange_id(), ex.id());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Exchange::new().id(), Exchange::new().id());
    }

    #[test]
    fn copy_has_fresh_identity_and_shared_payload() {
        let mut ex = Exchange::with_body("payload");
        ex.set_pattern(ExchangePattern::InOut);
        ex.set_property("k", 1_i64);
        ex.set_exception(anyhow::anyhow!("parent failure"));

        let copy = ex.copy();
        assert_ne!(copy.id(), ex.id());
        assert_eq!(copy.pattern(), ExchangePattern::InOut);
        assert_eq!(copy.property_as::<i64>("k"), Some(&1));
        assert!(!copy.is_failed());
        assert!(copy.body().unwrap().ptr_eq(ex.body().unwrap()));
        assert!(!Arc::ptr_eq(copy.unit_of_work(), ex.unit_of_work()));
    }

    #[test]
    fn copy_mutation_does_not_leak_back() {
        let ex = Exchange::with_body("a");
        let mut copy = ex.copy();
        copy.set_body("b");
        copy.message_mut().set_header("h", "v");
        assert_eq!(ex.body().and_then(Value::as_str), Some("a"));
        assert!(ex.message().header("h").is_none());
    }

    #[test]
    fn promote_response_replaces_request() {
        let mut ex = Exchange::with_body("request");
        ex.promote_response();
        assert_eq!(ex.body().and_then(Value::as_str), Some("request"));

        ex.response_mut().set_body("reply");
        ex.promote_response();
        assert_eq!(ex.body().and_then(Value::as_str), Some("reply"));
        assert!(!ex.has_response());
    }

    #[test]
    fn redelivery_counter_is_monotonic() {
        let mut ex = Exchange::new();
        assert_eq!(ex.increment_redelivery_count(), 1);
        assert_eq!(ex.increment_redelivery_count(), 2);
        assert!(ex.is_redelivered());
    }
}
