pub mod message;
pub mod properties;

use crate::endpoint::EndpointKey;
use crate::unit_of_work::UnitOfWork;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use message::{Attachment, Body, HeaderValue, Headers, Message};
pub use properties::{Properties, PropertyValue};

/// Error stored on an exchange. Shared so that the same failure can be recorded by several
/// branches and still be recognised by identity.
pub type Failure = Arc<dyn Error + Send + Sync + 'static>;

/// Returns true when both failures are the same instance.
pub fn same_failure(left: &Failure, right: &Failure) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Exchange '{exchange_id}' carries a {actual} body where {expected} was expected.")]
    BodyType {
        exchange_id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl ExchangeError {
    #[inline]
    pub fn body_type(
        exchange_id: impl Into<String>,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        ExchangeError::BodyType {
            exchange_id: exchange_id.into(),
            expected,
            actual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// Fire and forget.
    #[default]
    InOnly,
    /// Request and response.
    InOut,
}

impl ExchangePattern {
    pub fn is_out_capable(&self) -> bool {
        matches!(self, ExchangePattern::InOut)
    }
}

impl Display for ExchangePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangePattern::InOnly => write!(f, "InOnly"),
            ExchangePattern::InOut => write!(f, "InOut"),
        }
    }
}

/// The unit of work moved through a route.
///
/// An exchange carries an inbound [`Message`], at most one outbound [`Message`], a typed
/// property bag and an optional failure. It is owned by exactly one step at a time: the
/// dispatch primitive moves it from step to step and hands it back through the completion
/// callback, so no locking is involved in mutating it.
///
/// Exchanges have no value equality. Two structurally identical exchanges are still two
/// distinct units of work, compare them by [`Exchange::id`] if needed.
///
/// # Examples
/// ```rust
/// use switchyard::exchange::{Exchange, ExchangePattern, Message};
///
/// let mut exchange = Exchange::new(ExchangePattern::InOut);
/// exchange.input_mut().set_body("ping");
/// exchange.set_out(Message::with_body("pong"));
/// assert!(exchange.has_out());
/// assert_eq!(exchange.out().and_then(|m| m.body().as_text()), Some("pong"));
/// ```
pub struct Exchange {
    id: OnceCell<String>,
    pattern: ExchangePattern,
    created: DateTime<Utc>,
    context: Option<Arc<str>>,
    from_endpoint: Option<EndpointKey>,
    from_route_id: Option<String>,
    input: Message,
    output: Option<Message>,
    properties: Properties,
    exception: Option<Failure>,
    route_stop: bool,
    unit_of_work: Option<Arc<UnitOfWork>>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        Self {
            id: OnceCell::new(),
            pattern,
            created: Utc::now(),
            context: None,
            from_endpoint: None,
            from_route_id: None,
            input: Message::new(),
            output: None,
            properties: Properties::new(),
            exception: None,
            route_stop: false,
            unit_of_work: None,
        }
    }

    pub fn with_body(pattern: ExchangePattern, body: impl Into<Body>) -> Self {
        let mut exchange = Self::new(pattern);
        exchange.input.set_body(body);
        exchange
    }

    /// The exchange id. Generated on first access.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| Uuid::new_v4().to_string())
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = OnceCell::with_value(id.into());
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Name of the engine that created this exchange.
    pub fn context_name(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn set_context_name(&mut self, name: Arc<str>) {
        self.context = Some(name);
    }

    pub fn from_endpoint(&self) -> Option<&EndpointKey> {
        self.from_endpoint.as_ref()
    }

    pub fn set_from_endpoint(&mut self, key: EndpointKey) {
        self.from_endpoint = Some(key);
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    pub fn set_input(&mut self, message: Message) {
        self.input = message;
    }

    pub fn has_out(&self) -> bool {
        self.output.is_some()
    }

    pub fn out(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    /// Returns the out message, creating an empty one if none is set.
    pub fn out_mut(&mut self) -> &mut Message {
        self.output.get_or_insert_with(Message::new)
    }

    /// Sets the out message, replacing any previous one.
    pub fn set_out(&mut self, message: Message) {
        self.output = Some(message);
    }

    /// The message a step should read: the out message when present, else the in message.
    pub fn message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.output {
            Some(ref mut message) => message,
            None => &mut self.input,
        }
    }

    /// Moves the out message into the in slot so the next step sees the previous step's
    /// result as its input. Returns false when there was nothing to promote.
    pub fn promote_out(&mut self) -> bool {
        match self.output.take() {
            Some(message) => {
                self.input = message;
                true
            }
            None => false,
        }
    }

    pub fn in_body_text(&self) -> Result<&str, ExchangeError> {
        let body = self.input.body();
        body.as_text()
            .ok_or_else(|| ExchangeError::body_type(self.id(), "text", body.kind()))
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn property<V>(&self, key: &str) -> Option<&V>
    where
        V: std::any::Any,
    {
        self.properties.get(key)
    }

    pub fn set_property<V>(&mut self, key: impl Into<String>, value: V)
    where
        V: std::any::Any + Send + Sync,
    {
        self.properties.insert(key, value);
    }

    pub fn exception(&self) -> Option<&Failure> {
        self.exception.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn set_exception<E>(&mut self, error: E)
    where
        E: Error + Send + Sync + 'static,
    {
        self.exception = Some(Arc::new(error));
    }

    pub fn set_failure(&mut self, failure: Failure) {
        self.exception = Some(failure);
    }

    pub fn take_exception(&mut self) -> Option<Failure> {
        self.exception.take()
    }

    /// Marks the exchange so that the remaining steps of the current pipeline are skipped.
    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: Arc<UnitOfWork>) {
        self.unit_of_work = Some(unit_of_work);
    }

    pub fn take_unit_of_work(&mut self) -> Option<Arc<UnitOfWork>> {
        self.unit_of_work.take()
    }

    /// Creates a new exchange with a fresh id carrying copies of this exchange's messages,
    /// properties and failure. The unit of work is not carried over.
    pub fn copy(&self) -> Exchange {
        let mut copy = Exchange::new(self.pattern);
        copy.context = self.context.clone();
        copy.from_endpoint = self.from_endpoint.clone();
        copy.from_route_id = self.from_route_id.clone();
        copy.copy_from(self);
        copy
    }

    /// Replaces messages, properties, pattern and failure with copies of `other`'s.
    /// Header and property values and bodies are shared with `other`, the id and the unit of
    /// work of this exchange are kept.
    pub fn copy_from(&mut self, other: &Exchange) {
        self.pattern = other.pattern;
        self.input.copy_from(&other.input);
        self.output = other.output.clone();
        self.properties = other.properties.clone();
        self.exception = other.exception.clone();
        self.route_stop = other.route_stop;
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(ExchangePattern::InOnly)
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id.get())
            .field("pattern", &self.pattern)
            .field("from_endpoint", &self.from_endpoint)
            .field("has_out", &self.output.is_some())
            .field("failed", &self.exception.is_some())
            .finish()
    }
}
