pub mod key;
pub mod registry;

use crate::exchange::{Exchange, ExchangePattern};
use crate::polling::PollingConsumer;
use crate::processor::AsyncProcessor;
use crate::service::{BoxError, Service, Suspendable};
use std::sync::Arc;
use thiserror::Error;

pub use key::EndpointKey;
pub use registry::{ComponentRegistry, ComponentRegistryError, EndpointRegistry, FnComponent};

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Invalid endpoint uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("No component registered for scheme '{scheme}'.")]
    UnknownComponent { scheme: String },

    #[error("Endpoint '{endpoint}' failed to create a {kind}.")]
    Creation {
        endpoint: String,
        kind: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Endpoint '{endpoint}' does not support {operation}.")]
    Unsupported {
        endpoint: String,
        operation: &'static str,
    },
}

impl EndpointError {
    #[inline]
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        EndpointError::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn unknown_component(scheme: impl Into<String>) -> Self {
        EndpointError::UnknownComponent {
            scheme: scheme.into(),
        }
    }

    #[inline]
    pub fn creation(
        endpoint: &EndpointKey,
        kind: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        EndpointError::Creation {
            endpoint: endpoint.to_string(),
            kind,
            source: source.into(),
        }
    }

    #[inline]
    pub fn unsupported(endpoint: &EndpointKey, operation: &'static str) -> Self {
        EndpointError::Unsupported {
            endpoint: endpoint.to_string(),
            operation,
        }
    }
}

/// Sends exchanges to an endpoint.
///
/// A producer is a managed service and an asynchronous step at the same time. Producers
/// reporting [`Service::is_singleton`] are shared by all callers, the others are checked out
/// exclusively from a pool.
pub trait Producer: AsyncProcessor + Service {
    fn endpoint_key(&self) -> &EndpointKey;
}

/// Receives exchanges from an endpoint and feeds them to a processor.
pub trait Consumer: Service {
    fn endpoint_key(&self) -> &EndpointKey;

    /// The suspension capability, for consumers that can pause without stopping.
    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        None
    }
}

/// An addressable source or destination of exchanges.
pub trait Endpoint: Send + Sync {
    fn key(&self) -> &EndpointKey;

    /// Singleton endpoints are cached by the endpoint registry.
    fn is_singleton(&self) -> bool {
        true
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EndpointError>;

    fn create_consumer(
        &self,
        processor: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn Consumer>, EndpointError>;

    /// A native pull-style consumer. Endpoints returning `None` are bridged from their push
    /// consumer by an event driven polling consumer.
    fn create_polling_consumer(&self) -> Result<Option<Arc<dyn PollingConsumer>>, EndpointError> {
        Ok(None)
    }

    fn default_pattern(&self) -> ExchangePattern {
        ExchangePattern::InOnly
    }

    fn create_exchange(&self, pattern: Option<ExchangePattern>) -> Exchange {
        let mut exchange = Exchange::new(pattern.unwrap_or_else(|| self.default_pattern()));
        exchange.set_from_endpoint(self.key().clone());
        exchange
    }

    /// The endpoint's own lifecycle, if it has one.
    fn service(&self) -> Option<&dyn Service> {
        None
    }
}

/// Creates endpoints for one URI scheme.
pub trait Component: Send + Sync {
    fn create_endpoint(&self, key: &EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError>;

    /// Parameter values that are implied when absent. Used to normalize endpoint keys.
    fn default_parameters(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;

    #[test]
    fn test_create_exchange_sets_origin() {
        let endpoint = MockEndpoint::new("mock:origin");
        let exchange = endpoint.create_exchange(None);
        assert_eq!(exchange.pattern(), ExchangePattern::InOnly);
        assert_eq!(
            exchange.from_endpoint().map(EndpointKey::as_str),
            Some("mock://origin")
        );
        let in_out = endpoint.create_exchange(Some(ExchangePattern::InOut));
        assert_eq!(in_out.pattern(), ExchangePattern::InOut);
    }

    #[test]
    fn test_creation_error_keeps_cause() {
        use std::error::Error;
        let key = EndpointKey::parse("mock:broken").unwrap();
        let err = EndpointError::creation(&key, "producer", std::io::Error::other("refused"));
        assert_eq!(
            err.to_string(),
            "Endpoint 'mock://broken' failed to create a producer."
        );
        assert_eq!(err.source().map(|e| e.to_string()).as_deref(), Some("refused"));
    }
}
