pub mod compression;
pub mod text;

use crate::exchange::{Body, Exchange};
use crate::processor::{AsyncCallback, AsyncProcessor, Processor, run_processor};
use crate::service::{BoxError, Service};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub use compression::{GzipDataFormat, ZipDataFormat};
pub use text::{SerializationDataFormat, StringDataFormat};

#[derive(Error, Debug)]
pub enum DataFormatError {
    #[error("Data format '{format}' cannot marshal a {body} body.")]
    UnsupportedBody { format: String, body: &'static str },

    #[error("Data format '{format}' failed to marshal.")]
    Marshal {
        format: String,
        #[source]
        source: BoxError,
    },

    #[error("Data format '{format}' failed to unmarshal.")]
    Unmarshal {
        format: String,
        #[source]
        source: BoxError,
    },
}

impl DataFormatError {
    #[inline]
    pub fn unsupported_body(format: impl Into<String>, body: &Body) -> Self {
        DataFormatError::UnsupportedBody {
            format: format.into(),
            body: body.kind(),
        }
    }

    #[inline]
    pub fn marshal(format: impl Into<String>, source: impl Into<BoxError>) -> Self {
        DataFormatError::Marshal {
            format: format.into(),
            source: source.into(),
        }
    }

    #[inline]
    pub fn unmarshal(format: impl Into<String>, source: impl Into<BoxError>) -> Self {
        DataFormatError::Unmarshal {
            format: format.into(),
            source: source.into(),
        }
    }
}

/// Converts message bodies to and from a wire representation.
///
/// Formats are services so that those holding resources can be started with the route that
/// uses them.
pub trait DataFormat: Service {
    fn name(&self) -> &str;

    fn marshal(&self, exchange: &Exchange, body: &Body) -> Result<Bytes, DataFormatError>;

    fn unmarshal(&self, exchange: &Exchange, data: &[u8]) -> Result<Body, DataFormatError>;
}

/// Binary view of a body for the formats that work on raw bytes.
pub(crate) fn body_bytes(format: &str, body: &Body) -> Result<Bytes, DataFormatError> {
    body.to_bytes()
        .ok_or_else(|| DataFormatError::unsupported_body(format, body))
}

/// Marshals the in body into the out message.
pub struct MarshalProcessor<F> {
    name: String,
    format: Arc<F>,
}

impl<F> MarshalProcessor<F>
where
    F: DataFormat,
{
    pub fn new(format: Arc<F>) -> Self {
        Self {
            name: format!("marshal({})", format.name()),
            format,
        }
    }
}

impl<F> Processor for MarshalProcessor<F>
where
    F: DataFormat,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let data = self.format.marshal(exchange, exchange.input().body())?;
        let mut out = exchange.input().clone();
        out.set_body(data);
        exchange.set_out(out);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self.format.as_ref())
    }
}

impl<F> AsyncProcessor for MarshalProcessor<F>
where
    F: DataFormat,
{
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        run_processor(self, exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self.format.as_ref())
    }
}

/// Unmarshals the in body into the out message.
pub struct UnmarshalProcessor<F> {
    name: String,
    format: Arc<F>,
}

impl<F> UnmarshalProcessor<F>
where
    F: DataFormat,
{
    pub fn new(format: Arc<F>) -> Self {
        Self {
            name: format!("unmarshal({})", format.name()),
            format,
        }
    }
}

impl<F> Processor for UnmarshalProcessor<F>
where
    F: DataFormat,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let data = body_bytes(self.format.name(), exchange.input().body())?;
        let body = self.format.unmarshal(exchange, &data)?;
        let mut out = exchange.input().clone();
        out.set_body(body);
        exchange.set_out(out);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self.format.as_ref())
    }
}

impl<F> AsyncProcessor for UnmarshalProcessor<F>
where
    F: DataFormat,
{
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        run_processor(self, exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self.format.as_ref())
    }
}
