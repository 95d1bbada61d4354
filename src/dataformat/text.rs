use crate::dataformat::{DataFormat, DataFormatError};
use crate::exchange::{Body, Exchange};
use crate::service::{Service, ServiceError, ServiceSupport};
use crate::status::ServiceStatus;
use bytes::Bytes;
use serde_json::Value;

/// UTF-8 text. Marshalling accepts text, UTF-8 binary and JSON bodies.
pub struct StringDataFormat {
    support: ServiceSupport,
}

impl Default for StringDataFormat {
    fn default() -> Self {
        Self {
            support: ServiceSupport::new("dataformat:string"),
        }
    }
}

impl DataFormat for StringDataFormat {
    fn name(&self) -> &str {
        "string"
    }

    fn marshal(&self, _exchange: &Exchange, body: &Body) -> Result<Bytes, DataFormatError> {
        match body {
            Body::Empty => Ok(Bytes::new()),
            Body::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Body::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(_) => Ok(bytes.clone()),
                Err(e) => Err(DataFormatError::marshal(self.name(), e)),
            },
            Body::Json(value) => Ok(Bytes::from(value.to_string())),
            Body::Object(_) => Err(DataFormatError::unsupported_body(self.name(), body)),
        }
    }

    fn unmarshal(&self, _exchange: &Exchange, data: &[u8]) -> Result<Body, DataFormatError> {
        let text = std::str::from_utf8(data).map_err(|e| DataFormatError::unmarshal(self.name(), e))?;
        Ok(Body::Text(text.to_string()))
    }
}

impl Service for StringDataFormat {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| Ok(()))
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}

/// Serializes bodies as JSON documents. Text bodies become JSON strings, unmarshalling
/// always yields a JSON body.
pub struct SerializationDataFormat {
    support: ServiceSupport,
}

impl Default for SerializationDataFormat {
    fn default() -> Self {
        Self {
            support: ServiceSupport::new("dataformat:serialization"),
        }
    }
}

impl DataFormat for SerializationDataFormat {
    fn name(&self) -> &str {
        "serialization"
    }

    fn marshal(&self, _exchange: &Exchange, body: &Body) -> Result<Bytes, DataFormatError> {
        let encoded = match body {
            Body::Empty => serde_json::to_vec(&Value::Null),
            Body::Text(text) => serde_json::to_vec(text),
            Body::Json(value) => serde_json::to_vec(value),
            Body::Bytes(_) | Body::Object(_) => {
                return Err(DataFormatError::unsupported_body(self.name(), body));
            }
        };
        encoded
            .map(Bytes::from)
            .map_err(|e| DataFormatError::marshal(self.name(), e))
    }

    fn unmarshal(&self, _exchange: &Exchange, data: &[u8]) -> Result<Body, DataFormatError> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| DataFormatError::unmarshal(self.name(), e))?;
        Ok(Body::Json(value))
    }
}

impl Service for SerializationDataFormat {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| Ok(()))
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}
