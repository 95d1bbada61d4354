use crate::dataformat::{DataFormat, DataFormatError, body_bytes};
use crate::exchange::{Body, Exchange};
use crate::service::{Service, ServiceError, ServiceSupport};
use crate::status::ServiceStatus;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{Read, Write};

fn compress<W>(format: &str, mut encoder: W, data: &[u8]) -> Result<W, DataFormatError>
where
    W: Write,
{
    encoder
        .write_all(data)
        .map_err(|e| DataFormatError::marshal(format, e))?;
    Ok(encoder)
}

fn decompress<R>(format: &str, mut decoder: R) -> Result<Body, DataFormatError>
where
    R: Read,
{
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| DataFormatError::unmarshal(format, e))?;
    Ok(Body::Bytes(Bytes::from(inflated)))
}

/// Gzip stream compression. Unmarshalling yields a binary body.
pub struct GzipDataFormat {
    support: ServiceSupport,
    level: Compression,
}

impl GzipDataFormat {
    pub fn new(level: Compression) -> Self {
        Self {
            support: ServiceSupport::new("dataformat:gzip"),
            level,
        }
    }
}

impl Default for GzipDataFormat {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl DataFormat for GzipDataFormat {
    fn name(&self) -> &str {
        "gzip"
    }

    fn marshal(&self, _exchange: &Exchange, body: &Body) -> Result<Bytes, DataFormatError> {
        let data = body_bytes(self.name(), body)?;
        let encoder = compress(
            self.name(),
            GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), self.level),
            &data,
        )?;
        let compressed = encoder
            .finish()
            .map_err(|e| DataFormatError::marshal(self.name(), e))?;
        Ok(Bytes::from(compressed))
    }

    fn unmarshal(&self, _exchange: &Exchange, data: &[u8]) -> Result<Body, DataFormatError> {
        decompress(self.name(), GzDecoder::new(data))
    }
}

impl Service for GzipDataFormat {
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

/// Zlib (deflate) compression. Defaults to the fastest level.
pub struct ZipDataFormat {
    support: ServiceSupport,
    level: Compression,
}

impl ZipDataFormat {
    pub fn new(level: Compression) -> Self {
        Self {
            support: ServiceSupport::new("dataformat:zip"),
            level,
        }
    }

    pub fn level(&self) -> Compression {
        self.level
    }
}

impl Default for ZipDataFormat {
    fn default() -> Self {
        Self::new(Compression::fast())
    }
}

impl DataFormat for ZipDataFormat {
    fn name(&self) -> &str {
        "zip"
    }

    fn marshal(&self, _exchange: &Exchange, body: &Body) -> Result<Bytes, DataFormatError> {
        let data = body_bytes(self.name(), body)?;
        let encoder = compress(
            self.name(),
            ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), self.level),
            &data,
        )?;
        let compressed = encoder
            .finish()
            .map_err(|e| DataFormatError::marshal(self.name(), e))?;
        Ok(Bytes::from(compressed))
    }

    fn unmarshal(&self, _exchange: &Exchange, data: &[u8]) -> Result<Body, DataFormatError> {
        decompress(self.name(), ZlibDecoder::new(data))
    }
}

impl Service for ZipDataFormat {
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
