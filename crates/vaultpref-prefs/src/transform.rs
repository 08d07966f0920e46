use std::{
    any::type_name,
    fmt::Display,
    io::{Read, Write},
    marker::PhantomData,
    str::FromStr,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TransformError;

/// Converts a typed value to the string an encrypted store persists, and back.
pub trait Transform<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String, TransformError>;
    fn decode(&self, stored: &str) -> Result<T, TransformError>;
}

/// Strings are stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform<String> for Identity {
    fn encode(&self, value: &String) -> Result<String, TransformError> {
        Ok(value.clone())
    }

    fn decode(&self, stored: &str) -> Result<String, TransformError> {
        Ok(stored.to_string())
    }
}

/// Scalars stored through their `Display` / `FromStr` text form.
pub struct Scalar<T>(PhantomData<fn() -> T>);

impl<T> Scalar<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Scalar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Transform<T> for Scalar<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    fn encode(&self, value: &T) -> Result<String, TransformError> {
        Ok(value.to_string())
    }

    fn decode(&self, stored: &str) -> Result<T, TransformError> {
        stored
            .parse::<T>()
            .map_err(|err| TransformError::parse(type_name::<T>(), err.to_string()))
    }
}

/// UTC timestamps stored as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTransform;

impl Transform<DateTime<Utc>> for DateTransform {
    fn encode(&self, value: &DateTime<Utc>) -> Result<String, TransformError> {
        Ok(value.timestamp_millis().to_string())
    }

    fn decode(&self, stored: &str) -> Result<DateTime<Utc>, TransformError> {
        let millis = stored
            .parse::<i64>()
            .map_err(|err| TransformError::parse("date", err.to_string()))?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| TransformError::parse("date", "timestamp out of range"))
    }
}

/// Enumerations stored by canonical variant name and resolved by name on read.
pub struct EnumTransform<E>(PhantomData<fn() -> E>);

impl<E> EnumTransform<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for EnumTransform<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Transform<E> for EnumTransform<E>
where
    E: FromStr + AsRef<str>,
{
    fn encode(&self, value: &E) -> Result<String, TransformError> {
        Ok(value.as_ref().to_string())
    }

    fn decode(&self, stored: &str) -> Result<E, TransformError> {
        E::from_str(stored)
            .map_err(|_| TransformError::parse(type_name::<E>(), "no variant with that name"))
    }
}

/// Any serde type, stored as compact JSON.
pub struct JsonTransform<T>(PhantomData<fn() -> T>);

impl<T> JsonTransform<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonTransform<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Transform<T> for JsonTransform<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<String, TransformError> {
        serde_json::to_string(value)
            .map_err(|err| TransformError::serialize(type_name::<T>(), json_reason(&err)))
    }

    fn decode(&self, stored: &str) -> Result<T, TransformError> {
        serde_json::from_str(stored)
            .map_err(|err| TransformError::parse(type_name::<T>(), json_reason(&err)))
    }
}

// serde_json messages can quote the input, so only position and category are kept.
fn json_reason(err: &serde_json::Error) -> String {
    format!(
        "{:?} error at line {} column {}",
        err.classify(),
        err.line(),
        err.column()
    )
}

/// Largest payload [`Deflate`] inflates by default.
pub const MAX_INFLATED: u64 = 16 * 1024 * 1024;

/// Compresses another transform's output with zlib before it is encrypted.
/// Worth it for large JSON payloads; small values grow.
pub struct Deflate<X> {
    inner: X,
    limit: u64,
}

impl<X> Deflate<X> {
    pub fn new(inner: X) -> Self {
        Self::with_limit(inner, MAX_INFLATED)
    }

    /// Stored values that inflate past `limit` bytes fail to decode.
    pub fn with_limit(inner: X, limit: u64) -> Self {
        Self { inner, limit }
    }
}

impl<T, X> Transform<T> for Deflate<X>
where
    X: Transform<T>,
{
    fn encode(&self, value: &T) -> Result<String, TransformError> {
        let plain = self.inner.encode(value)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(plain.as_bytes())
            .map_err(|err| TransformError::serialize("deflate", err.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|err| TransformError::serialize("deflate", err.to_string()))?;
        Ok(STANDARD.encode(compressed))
    }

    fn decode(&self, stored: &str) -> Result<T, TransformError> {
        let compressed = STANDARD
            .decode(stored)
            .map_err(|_| TransformError::parse("deflate", "not base64"))?;
        let mut plain = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .take(self.limit.saturating_add(1))
            .read_to_end(&mut plain)
            .map_err(|err| TransformError::parse("deflate", err.to_string()))?;
        if plain.len() as u64 > self.limit {
            return Err(TransformError::parse(
                "deflate",
                format!("inflated value exceeds {} bytes", self.limit),
            ));
        }
        let plain = String::from_utf8(plain)
            .map_err(|_| TransformError::parse("deflate", "not utf-8"))?;
        self.inner.decode(&plain)
    }
}
