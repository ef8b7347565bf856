//! YAML object codecs for the storage backends.
//!
//! # Purpose
//! Backends persist opaque string payloads; a [`Codec`] is the typed
//! boundary between an in-memory object and that payload. [`YamlCodec`] is
//! the default for every kind; [`flat::FlatIngressCodec`] decorates it for
//! Ingress in the file backend so hand-authored files stay terse.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;

pub mod flat;

pub use flat::FlatIngressCodec;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Bidirectional object <-> payload transform for one kind.
pub trait Codec<O>: Send + Sync {
    fn encode(&self, obj: &O) -> Result<String, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<O, CodecError>;

    /// Whether encoded payloads carry the object's metadata, and with it the
    /// persisted resource version. The flat Ingress form does not.
    fn carries_object_meta(&self) -> bool {
        true
    }
}

/// Plain YAML serde round-trip, the default codec for every kind.
pub struct YamlCodec<O> {
    _marker: PhantomData<fn() -> O>,
}

impl<O> YamlCodec<O> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<O> Default for YamlCodec<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Codec<O> for YamlCodec<O>
where
    O: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, obj: &O) -> Result<String, CodecError> {
        Ok(serde_yaml::to_string(obj)?)
    }

    fn decode(&self, data: &[u8]) -> Result<O, CodecError> {
        Ok(serde_yaml::from_slice(data)?)
    }
}
