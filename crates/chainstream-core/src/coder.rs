//! Pluggable message coders and the registry that binds them to message types.
//!
//! A coder is looked up by `(message type, schema name)`. Consumers and
//! producers resolve their bindings once, at construction; a type without a
//! coder is a configuration error, never a runtime surprise.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StreamError;

/// A paired serialize/deserialize capability.
///
/// Object-safe so coders can be stored as `Arc<dyn Coder>`.
pub trait Coder: Send + Sync {
    /// Short identifier used in logs (e.g. `"json"`, `"borsh"`).
    fn name(&self) -> &str;

    fn serialize(&self, value: &Value, message_type: &str, schema: &str)
        -> Result<Bytes, StreamError>;

    fn deserialize(&self, bytes: &[u8], message_type: &str, schema: &str)
        -> Result<Value, StreamError>;
}

// ─── Built-in coders ──────────────────────────────────────────────────────────

/// Schema-less JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCoder;

impl Coder for JsonCoder {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize(&self, value: &Value, message_type: &str, _schema: &str) -> Result<Bytes, StreamError> {
        serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
            StreamError::serialization(format!("json encode of '{message_type}' failed")).with_cause(e)
        })
    }

    fn deserialize(&self, bytes: &[u8], message_type: &str, _schema: &str) -> Result<Value, StreamError> {
        serde_json::from_slice(bytes).map_err(|e| {
            StreamError::serialization(format!("json decode of '{message_type}' failed")).with_cause(e)
        })
    }
}

/// Schema-bound binary encoding: the value is shaped as `T`, then encoded with borsh.
///
/// Values that do not fit `T` are rejected at serialize time.
pub struct BorshCoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BorshCoder<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for BorshCoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coder for BorshCoder<T>
where
    T: BorshSerialize + BorshDeserialize + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        "borsh"
    }

    fn serialize(&self, value: &Value, message_type: &str, schema: &str) -> Result<Bytes, StreamError> {
        let typed: T = serde_json::from_value(value.clone()).map_err(|e| {
            StreamError::serialization(format!(
                "value does not match schema '{schema}' for '{message_type}'"
            ))
            .with_cause(e)
        })?;
        borsh::to_vec(&typed).map(Bytes::from).map_err(|e| {
            StreamError::serialization(format!("borsh encode of '{message_type}' failed")).with_cause(e)
        })
    }

    fn deserialize(&self, bytes: &[u8], message_type: &str, schema: &str) -> Result<Value, StreamError> {
        let typed: T = borsh::from_slice(bytes).map_err(|e| {
            StreamError::serialization(format!(
                "borsh decode of '{message_type}' (schema '{schema}') failed"
            ))
            .with_cause(e)
        })?;
        Ok(serde_json::to_value(typed)?)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoderKey(String, String);

/// Thread-safe `(message type, schema) → coder` registry.
#[derive(Clone, Default)]
pub struct CoderRegistry {
    inner: Arc<RwLock<HashMap<CoderKey, Arc<dyn Coder>>>>,
}

impl CoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a coder. Re-registering the same pair is a configuration error.
    pub fn register(
        &self,
        message_type: impl Into<String>,
        schema: impl Into<String>,
        coder: Arc<dyn Coder>,
    ) -> Result<(), StreamError> {
        let key = CoderKey(message_type.into(), schema.into());
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&key) {
            return Err(StreamError::configuration(format!(
                "coder for '{}' / '{}' already registered",
                key.0, key.1
            )));
        }
        inner.insert(key, coder);
        Ok(())
    }

    pub fn get(&self, message_type: &str, schema: &str) -> Option<Arc<dyn Coder>> {
        self.inner
            .read()
            .unwrap()
            .get(&CoderKey(message_type.to_string(), schema.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `message type → schema` bindings into a fixed coder table.
    pub fn resolve(&self, bindings: &BTreeMap<String, String>) -> Result<ResolvedCoders, StreamError> {
        let mut resolved = HashMap::with_capacity(bindings.len());
        for (message_type, schema) in bindings {
            let coder = self.get(message_type, schema).ok_or_else(|| {
                StreamError::configuration(format!(
                    "no coder registered for message type '{message_type}' with schema '{schema}'"
                ))
            })?;
            tracing::debug!(message_type, schema, coder = coder.name(), "coder bound");
            resolved.insert(
                message_type.clone(),
                ResolvedCoder {
                    schema: schema.clone(),
                    coder,
                },
            );
        }
        Ok(ResolvedCoders { by_type: resolved })
    }
}

/// A coder bound to a message type together with its schema name.
#[derive(Clone)]
pub struct ResolvedCoder {
    pub schema: String,
    pub coder: Arc<dyn Coder>,
}

/// Immutable table produced by [`CoderRegistry::resolve`].
#[derive(Clone, Default)]
pub struct ResolvedCoders {
    by_type: HashMap<String, ResolvedCoder>,
}

impl ResolvedCoders {
    pub fn get(&self, message_type: &str) -> Option<&ResolvedCoder> {
        self.by_type.get(message_type)
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.by_type.contains_key(message_type)
    }

    /// Encode `value` with the coder bound to `message_type`.
    pub fn encode(&self, message_type: &str, value: &Value) -> Result<(String, Bytes), StreamError> {
        let bound = self.get(message_type).ok_or_else(|| {
            StreamError::configuration(format!("message type '{message_type}' is not bound"))
        })?;
        let bytes = bound.coder.serialize(value, message_type, &bound.schema)?;
        Ok((bound.schema.clone(), bytes))
    }

    /// Decode `bytes` declared as `message_type`.
    ///
    /// A declared schema other than the bound one is a serialization error;
    /// `None` means the producer did not declare one.
    pub fn decode(
        &self,
        message_type: &str,
        declared_schema: Option<&str>,
        bytes: &[u8],
    ) -> Result<Value, StreamError> {
        let bound = self.get(message_type).ok_or_else(|| {
            StreamError::serialization(format!("no coder bound for declared type '{message_type}'"))
        })?;
        if let Some(declared) = declared_schema.filter(|d| *d != bound.schema) {
            return Err(StreamError::serialization(format!(
                "'{message_type}' was written with schema '{declared}' but is bound to '{}'",
                bound.schema
            )));
        }
        bound.coder.deserialize(bytes, message_type, &bound.schema)
    }
}
