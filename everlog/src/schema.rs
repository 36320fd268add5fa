//! The validator seam between the runtime and payload/state schemas.
//!
//! The runtime only depends on "check this JSON value and report issues"
//! semantics, so any schema library can plug in behind [`Validator`]. The
//! bundled [`SerdeValidator`] validates by attempting a typed
//! deserialization, which is sufficient for most aggregates.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Validates a JSON value before it becomes part of an event or a snapshot.
///
/// On failure the individual findings are surfaced as the issue list of an
/// [`InvalidInput`](crate::Error::InvalidInput) error.
pub trait Validator: Send + Sync {
    /// Checks `value`, returning the list of findings on failure.
    fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>>;
}

/// A [`Validator`] that accepts exactly the values deserializable into `T`.
pub struct SerdeValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for SerdeValidator<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Validator for SerdeValidator<T>
where
    T: DeserializeOwned,
{
    fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| vec![e.to_string()])
    }
}

/// Returns a shared [`SerdeValidator`] for `T`.
pub fn typed<T>() -> Arc<dyn Validator>
where
    T: DeserializeOwned + 'static,
{
    Arc::new(SerdeValidator::<T>::default())
}
