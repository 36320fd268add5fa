//! The store module contains the bundled repository implementations.

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory event log.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory snapshot repository.
pub mod in_memory_snapshot;
