//! Policy retrieval and caching.
//!
//! - [`source`] - HTTP client for the remote bulk policy endpoint
//! - [`store`] - TTL cache over the source, guarded by a circuit breaker

pub mod source;
pub mod store;

pub use source::{HttpPolicySource, PolicySource, SourceError};
pub use store::{CIRCUIT_OPEN_MESSAGE, PolicyStore, PolicyStoreStats};
