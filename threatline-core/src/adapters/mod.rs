//! Concrete store and inference adapters.

pub mod http;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use http::{HttpInferenceAdapter, HttpInferenceConfig};
pub use memory::InMemoryRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordStore;
