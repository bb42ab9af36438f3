//! # dashquery
//!
//! Server-side query layer for dashboard backends.
//!
//! ## Architecture
//! - **Pool**: Fixed set of connections behind a counting semaphore
//! - **Tagged cache**: Query results keyed by operation and parameters,
//!   invalidated in bulk by resource tag
//! - **Service**: Cached reads and tag-invalidating writes over the pool

#![warn(missing_docs)]

mod config;
mod error;
mod pool;
mod service;
mod tagged;

pub use config::QueryConfig;
pub use error::{QueryError, Result};
pub use pool::{ConnectionPool, PooledConnection};
pub use service::QueryService;
pub use tagged::{QueryOptions, TaggedQueryCache};
