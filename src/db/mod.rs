//! Destination store - connection pool, table shapes, and the transactional write surface

#[cfg(test)]
pub mod memory;
pub mod pool;
pub mod schema;
pub mod store;

pub use pool::{PoolArgs, PoolArgsBuilder};
pub use schema::{TableName, TableSchema};
pub use store::{PgStore, Store, StoreTransaction};
