//! Persistence for colloquy: SQLite connection handling, migrations and the
//! tracker store backends.

pub mod connection;
pub mod migrations;
pub mod stores;

pub use connection::{connect_for_store, connect_with_settings, DbPool};
pub use stores::{
    from_config, InMemoryTrackerStore, KeyValueCache, KeyedCacheTrackerStore, LocalKeyValueCache,
    SqlTrackerStore, StoreInitError, TimeoutTrackerStore,
};
