// ============================================================================
// memosync Library
// ============================================================================

//! Offline-first object synchronization.
//!
//! Entities are edited locally and read back immediately; saves send the
//! accumulated edits to a remote object store. Durable "later" variants
//! write each command to disk first and deliver it whenever the store is
//! reachable, across process restarts.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod core;
pub mod deep_save;
pub mod entity;
pub mod local_id;
pub mod mirror;
pub mod ops;
pub mod state;
pub mod task_queue;
pub mod transport;

// Re-export main types for convenience
pub use cache::{CacheEvent, CommandCache, PendingDelivery};
pub use client::{ClientFactory, SyncClient};
pub use codec::{EntityCodec, EntityFactory, JsonCodec, PointerEncoding};
pub use config::{BatchPolicy, CommandCachePolicy, EvictionPolicy, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use core::{ErrorKind, FileRef, Relation, Result, SyncError, Value, codes};
pub use entity::Entity;
pub use local_id::LocalIdRegistry;
pub use mirror::{InMemoryMirror, LocalMirror};
pub use ops::{FieldOperation, OperationSet};
pub use state::{EntityKind, EntityState, EntityStateBuilder};
pub use task_queue::TaskQueue;
pub use transport::{
    BatchMultiplexer, FileUpload, InMemoryTransport, Method, RequestRecord, RestCommand, Transport,
};
