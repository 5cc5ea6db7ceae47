//! Remote synchronization for tenantsync.
//!
//! This module provides:
//! - The backend abstraction with an HTTP (PostgREST) and an in-memory implementation
//! - Procedure and direct-table transports with identical row semantics
//! - A time-bounded, connectivity-gated remote client with transport fallback
//! - Per-data-type dirty tracking and full sync cycles
//! - Conflict detection and whole-payload resolution
//! - Manual and periodic scheduling

pub mod backend;
pub mod client;
pub mod conflict;
pub mod connectivity;
pub mod http;
pub mod memory;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use backend::{Query, RemoteBackend};
pub use client::{RemoteSyncClient, DEFAULT_TIMEOUT};
pub use conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, Resolution};
pub use connectivity::ConnectivityMonitor;
pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use orchestrator::SyncOrchestrator;
pub use scheduler::{
    SyncMode, SyncRequest, SyncResult, SyncScheduler, SyncSchedulerHandle, DEFAULT_SYNC_INTERVAL,
};
pub use state::{SyncEntry, SyncState, SyncStatus};
pub use transport::{DirectTableTransport, RpcTransport, SyncTransport, WriteRequest};
