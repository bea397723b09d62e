//! # sync-server
//!
//! Group synchronization server for oplog-sync.
//!
//! Devices keep a local log of the mutations they make. This server keeps
//! one shared log per group and exchanges operations with member devices:
//! - Accepts iroh QUIC connections, one call per bidirectional stream
//! - Records each device's new operations and delivers the ones it has
//!   not seen yet, while holding the group's lock
//! - Compacts operations superseded by a later delete
//! - Moves devices between groups, merging, discarding or copying history
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                         ┌── Device B
//!            │        iroh QUIC        │
//!        ┌───┴─────────────────────────┴───┐
//!        │   session ─► SyncService        │
//!        │     │          │  GroupLocks    │
//!        │     │          │  WorkerPool ───┼─► inbound batches
//!        │     ▼          ▼                │
//!        │   ┌──────────────────────────┐  │
//!        │   │  SQLite (operation log)  │  │
//!        │   └──────────────────────────┘  │
//!        └─────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! The server uses ALPN `/oplog-sync/1` and handles these calls:
//! - SyncData → Operation* → Done (client streams Batch* EndOfInput)
//! - JoinGroup → Operation* → Done
//! - LeaveGroup → Done
//! - GetCurrentGroup → CurrentGroup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod group_lock;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;
pub mod stream;
pub mod worker_pool;

pub use config::Config;
pub use error::{ServerError, ServiceError, StorageError};
pub use server::SyncServer;
pub use service::SyncService;
pub use storage::{MemoryStore, OperationStore, SqliteStore};
