// ABOUTME: Library root for columnar-sync
// ABOUTME: PostgreSQL to ClickHouse batch sync engine with locking, durable state and a background worker

pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod lock;
pub mod postgres;
pub mod service;
pub mod sink;
pub mod source;
pub mod state;
pub mod timestamp;
pub mod type_mapper;
pub mod utils;
pub mod worker;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncMode, SyncReport, SyncTarget};
pub use error::{SyncError, SyncResult};
pub use service::SyncService;
pub use worker::{SyncParams, SyncStatus, SyncWorker, WorkerState};
