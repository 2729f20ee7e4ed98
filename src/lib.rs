// ABOUTME: Library root for booking-replicator
// ABOUTME: Exposes configuration, the instance seam, the replication engine and CLI commands

pub mod commands;
pub mod config;
pub mod error;
pub mod instance;
pub mod replication;
pub mod utils;

pub use config::ReplicatorConfig;
pub use error::SyncError;
pub use instance::{Connector, Instance, Side};
pub use replication::{ApplyEngine, SyncRun};
