//! fastsync-client library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the client components,
//! allowing integration tests to drive the real session driver.

pub mod client;
pub mod config;
pub mod connection;
pub mod kv_store;
pub mod log_file;
pub mod native_fs;
pub mod watcher;

// Re-export key types for convenience
pub use client::SyncClient;
pub use config::{Overrides, default_settings_path, load_settings, sync_url};
pub use connection::{Inbound, SocketEvent, WsConnection};
pub use kv_store::JsonFileKv;
pub use log_file::FileAppender;
pub use native_fs::NativeFs;
pub use watcher::{FileWatcher, classify_event};
