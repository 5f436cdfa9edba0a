//! fastsync-core: bidirectional vault sync against a fastsync server.
//!
//! This crate provides:
//! - Content fingerprints and per-domain hash ledgers
//! - The websocket text/binary frame codec and message catalogue
//! - Chunked attachment upload and download
//! - Operators for notes, attachments, folders and configuration
//! - The sync cycle orchestrator and its completion gate
//! - FileSystem, KvStore and Connection trait abstractions

pub mod chunk;
pub mod entity;
pub mod events;
pub mod fingerprint;
pub mod fs;
pub mod hash_store;
pub mod ignore;
pub mod kv;
pub mod lock;
pub mod operator;
pub mod progress;
pub mod protocol;
pub mod scan;
pub mod settings;
pub mod sync_engine;
pub mod sync_log;
pub mod transport;
pub mod virtual_items;

pub use entity::Entity;
pub use events::{EventBus, NoticeLevel, Subscription, SyncEvent};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs, WriteTimes};
pub use kv::{KvError, KvStore, MemoryKv};
pub use protocol::Action;
pub use settings::{DeviceClass, Domain, EngineTimings, SyncSettings};
pub use sync_engine::{LocalEvent, SyncEngine, SyncError, SyncMode, SyncStartOutcome};
pub use sync_log::{LogAppender, LogEntry, SyncLog};
pub use transport::{Connection, ConnectionMachine, ReconnectPolicy, TransportCommand, TransportEvent};
pub use virtual_items::VirtualItemStore;
