//! Peer-to-peer synchronization core for the orange-bot cluster.
//!
//! Several bot processes form a small replicated mesh over mutual-TLS
//! message streams. The mesh gossips every message with per-source
//! duplicate suppression, elects the lowest-priority live node as the
//! controller, partitions the registered modules across live peers at most
//! once per module, detects peer death by heartbeat, and fans out
//! configuration-cache invalidations.
//!
//! The crate exposes [`sync::SyncHandler`] plus the collaborator contracts
//! it reads from and writes to: a [`registry::ModuleRegistry`], a
//! [`registry::ConfigCacheSink`], and the persisted
//! [`addr_cache::AddrCache`].

pub mod addr_cache;
pub mod config;
pub mod message;
pub mod peer;
pub mod registry;
pub mod sync;
pub mod tls;

pub use config::{NodeIdentity, SyncConfig, SyncTiming};
pub use message::CacheScope;
pub use registry::{ConfigCacheSink, InMemoryRegistry, LocalModule, ModuleRegistry};
pub use sync::{StatusSnapshot, SyncHandler, SyncOptions};
pub use tls::TlsBundle;
