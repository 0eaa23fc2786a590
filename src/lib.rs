//! MPD library client: a cached view of the remote library, cover art
//! downloads into a disk cache, and server discovery.

pub mod app_context;
pub mod backends;
pub mod config;
pub mod config_persistence;
pub mod cover_cache;
pub mod cover_transport;
pub mod discovery;
pub mod entity_bridge;
pub mod error;
pub mod foreground;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod search;
pub mod server_keyring;
pub mod server_registry;
pub mod worker_pool;
