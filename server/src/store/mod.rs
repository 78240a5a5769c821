//! Durable guild configuration: the document model, the storage seam, and the
//! cached [`ConfigStore`] the engine reads and writes through.

pub mod backend;
pub mod cache;
pub mod config_store;
pub mod document;
pub mod error;

pub use backend::{GuildDocumentStore, SqliteDocumentStore};
pub use config_store::{ChannelRemoval, ConfigStore, RemovalReport, StoreSettings};
pub use document::{GuildConfig, GuildDefaults, GuildDocument};
pub use error::StoreError;
