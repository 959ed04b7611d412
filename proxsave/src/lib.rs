//! Proxsave Library
//!
//! Configuration snapshot engine for Proxmox VE and Proxmox Backup Server
//! hosts: collects host state into a staging tree, records a manifest, and
//! writes a compressed, optionally age-encrypted tar archive.

pub mod archive;
pub mod chunker;
pub mod collect;
pub mod config;
pub mod executor;
pub mod fs;
pub mod privilege;
pub mod process;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{SnapshotExecutor, SnapshotReport};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
