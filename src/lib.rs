//! Resource manager for a TPM 1.2 chip shared between concurrent clients.

// Must come first, so that the helper macros are visible for the rest.
mod tcs_err_helpers;

pub mod auth_mgr;
pub mod config;
pub mod contexts;
pub mod interface;
pub mod key_cache;
mod key_mgr;
pub mod resource_manager;
pub mod store;
pub mod sync_types;
pub mod tpm;

#[cfg(test)]
mod test;

pub use config::ResourceManagerConfig;
pub use interface::{TcsErr, TcsRc};
pub use resource_manager::ResourceManager;
pub use store::{KeyStore, MemoryKeyStore, StoredKey};
pub use sync_types::ParkingLotSyncTypes;
pub use tpm::TpmChannel;
