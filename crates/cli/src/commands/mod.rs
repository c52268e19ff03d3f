//! CLI subcommands.

pub mod cart;
pub mod session;
pub mod watch;

use cart_sync_client::storage::StorageError;
use cart_sync_client::{CartClient, CartSyncConfig, HttpCartApi, StorageArea};

/// Start a client ("tab") on the configured storage.
///
/// # Errors
///
/// Returns `StorageError` if the storage directory cannot be opened.
pub fn open(config: CartSyncConfig) -> Result<CartClient<HttpCartApi>, StorageError> {
    let area = match &config.storage_dir {
        Some(dir) => StorageArea::open(dir)?,
        None => StorageArea::in_memory(),
    };
    let api = HttpCartApi::new(config.api_base_url.clone());
    Ok(CartClient::builder(config, area, api).start())
}
