use std::sync::Arc;

use crate::config::StorageConfig;
use crate::vault::{Vault, VaultError};

#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<Vault>,
}

impl AppState {
    pub async fn open(config: &StorageConfig) -> Result<Self, VaultError> {
        let vault = Vault::open(config).await?;
        Ok(AppState {
            vault: Arc::new(vault),
        })
    }
}
