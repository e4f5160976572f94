//! Pass-scoped cache of delegated proxy paths.
//!
//! Many transfers in one dispatch pass share a credential; the cache keeps
//! the storage gateway down to one resolution per distinct
//! (credential id, user DN) pair. Entries live for the pass only, so
//! credential freshness stays the gateway's problem. Each dispatch worker
//! owns its own cache; siblings never share one.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::storage::StorageGateway;

pub struct ProxyCache {
    storage: Arc<dyn StorageGateway>,
    cache: HashMap<(String, String), PathBuf>,
}

impl ProxyCache {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        ProxyCache {
            storage,
            cache: HashMap::new(),
        }
    }

    /// Proxy path for this credential and user, resolving through the
    /// gateway at most once per pair.
    pub async fn proxy_for(&mut self, cred_id: &str, user_dn: &str) -> Result<PathBuf> {
        let key = (cred_id.to_string(), user_dn.to_string());
        if let Some(path) = self.cache.get(&key) {
            return Ok(path.clone());
        }
        let path = self.storage.resolve_proxy(cred_id, user_dn).await?;
        self.cache.insert(key, path.clone());
        Ok(path)
    }
}
