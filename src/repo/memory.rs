use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{chain_key, ChainRepo, DEFAULT_PREFIX};
use crate::chain::{Chain, ChainSnapshot};
use crate::error::RepoError;

/// In-process repository. Records do not survive the process.
#[derive(Debug)]
pub struct MemoryChainRepo {
    prefix: String,
    chains: DashMap<String, ChainSnapshot>,
}

impl MemoryChainRepo {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            chains: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl Default for MemoryChainRepo {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[async_trait]
impl ChainRepo for MemoryChainRepo {
    async fn add(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        let snapshot = chain.snapshot().await;
        match self.chains.entry(key) {
            Entry::Occupied(_) => Err(RepoError::Conflict(chain.request_id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
                debug!(request_id = %chain.request_id(), "Added chain");
                Ok(())
            }
        }
    }

    async fn set(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        self.chains.insert(key, chain.snapshot().await);
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Chain, RepoError> {
        let key = chain_key(&self.prefix, request_id);
        let snapshot = self
            .chains
            .get(&key)
            .map(|s| s.value().clone())
            .ok_or_else(|| RepoError::NotFound(request_id.to_string()))?;
        Ok(Chain::from_snapshot(snapshot))
    }

    async fn remove(&self, request_id: &str) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, request_id);
        match self.chains.remove(&key) {
            Some(_) => {
                debug!(request_id = %request_id, "Removed chain");
                Ok(())
            }
            None => Err(RepoError::NotFound(request_id.to_string())),
        }
    }
}
