//! Chain persistence.
//!
//! Every backend stores one record per request id under
//! `{prefix}::chain::{request_id}`. `add` is an atomic create-if-absent and
//! is the only contested write: whoever wins it owns the chain.

mod memory;
mod redis_repo;
mod sled_repo;

pub use memory::MemoryChainRepo;
pub use redis_repo::RedisChainRepo;
pub use sled_repo::SledChainRepo;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::chain::{Chain, ChainSnapshot};
use crate::config::RepoConfig;
use crate::error::{RepoError, Result};

pub const CHAIN_KEY: &str = "chain";

pub const DEFAULT_PREFIX: &str = "jobchain";

/// Storage key for a request id.
pub fn chain_key(prefix: &str, request_id: &str) -> String {
    format!("{}::{}::{}", prefix, CHAIN_KEY, request_id)
}

#[async_trait]
pub trait ChainRepo: Send + Sync {
    /// Stores the chain only if no record exists; `Conflict` otherwise.
    async fn add(&self, chain: &Chain) -> std::result::Result<(), RepoError>;

    /// Unconditional overwrite used for checkpoints.
    async fn set(&self, chain: &Chain) -> std::result::Result<(), RepoError>;

    /// Loads a chain with fresh synchronization state.
    async fn get(&self, request_id: &str) -> std::result::Result<Chain, RepoError>;

    /// Deletes the record; `NotFound` if absent.
    async fn remove(&self, request_id: &str) -> std::result::Result<(), RepoError>;
}

pub(crate) fn encode(snapshot: &ChainSnapshot) -> std::result::Result<Vec<u8>, RepoError> {
    Ok(serde_json::to_vec(snapshot)?)
}

pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<ChainSnapshot, RepoError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Maps a delete count to the repository contract.
pub(crate) fn check_deleted(key: &str, request_id: &str, count: u64) -> std::result::Result<(), RepoError> {
    match count {
        0 => Err(RepoError::NotFound(request_id.to_string())),
        1 => Ok(()),
        count => Err(RepoError::MultipleDeleted {
            key: key.to_string(),
            count,
        }),
    }
}

/// Builds the repository described by the configuration.
pub async fn build_repo(config: &RepoConfig) -> Result<Arc<dyn ChainRepo>> {
    let repo: Arc<dyn ChainRepo> = match config {
        RepoConfig::Memory { prefix } => Arc::new(MemoryChainRepo::new(prefix.clone())),
        RepoConfig::Sled { path, prefix } => Arc::new(SledChainRepo::open(path, prefix.clone())?),
        RepoConfig::Redis { url, prefix } => {
            Arc::new(RedisChainRepo::connect(url, prefix.clone()).await?)
        }
    };
    info!(backend = config.backend(), prefix = config.prefix(), "Chain repository ready");
    Ok(repo)
}
