use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use super::{chain_key, decode, encode, ChainRepo};
use crate::chain::Chain;
use crate::error::RepoError;

/// Embedded on-disk repository. Snapshots are stored zstd-compressed.
#[derive(Debug, Clone)]
pub struct SledChainRepo {
    db: sled::Db,
    prefix: String,
}

impl SledChainRepo {
    pub fn open(path: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self, RepoError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened sled chain repository");
        Ok(Self::from_db(db, prefix))
    }

    /// A database that is deleted when dropped.
    pub fn temporary(prefix: impl Into<String>) -> Result<Self, RepoError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db, prefix))
    }

    pub fn from_db(db: sled::Db, prefix: impl Into<String>) -> Self {
        Self {
            db,
            prefix: prefix.into(),
        }
    }

    async fn pack(chain: &Chain) -> Result<Vec<u8>, RepoError> {
        let serialized = encode(&chain.snapshot().await)?;
        Ok(zstd::encode_all(&*serialized, 3)?)
    }
}

#[async_trait]
impl ChainRepo for SledChainRepo {
    async fn add(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        let compressed = Self::pack(chain).await?;
        match self
            .db
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(compressed))?
        {
            Ok(()) => {
                self.db.flush_async().await?;
                debug!(request_id = %chain.request_id(), "Added chain");
                Ok(())
            }
            Err(_) => Err(RepoError::Conflict(chain.request_id().to_string())),
        }
    }

    async fn set(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        let compressed = Self::pack(chain).await?;
        self.db.insert(key.as_bytes(), compressed)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Chain, RepoError> {
        let key = chain_key(&self.prefix, request_id);
        let compressed = self
            .db
            .get(key.as_bytes())?
            .ok_or_else(|| RepoError::NotFound(request_id.to_string()))?;
        let bytes = zstd::decode_all(&compressed[..])?;
        Ok(Chain::from_snapshot(decode(&bytes)?))
    }

    async fn remove(&self, request_id: &str) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, request_id);
        match self.db.remove(key.as_bytes())? {
            Some(_) => {
                self.db.flush_async().await?;
                debug!(request_id = %request_id, "Removed chain");
                Ok(())
            }
            None => Err(RepoError::NotFound(request_id.to_string())),
        }
    }
}
