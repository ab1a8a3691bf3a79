use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::fmt;
use tracing::{debug, info};

use super::{chain_key, check_deleted, decode, encode, ChainRepo};
use crate::chain::Chain;
use crate::error::RepoError;

/// Shared repository backed by Redis.
///
/// The connection manager is cloned per operation; `add` relies on SETNX so
/// two processes racing to create the same chain cannot both win.
#[derive(Clone)]
pub struct RedisChainRepo {
    connection: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisChainRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisChainRepo")
            .field("prefix", &self.prefix)
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisChainRepo {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, RepoError> {
        let client = Client::open(url)?;
        let mut connection = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!(url = %url, "Connected to redis chain repository");
        Ok(Self {
            connection,
            prefix: prefix.into(),
        })
    }
}

#[async_trait]
impl ChainRepo for RedisChainRepo {
    async fn add(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        let bytes = encode(&chain.snapshot().await)?;
        let mut conn = self.connection.clone();

        let created: bool = conn.set_nx(&key, bytes).await?;
        if !created {
            return Err(RepoError::Conflict(chain.request_id().to_string()));
        }
        debug!(request_id = %chain.request_id(), "Added chain");
        Ok(())
    }

    async fn set(&self, chain: &Chain) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, chain.request_id());
        let bytes = encode(&chain.snapshot().await)?;
        let mut conn = self.connection.clone();

        let _: () = conn.set(&key, bytes).await?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Chain, RepoError> {
        let key = chain_key(&self.prefix, request_id);
        let mut conn = self.connection.clone();

        let bytes: Option<Vec<u8>> = conn.get(&key).await?;
        let bytes = bytes.ok_or_else(|| RepoError::NotFound(request_id.to_string()))?;
        Ok(Chain::from_snapshot(decode(&bytes)?))
    }

    async fn remove(&self, request_id: &str) -> Result<(), RepoError> {
        let key = chain_key(&self.prefix, request_id);
        let mut conn = self.connection.clone();

        let count: u64 = conn.del(&key).await?;
        check_deleted(&key, request_id, count)?;
        debug!(request_id = %request_id, "Removed chain");
        Ok(())
    }
}
