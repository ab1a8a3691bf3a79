//! Owns the traversers of active chains.

mod traverser;

pub use traverser::Traverser;

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{Chain, ChainStatus, State};
use crate::config::RunnerConfig;
use crate::error::{ChainError, RepoError, Result};
use crate::grapher::{Graph, Grapher};
use crate::job::JobRegistry;
use crate::joblog::JobLogStore;
use crate::repo::{build_repo, ChainRepo};

/// Fresh request identifier for callers that do not bring their own.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub struct Runner {
    registry: JobRegistry,
    repo: Arc<dyn ChainRepo>,
    logs: Arc<dyn JobLogStore>,
    config: RunnerConfig,
    active: DashMap<String, Arc<Traverser>>,
    // Request ids with a resume in progress.
    claimed: DashSet<String>,
}

impl Runner {
    pub fn new(
        registry: JobRegistry,
        repo: Arc<dyn ChainRepo>,
        logs: Arc<dyn JobLogStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            repo,
            logs,
            config,
            active: DashMap::new(),
            claimed: DashSet::new(),
        }
    }

    /// Builds the configured repository. Job logs go to `logs`.
    pub async fn from_config(
        registry: JobRegistry,
        config: RunnerConfig,
        logs: Arc<dyn JobLogStore>,
    ) -> Result<Self> {
        config.validate()?;
        let repo = build_repo(&config.chain_repo).await?;
        Ok(Self::new(registry, repo, logs, config))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn repo(&self) -> &Arc<dyn ChainRepo> {
        &self.repo
    }

    pub fn job_logs(&self) -> &Arc<dyn JobLogStore> {
        &self.logs
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// A grapher sharing this runner's registry and default tries.
    pub fn grapher(&self) -> Grapher {
        Grapher::new(self.registry.clone()).with_default_tries(self.config.default_tries)
    }

    fn traverser(&self, chain: Arc<Chain>) -> Arc<Traverser> {
        let traverser = Arc::new(Traverser::new(
            chain,
            self.registry.clone(),
            self.repo.clone(),
            self.logs.clone(),
            self.config.retry.clone(),
        ));
        self.active
            .insert(traverser.request_id().to_string(), traverser.clone());
        traverser
    }

    /// Registers a new chain. Fails with `Conflict` if the request id is
    /// already owned by someone.
    pub async fn start(&self, request_id: &str, graph: Graph) -> Result<Arc<Traverser>> {
        let chain = Arc::new(Chain::new(request_id, graph));
        self.repo.add(&chain).await?;
        info!(request_id = %request_id, "Chain created");
        Ok(self.traverser(chain))
    }

    /// Loads a chain from the repository so its traversal can continue.
    ///
    /// The request id is claimed before the first await, so only one of
    /// several concurrent resumes of the same chain gets a traverser.
    pub async fn resume(&self, request_id: &str) -> Result<Arc<Traverser>> {
        if self.active.contains_key(request_id) || !self.claimed.insert(request_id.to_string()) {
            return Err(RepoError::Conflict(request_id.to_string()).into());
        }
        let result = self.load_for_resume(request_id).await;
        let result = result.map(|chain| self.traverser(chain));
        // Released after the traverser is registered as active
        self.claimed.remove(request_id);
        result
    }

    async fn load_for_resume(&self, request_id: &str) -> Result<Arc<Chain>> {
        let chain = Arc::new(self.repo.get(request_id).await?);
        let reset = chain.reset_in_flight().await;
        chain.clear_stop().await;
        self.repo.set(&chain).await?;
        info!(request_id = %request_id, reset = reset.len(), "Chain resumed");
        Ok(chain)
    }

    /// Runs a traverser to completion and cleans up its record.
    pub async fn run(&self, traverser: Arc<Traverser>) -> Result<State> {
        let request_id = traverser.request_id().to_string();
        let result = traverser.run().await;
        self.active.remove(&request_id);
        let state = result?;

        if !self.config.keep_finished_chains {
            match self.repo.remove(&request_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(request_id = %request_id, "Chain record already gone")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(state)
    }

    pub async fn stop(&self, request_id: &str) -> Result<()> {
        let traverser = self
            .active
            .get(request_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| ChainError::NotRunning(request_id.to_string()))?;
        traverser.stop().await;
        Ok(())
    }

    /// Status of an active chain, or of a persisted one.
    pub async fn status(&self, request_id: &str) -> Result<ChainStatus> {
        let active = self.active.get(request_id).map(|t| t.value().clone());
        match active {
            Some(traverser) => Ok(traverser.chain().status().await),
            None => Ok(self.repo.get(request_id).await?.status().await),
        }
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
