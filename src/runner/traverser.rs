use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::chain::{Chain, State};
use crate::config::RetryStrategy;
use crate::error::{ChainError, Result};
use crate::grapher::{Node, NodeId};
use crate::job::{Job, JobRegistry, JobReturn};
use crate::joblog::{JobLog, JobLogStore};
use crate::repo::ChainRepo;

/// Result of one spawned attempt.
struct Completion {
    node_id: NodeId,
    attempt: u32,
    started_at: DateTime<Utc>,
    outcome: std::result::Result<JobReturn, JoinError>,
}

type InFlight = FuturesUnordered<BoxFuture<'static, Completion>>;

/// Drives one chain to a terminal state.
///
/// The control loop is the only writer of node transitions. Job bodies run
/// as independent tokio tasks and report back through their join handles.
pub struct Traverser {
    chain: Arc<Chain>,
    registry: JobRegistry,
    repo: Arc<dyn ChainRepo>,
    logs: Arc<dyn JobLogStore>,
    retry: RetryStrategy,
    running: DashMap<NodeId, Arc<dyn Job>>,
    stop_flag: AtomicBool,
    stop_notify: Notify,
}

impl Traverser {
    pub fn new(
        chain: Arc<Chain>,
        registry: JobRegistry,
        repo: Arc<dyn ChainRepo>,
        logs: Arc<dyn JobLogStore>,
        retry: RetryStrategy,
    ) -> Self {
        Self {
            chain,
            registry,
            repo,
            logs,
            retry,
            running: DashMap::new(),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn request_id(&self) -> &str {
        self.chain.request_id()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Stops admitting nodes and asks running jobs to stop. Idempotent.
    pub async fn stop(&self) {
        if self.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(request_id = %self.request_id(), "Stopping chain");
        self.chain.request_stop().await;
        self.stop_notify.notify_one();

        for (node_id, job) in self.running_jobs() {
            if let Err(e) = job.stop() {
                warn!(request_id = %self.request_id(), node_id = %node_id, "Job stop failed: {:#}", e);
            }
        }
    }

    fn running_jobs(&self) -> Vec<(NodeId, Arc<dyn Job>)> {
        self.running
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Runs until no node is running and none can be admitted.
    pub async fn run(&self) -> Result<State> {
        info!(
            request_id = %self.request_id(),
            nodes = self.chain.graph().len(),
            "Starting chain traversal"
        );

        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut backoff: HashMap<NodeId, Instant> = HashMap::new();

        loop {
            if !self.is_stopping() {
                if let Err(e) = self.admit(&mut in_flight, &mut backoff).await {
                    return self.abort(&mut in_flight, e).await;
                }
            }

            if in_flight.is_empty() && (self.is_stopping() || backoff.is_empty()) {
                break;
            }

            let next_retry = backoff.values().min().copied();
            let done = tokio::select! {
                Some(done) = in_flight.next() => Some(done),
                _ = sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => None,
                _ = self.stop_notify.notified() => None,
            };

            if let Some(done) = done {
                if let Err(e) = self.complete(done, &mut backoff).await {
                    return self.abort(&mut in_flight, e).await;
                }
            }
        }

        let state = self.chain.mark_finished().await;
        self.checkpoint().await?;

        let blocked = self.chain.blocked_nodes().await;
        if !blocked.is_empty() {
            debug!(request_id = %self.request_id(), count = blocked.len(), "Nodes blocked by failures");
        }
        info!(request_id = %self.request_id(), state = %state, "Chain traversal finished");
        Ok(state)
    }

    /// Launches every ready node that is not waiting out a retry delay.
    async fn admit(
        &self,
        in_flight: &mut InFlight,
        backoff: &mut HashMap<NodeId, Instant>,
    ) -> Result<()> {
        let now = Instant::now();
        backoff.retain(|_, due| *due > now);

        for node_id in self.chain.ready_nodes().await {
            if backoff.contains_key(&node_id) {
                continue;
            }
            match self.launch(&node_id).await {
                Ok(attempt) => in_flight.push(attempt),
                // Stop arrived between the flag check and admission
                Err(ChainError::NotRunning(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn launch(&self, node_id: &str) -> Result<BoxFuture<'static, Completion>> {
        let node = self
            .chain
            .graph()
            .node(node_id)
            .cloned()
            .ok_or_else(|| ChainError::UnknownNode(node_id.to_string()))?;

        let attempt = self.chain.set_running(node_id).await?;
        self.checkpoint().await?;
        let started_at = Utc::now();
        debug!(
            request_id = %self.request_id(),
            node_id = %node_id,
            job_type = %node.job_type,
            attempt,
            "Launching node"
        );

        let job = match self.make_job(&node).await {
            Ok(job) => job,
            Err(e) => {
                warn!(request_id = %self.request_id(), node_id = %node_id, "Job create failed: {}", e);
                let done = Completion {
                    node_id: node.id.clone(),
                    attempt,
                    started_at,
                    outcome: Ok(JobReturn::fail(e.to_string())),
                };
                return Ok(future::ready(done).boxed());
            }
        };

        self.running.insert(node.id.clone(), job.clone());
        if self.is_stopping() {
            if let Err(e) = job.stop() {
                warn!(request_id = %self.request_id(), node_id = %node.id, "Job stop failed: {:#}", e);
            }
        }

        let data = self.chain.job_data().await;
        let timeout_ms = node.timeout_ms;
        let handle = tokio::spawn(async move {
            let result = match timeout_ms {
                Some(ms) => match timeout(Duration::from_millis(ms), job.run(data)).await {
                    Ok(result) => result,
                    Err(_) => Ok(JobReturn::fail(format!("timed out after {}ms", ms))),
                },
                None => job.run(data).await,
            };
            result.unwrap_or_else(|e| JobReturn::fail(format!("{:#}", e)))
        });

        let node_id = node.id;
        Ok(async move {
            Completion {
                node_id,
                attempt,
                started_at,
                outcome: handle.await,
            }
        }
        .boxed())
    }

    async fn make_job(&self, node: &Node) -> Result<Arc<dyn Job>> {
        let mut job = self.registry.make(node).await?;
        if let Some(bytes) = self.chain.job_state(&node.id).await {
            job.deserialize(&bytes).map_err(|e| ChainError::JobCreate {
                node: node.id.clone(),
                reason: format!("restore failed: {:#}", e),
            })?;
        }
        Ok(Arc::from(job))
    }

    /// Records an attempt outcome, schedules a retry if one is left, and
    /// checkpoints.
    async fn complete(
        &self,
        done: Completion,
        backoff: &mut HashMap<NodeId, Instant>,
    ) -> Result<()> {
        self.running.remove(&done.node_id);
        let node = self
            .chain
            .graph()
            .node(&done.node_id)
            .cloned()
            .ok_or_else(|| ChainError::UnknownNode(done.node_id.clone()))?;

        let ret = match done.outcome {
            Ok(ret) => ret,
            Err(e) => {
                error!(request_id = %self.request_id(), node_id = %node.id, "Job task panicked: {}", e);
                JobReturn::fail(format!("job panicked: {}", e))
            }
        };

        let stopping = self.is_stopping();
        let (node_state, attempt_state) = if ret.state == State::Complete {
            (State::Complete, State::Complete)
        } else if stopping {
            let state = if ret.state == State::Stop {
                State::Stop
            } else {
                State::Fail
            };
            (state, state)
        } else if done.attempt < node.tries {
            (State::Pending, State::Fail)
        } else {
            (State::Fail, State::Fail)
        };

        match node_state {
            State::Complete => debug!(
                request_id = %self.request_id(),
                node_id = %node.id,
                attempt = done.attempt,
                "Node complete"
            ),
            State::Pending => {
                let delay = node
                    .retry_wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.retry.delay(done.attempt));
                warn!(
                    request_id = %self.request_id(),
                    node_id = %node.id,
                    attempt = done.attempt,
                    tries = node.tries,
                    error = ret.error.as_deref().unwrap_or(""),
                    "Attempt failed, retrying in {:?}",
                    delay
                );
                backoff.insert(node.id.clone(), Instant::now() + delay);
            }
            state => warn!(
                request_id = %self.request_id(),
                node_id = %node.id,
                attempt = done.attempt,
                state = %state,
                error = ret.error.as_deref().unwrap_or(""),
                stderr = ret.stderr.as_deref().unwrap_or(""),
                "Node finished without completing"
            ),
        }

        self.chain
            .finish_attempt(&node.id, node_state, &ret)
            .await?;
        self.write_log(&node, done.attempt, done.started_at, attempt_state, &ret)
            .await;
        self.checkpoint().await
    }

    async fn write_log(
        &self,
        node: &Node,
        attempt: u32,
        started_at: DateTime<Utc>,
        state: State,
        ret: &JobReturn,
    ) {
        let log = JobLog {
            request_id: self.request_id().to_string(),
            job_id: node.id.clone(),
            name: node.name.clone(),
            job_type: node.job_type.clone(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            state,
            exit: Some(ret.exit),
            error: ret.error.clone(),
            stdout: ret.stdout.clone(),
            stderr: ret.stderr.clone(),
        };
        if let Err(e) = self.logs.create(log).await {
            warn!(request_id = %self.request_id(), node_id = %node.id, "Failed to write job log: {}", e);
        }
    }

    /// Persists the chain, including the state of running jobs.
    async fn checkpoint(&self) -> Result<()> {
        for (node_id, job) in self.running_jobs() {
            match job.serialize() {
                Ok(bytes) if !bytes.is_empty() => self.chain.set_job_state(&node_id, bytes).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(request_id = %self.request_id(), node_id = %node_id, "Job serialize failed: {:#}", e)
                }
            }
        }
        self.repo.set(&self.chain).await?;
        Ok(())
    }

    /// Stops the chain, waits for running jobs, and surfaces `err`.
    async fn abort(&self, in_flight: &mut InFlight, err: ChainError) -> Result<State> {
        error!(request_id = %self.request_id(), "Aborting chain traversal: {}", err);
        self.stop().await;
        while let Some(done) = in_flight.next().await {
            self.running.remove(&done.node_id);
        }
        Err(err)
    }
}
