//! Runtime state of one request's compiled graph.
//!
//! [`ChainSnapshot`] is plain data and is what repositories persist.
//! [`Chain`] wraps a snapshot behind a mutex that is created fresh every
//! time a chain is constructed or loaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ChainError, Result};
use crate::grapher::{Graph, NodeId};
use crate::job::{JobData, JobReturn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Pending,
    Running,
    Complete,
    Fail,
    Stop,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail | Self::Stop)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Per-node runtime record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub state: State,
    /// Attempts started so far.
    pub tries: u32,
    pub last_error: Option<String>,
    pub exit: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Serializable view of a chain: graph plus runtime state.
///
/// The graph never changes after compilation, so snapshots of one chain
/// share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub request_id: String,
    pub graph: Arc<Graph>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    /// Chain-wide data each job receives a copy of.
    #[serde(default)]
    pub job_data: JobData,
    /// Serialized state of jobs that were running at checkpoint time.
    #[serde(default)]
    pub job_states: BTreeMap<NodeId, Vec<u8>>,
    #[serde(default)]
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ChainSnapshot {
    pub fn new(request_id: impl Into<String>, graph: Graph) -> Self {
        let nodes = graph
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeRecord::default()))
            .collect();
        Self {
            request_id: request_id.into(),
            graph: Arc::new(graph),
            nodes,
            job_data: JobData::new(),
            job_states: BTreeMap::new(),
            stop_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Chain state derived from node states alone.
    pub fn state(&self) -> State {
        let mut running = false;
        let mut all_complete = true;
        let mut all_pending = true;
        let mut failed = false;
        for record in self.nodes.values() {
            match record.state {
                State::Running => running = true,
                State::Fail => failed = true,
                _ => {}
            }
            if record.state != State::Complete {
                all_complete = false;
            }
            if record.state != State::Pending {
                all_pending = false;
            }
        }

        if running {
            State::Running
        } else if all_complete {
            State::Complete
        } else if self.stop_requested {
            State::Stop
        } else if failed {
            State::Fail
        } else if all_pending {
            State::Pending
        } else {
            // Some progress, nothing in flight: mid-run or awaiting a retry.
            State::Running
        }
    }

    pub fn node_state(&self, id: &str) -> Option<State> {
        self.nodes.get(id).map(|r| r.state)
    }

    pub fn record(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut NodeRecord> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownNode(id.to_string()))
    }

    /// Pending with every predecessor Complete.
    pub fn is_ready(&self, id: &str) -> bool {
        if self.node_state(id) != Some(State::Pending) {
            return false;
        }
        self.graph
            .predecessors(id)
            .all(|p| self.node_state(&p.id) == Some(State::Complete))
    }

    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| self.is_ready(id))
            .cloned()
            .collect()
    }

    pub fn nodes_in(&self, state: State) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pending nodes that sit behind a failed node and can never run.
    pub fn blocked_nodes(&self) -> BTreeSet<NodeId> {
        let mut blocked = BTreeSet::new();
        for failed in self.nodes_in(State::Fail) {
            for id in self.graph.descendants(&failed) {
                if self.node_state(&id) == Some(State::Pending) {
                    blocked.insert(id);
                }
            }
        }
        blocked
    }

    pub fn status(&self) -> ChainStatus {
        let jobs: Vec<_> = self.graph.jobs();
        let jobs_done = jobs
            .iter()
            .filter(|n| self.node_state(&n.id) == Some(State::Complete))
            .count();
        ChainStatus {
            request_id: self.request_id.clone(),
            state: self.state(),
            jobs_done,
            jobs_total: jobs.len(),
            running: self.nodes_in(State::Running).len(),
            failed: self.nodes_in(State::Fail).len(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Summary of a chain for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub request_id: String,
    pub state: State,
    pub jobs_done: usize,
    pub jobs_total: usize,
    pub running: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ts(t: &Option<DateTime<Utc>>) -> String {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "N/A".to_string())
        }
        writeln!(f, "request:    {}", self.request_id)?;
        writeln!(f, "state:      {}", self.state)?;
        writeln!(f, "jobs done:  {}", self.jobs_done)?;
        writeln!(f, "jobs total: {}", self.jobs_total)?;
        writeln!(f, "created:    {}", self.created_at.to_rfc3339())?;
        writeln!(f, "started:    {}", ts(&self.started_at))?;
        write!(f, "finished:   {}", ts(&self.finished_at))
    }
}

/// A chain bound to one request, safe to share between tasks.
#[derive(Debug)]
pub struct Chain {
    request_id: String,
    graph: Arc<Graph>,
    inner: Mutex<ChainSnapshot>,
}

impl Chain {
    pub fn new(request_id: impl Into<String>, graph: Graph) -> Self {
        Self::from_snapshot(ChainSnapshot::new(request_id, graph))
    }

    pub fn from_snapshot(snapshot: ChainSnapshot) -> Self {
        Self {
            request_id: snapshot.request_id.clone(),
            graph: snapshot.graph.clone(),
            inner: Mutex::new(snapshot),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn snapshot(&self) -> ChainSnapshot {
        self.inner.lock().await.clone()
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state()
    }

    pub async fn node_state(&self, id: &str) -> Option<State> {
        self.inner.lock().await.node_state(id)
    }

    pub async fn record(&self, id: &str) -> Option<NodeRecord> {
        self.inner.lock().await.record(id).cloned()
    }

    pub async fn ready_nodes(&self) -> Vec<NodeId> {
        self.inner.lock().await.ready_nodes()
    }

    pub async fn nodes_in(&self, state: State) -> Vec<NodeId> {
        self.inner.lock().await.nodes_in(state)
    }

    pub async fn blocked_nodes(&self) -> BTreeSet<NodeId> {
        self.inner.lock().await.blocked_nodes()
    }

    pub async fn status(&self) -> ChainStatus {
        self.inner.lock().await.status()
    }

    pub async fn job_data(&self) -> JobData {
        self.inner.lock().await.job_data.clone()
    }

    pub async fn stop_requested(&self) -> bool {
        self.inner.lock().await.stop_requested
    }

    /// Returns true if this call set the flag.
    pub async fn request_stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let first = !inner.stop_requested;
        inner.stop_requested = true;
        first
    }

    pub async fn clear_stop(&self) {
        self.inner.lock().await.stop_requested = false;
    }

    /// Moves a ready node to Running and returns its attempt number.
    ///
    /// Fails with `InvalidTransition` unless the node is Pending and all of
    /// its predecessors are Complete.
    pub async fn set_running(&self, id: &str) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        if inner.stop_requested {
            return Err(ChainError::NotRunning(format!(
                "{}: stop requested",
                self.request_id
            )));
        }
        let current = inner
            .node_state(id)
            .ok_or_else(|| ChainError::UnknownNode(id.to_string()))?;
        if !inner.is_ready(id) {
            warn!(
                request_id = %self.request_id,
                node_id = %id,
                state = %current,
                "Refusing to run node before its predecessors complete"
            );
            return Err(ChainError::InvalidTransition {
                node: id.to_string(),
                from: current,
                to: State::Running,
            });
        }

        let now = Utc::now();
        if inner.started_at.is_none() {
            inner.started_at = Some(now);
        }
        let record = inner.record_mut(id)?;
        record.state = State::Running;
        record.tries += 1;
        record.started_at = Some(now);
        record.finished_at = None;
        let attempt = record.tries;
        debug!(request_id = %self.request_id, node_id = %id, attempt, "Node running");
        Ok(attempt)
    }

    /// Records the outcome of a running node's attempt.
    ///
    /// `state` is Pending when the node will be retried.
    pub async fn finish_attempt(&self, id: &str, state: State, ret: &JobReturn) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(id)?;
        if record.state != State::Running || state == State::Running {
            return Err(ChainError::InvalidTransition {
                node: id.to_string(),
                from: record.state,
                to: state,
            });
        }
        record.state = state;
        record.exit = Some(ret.exit);
        record.last_error = ret.error.clone();
        record.stdout = ret.stdout.clone();
        record.stderr = ret.stderr.clone();
        record.finished_at = Some(Utc::now());
        debug!(request_id = %self.request_id, node_id = %id, state = %state, "Node attempt finished");

        inner.job_states.remove(id);
        if state == State::Complete {
            for (k, v) in &ret.data {
                inner.job_data.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    pub async fn set_job_state(&self, id: &str, bytes: Vec<u8>) {
        self.inner.lock().await.job_states.insert(id.to_string(), bytes);
    }

    pub async fn job_state(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.job_states.get(id).cloned()
    }

    /// Stamps the finish time once the chain has reached a terminal state.
    pub async fn mark_finished(&self) -> State {
        let mut inner = self.inner.lock().await;
        let state = inner.state();
        if state.is_terminal() && inner.finished_at.is_none() {
            inner.finished_at = Some(Utc::now());
        }
        state
    }

    /// Returns Running nodes to Pending without counting their lost attempt.
    ///
    /// Used when a chain is resumed from a checkpoint taken mid-run.
    pub async fn reset_in_flight(&self) -> Vec<NodeId> {
        let mut inner = self.inner.lock().await;
        let mut reset = Vec::new();
        for (id, record) in inner.nodes.iter_mut() {
            if record.state == State::Running {
                record.state = State::Pending;
                record.tries = record.tries.saturating_sub(1);
                record.started_at = None;
                reset.push(id.clone());
            }
        }
        inner.finished_at = None;
        if !reset.is_empty() {
            debug!(request_id = %self.request_id, count = reset.len(), "Reset in-flight nodes");
        }
        reset
    }
}
