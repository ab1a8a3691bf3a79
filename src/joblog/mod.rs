//! Per-attempt job log records.
//!
//! One record is appended for every attempt; records are never overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::chain::State;
use crate::error::{ChainError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub request_id: String,
    pub job_id: String,
    pub name: String,
    pub job_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: State,
    pub exit: Option<i64>,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[async_trait]
pub trait JobLogStore: Send + Sync {
    /// Appends a record and returns it as stored.
    async fn create(&self, log: JobLog) -> Result<JobLog>;

    /// Latest attempt of one job.
    async fn get(&self, request_id: &str, job_id: &str) -> Result<JobLog>;

    /// Every attempt recorded for a request, ordered by job then attempt.
    async fn get_full(&self, request_id: &str) -> Result<Vec<JobLog>>;
}

/// Process-local log store.
///
/// Records are kept until `remove` drops them, so a long-running owner
/// should prune finished requests or supply a persistent store.
#[derive(Debug, Default)]
pub struct MemoryJobLogStore {
    logs: DashMap<String, Vec<JobLog>>,
}

impl MemoryJobLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every record of a request. Returns how many were held.
    pub fn remove(&self, request_id: &str) -> usize {
        self.logs
            .remove(request_id)
            .map(|(_, logs)| logs.len())
            .unwrap_or(0)
    }

    /// Number of requests with at least one record.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[async_trait]
impl JobLogStore for MemoryJobLogStore {
    async fn create(&self, log: JobLog) -> Result<JobLog> {
        self.logs
            .entry(log.request_id.clone())
            .or_default()
            .push(log.clone());
        Ok(log)
    }

    async fn get(&self, request_id: &str, job_id: &str) -> Result<JobLog> {
        let not_found = || ChainError::JobLogNotFound {
            request_id: request_id.to_string(),
            job_id: job_id.to_string(),
        };
        let logs = self.logs.get(request_id).ok_or_else(not_found)?;
        logs.iter()
            .filter(|l| l.job_id == job_id)
            .max_by_key(|l| l.attempt)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_full(&self, request_id: &str) -> Result<Vec<JobLog>> {
        let mut logs = self
            .logs
            .get(request_id)
            .map(|l| l.value().clone())
            .unwrap_or_default();
        logs.sort_by(|a, b| a.job_id.cmp(&b.job_id).then(a.attempt.cmp(&b.attempt)));
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn log(job_id: &str, attempt: u32, state: State) -> JobLog {
        let now = Utc::now();
        JobLog {
            request_id: "req-1".into(),
            job_id: job_id.into(),
            name: job_id.into(),
            job_type: "work".into(),
            attempt,
            started_at: now,
            finished_at: now,
            state,
            exit: Some(if state == State::Complete { 0 } else { 1 }),
            error: None,
            stdout: None,
            stderr: None,
        }
    }

    #[tokio::test]
    async fn test_remove_prunes_request() {
        let store = MemoryJobLogStore::new();
        store.create(log("a", 1, State::Fail)).await.unwrap();
        store.create(log("a", 2, State::Complete)).await.unwrap();
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove("req-1"), 2);
        assert!(store.is_empty());
        assert_eq!(store.remove("req-1"), 0);
        assert!(store.get_full("req-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_returns_latest_attempt() {
        let store = MemoryJobLogStore::new();
        store.create(log("a", 1, State::Fail)).await.unwrap();
        store.create(log("a", 2, State::Complete)).await.unwrap();
        store.create(log("b", 1, State::Complete)).await.unwrap();

        let latest = store.get("req-1", "a").await.unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.state, State::Complete);

        let full = store.get_full("req-1").await.unwrap();
        let keys: Vec<(&str, u32)> = full.iter().map(|l| (l.job_id.as_str(), l.attempt)).collect();
        assert_eq!(keys, vec![("a", 1), ("a", 2), ("b", 1)]);
    }

    #[tokio::test]
    async fn test_missing_logs() {
        let store = MemoryJobLogStore::new();
        let err = store.get("req-1", "a").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_full("req-1").await.unwrap().is_empty());
    }
}
