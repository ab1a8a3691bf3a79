// Graph compilation
pub mod grapher;
pub mod job;

// Runtime state and persistence
pub mod chain;
pub mod joblog;
pub mod repo;

// Execution
pub mod runner;

pub mod config;
pub mod error;
pub mod telemetry;

// Re-exports for convenience
pub use chain::{Chain, ChainSnapshot, ChainStatus, NodeRecord, State};
pub use config::{RepoConfig, RetryStrategy, RunnerConfig};
pub use error::{ChainError, CompileError, RepoError, Result};
pub use grapher::{ChainSpec, Graph, Grapher, JobSpec, Node, NodeId, SequenceSpec, StageSpec};
pub use job::{Job, JobArgs, JobData, JobFactory, JobRegistry, JobReturn};
pub use joblog::{JobLog, JobLogStore, MemoryJobLogStore};
pub use repo::{ChainRepo, MemoryChainRepo, RedisChainRepo, SledChainRepo};
pub use runner::{new_request_id, Runner, Traverser};
