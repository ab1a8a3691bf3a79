//! Job capability consumed by the traversal engine.
//!
//! Concrete jobs live outside this crate. The engine only relies on the
//! [`Job`] trait and resolves job types through a [`JobRegistry`].

mod noop;

pub use noop::{NoopJob, NOOP_JOB_TYPE};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::State;
use crate::error::{ChainError, CompileError, Result};
use crate::grapher::Node;

/// Arguments bound to a job at create time.
pub type JobArgs = Map<String, Value>;

/// Chain-wide data handed to each job run.
pub type JobData = Map<String, Value>;

/// Built-in job registrations, collected at link time.
#[linkme::distributed_slice]
pub static BUILTIN_JOBS: [fn(&JobRegistry)] = [..];

/// Result of one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReturn {
    pub state: State,
    pub exit: i64,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Merged into the chain's job data when the attempt completes.
    #[serde(default)]
    pub data: JobData,
}

impl JobReturn {
    pub fn complete() -> Self {
        Self {
            state: State::Complete,
            exit: 0,
            error: None,
            stdout: None,
            stderr: None,
            data: JobData::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            state: State::Fail,
            exit: 1,
            error: Some(error.into()),
            stdout: None,
            stderr: None,
            data: JobData::new(),
        }
    }

    pub fn stopped() -> Self {
        Self {
            state: State::Stop,
            exit: 1,
            error: Some("stopped".to_string()),
            stdout: None,
            stderr: None,
            data: JobData::new(),
        }
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == State::Complete
    }
}

/// A unit of work the engine can create, run, stop and checkpoint.
///
/// `run` and `stop` take `&self`: a stop request may arrive while the job
/// is running, so implementations need interior mutability for any state
/// the two share.
#[async_trait]
pub trait Job: Send + Sync {
    async fn create(&mut self, args: &JobArgs) -> anyhow::Result<()>;

    async fn run(&self, data: JobData) -> anyhow::Result<JobReturn>;

    /// Best-effort cooperative stop.
    fn stop(&self) -> anyhow::Result<()>;

    fn status(&self) -> String;

    /// In-flight state for crash resume.
    fn serialize(&self) -> anyhow::Result<Vec<u8>>;

    fn deserialize(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Constructs jobs of one type.
pub trait JobFactory: Send + Sync {
    fn job_type(&self) -> &str;

    /// JSON schema the node args must satisfy, checked at compile time.
    fn args_schema(&self) -> Option<Value> {
        None
    }

    fn make(&self, node_id: &str) -> Box<dyn Job>;
}

struct FnFactory<F> {
    job_type: String,
    schema: Option<Value>,
    make: F,
}

impl<F> JobFactory for FnFactory<F>
where
    F: Fn(&str) -> Box<dyn Job> + Send + Sync,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn args_schema(&self) -> Option<Value> {
        self.schema.clone()
    }

    fn make(&self, node_id: &str) -> Box<dyn Job> {
        (self.make)(node_id)
    }
}

/// Maps job type names to factories.
#[derive(Clone)]
pub struct JobRegistry {
    factories: Arc<DashMap<String, Arc<dyn JobFactory>>>,
}

impl JobRegistry {
    /// Registry preloaded with the built-in job types.
    pub fn new() -> Self {
        let registry = Self::empty();
        for register_fn in BUILTIN_JOBS {
            register_fn(&registry);
        }
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, factory: Arc<dyn JobFactory>) -> Result<()> {
        let job_type = factory.job_type().to_string();
        if self.factories.contains_key(&job_type) {
            return Err(ChainError::configuration(format!(
                "job type already registered: {}",
                job_type
            )));
        }
        debug!(job_type = %job_type, "Registered job type");
        self.factories.insert(job_type, factory);
        Ok(())
    }

    pub fn register_fn<F>(&self, job_type: impl Into<String>, make: F) -> Result<()>
    where
        F: Fn(&str) -> Box<dyn Job> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            job_type: job_type.into(),
            schema: None,
            make,
        }))
    }

    pub fn register_fn_with_schema<F>(
        &self,
        job_type: impl Into<String>,
        schema: Value,
        make: F,
    ) -> Result<()>
    where
        F: Fn(&str) -> Box<dyn Job> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            job_type: job_type.into(),
            schema: Some(schema),
            make,
        }))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobFactory>> {
        self.factories.get(job_type).map(|f| f.value().clone())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Builds and creates the job for a compiled node.
    pub async fn make(&self, node: &Node) -> Result<Box<dyn Job>> {
        let factory = self
            .get(&node.job_type)
            .ok_or_else(|| ChainError::UnknownJobType(node.job_type.clone()))?;
        let mut job = factory.make(&node.id);
        job.create(&node.args)
            .await
            .map_err(|e| ChainError::JobCreate {
                node: node.id.clone(),
                reason: format!("{:#}", e),
            })?;
        Ok(job)
    }

    /// Validates `args` against the schema the job type declares, if any.
    pub fn validate_args(
        &self,
        node_name: &str,
        job_type: &str,
        args: &JobArgs,
    ) -> std::result::Result<(), CompileError> {
        let factory = self.get(job_type).ok_or_else(|| {
            CompileError::validation_field(
                format!("unknown job type '{}' for node '{}'", job_type, node_name),
                "type",
            )
        })?;

        let Some(schema) = factory.args_schema() else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            CompileError::validation(format!("invalid args schema for '{}': {}", job_type, e))
        })?;
        let instance = Value::Object(args.clone());
        if let Err(errors) = validator.validate(&instance) {
            warn!(node = %node_name, job_type = %job_type, "Args validation failed: {}", errors);
            return Err(CompileError::validation_field(
                format!("invalid args for node '{}': {}", node_name, errors),
                "args",
            ));
        }
        Ok(())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoJob;

    #[async_trait]
    impl Job for EchoJob {
        async fn create(&mut self, _args: &JobArgs) -> anyhow::Result<()> {
            Ok(())
        }
        async fn run(&self, data: JobData) -> anyhow::Result<JobReturn> {
            let mut ret = JobReturn::complete();
            ret.data = data;
            Ok(ret)
        }
        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn status(&self) -> String {
            "echo".to_string()
        }
        fn serialize(&self) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = JobRegistry::new();
        assert!(registry.contains(NOOP_JOB_TYPE));
        assert!(!JobRegistry::empty().contains(NOOP_JOB_TYPE));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = JobRegistry::new();
        registry.register_fn("echo", |_| Box::new(EchoJob)).unwrap();
        let err = registry.register_fn("echo", |_| Box::new(EchoJob)).unwrap_err();
        assert!(matches!(err, ChainError::Configuration(_)));
        assert_eq!(registry.list(), vec!["echo".to_string(), "noop".to_string()]);
    }

    #[test]
    fn test_validate_args_against_schema() {
        let registry = JobRegistry::new();
        registry
            .register_fn_with_schema(
                "echo",
                json!({
                    "type": "object",
                    "properties": { "host": { "type": "string" } },
                    "required": ["host"]
                }),
                |_| Box::new(EchoJob),
            )
            .unwrap();

        let mut args = JobArgs::new();
        assert!(registry.validate_args("e", "echo", &args).is_err());

        args.insert("host".into(), json!("db1"));
        assert!(registry.validate_args("e", "echo", &args).is_ok());

        let err = registry.validate_args("x", "missing", &args).unwrap_err();
        assert!(matches!(err, CompileError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_make_unknown_type() {
        let registry = JobRegistry::new();
        let node = Node {
            id: "n1".into(),
            name: "n1".into(),
            job_type: "nope".into(),
            sequence: "s".into(),
            args: JobArgs::new(),
            tries: 1,
            retry_wait_ms: None,
            timeout_ms: None,
            prev: Default::default(),
            next: Default::default(),
        };
        let err = registry.make(&node).await.err().unwrap();
        assert!(matches!(err, ChainError::UnknownJobType(t) if t == "nope"));
    }
}
