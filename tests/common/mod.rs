#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use jobchain::{
    Graph, Grapher, Job, JobArgs, JobData, JobRegistry, JobReturn, JobSpec,
    RetryStrategy, RunnerConfig, SequenceSpec,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const MOCK: &str = "mock";

/// Counts attempts per node id across job instances.
#[derive(Default)]
pub struct Recorder {
    pub attempts: DashMap<String, u32>,
}

impl Recorder {
    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.get(node_id).map(|a| *a).unwrap_or(0)
    }
}

/// Job whose behavior is driven by its args:
/// `fail`, `fail_times`, `block`, `sleep_ms`, `random_sleep`, `panic`,
/// `emit` (data key to publish), `expect` (data key that must exist) and
/// `stop_error` (stop still wakes the job but reports an error).
pub struct MockJob {
    id: String,
    args: JobArgs,
    recorder: Arc<Recorder>,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl MockJob {
    pub fn new(id: &str, recorder: Arc<Recorder>) -> Self {
        Self {
            id: id.to_string(),
            args: JobArgs::new(),
            recorder,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.args.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(Value::as_u64)
    }
}

#[async_trait]
impl Job for MockJob {
    async fn create(&mut self, args: &JobArgs) -> anyhow::Result<()> {
        self.args = args.clone();
        Ok(())
    }

    async fn run(&self, data: JobData) -> anyhow::Result<JobReturn> {
        let attempt = {
            let mut entry = self.recorder.attempts.entry(self.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if self.flag("panic") {
            panic!("mock job {} panicked", self.id);
        }
        if self.flag("block") {
            if !self.stopped.load(Ordering::SeqCst) {
                self.stop_signal.notified().await;
            }
            return Ok(JobReturn::stopped());
        }
        if let Some(ms) = self.number("sleep_ms") {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.flag("random_sleep") {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..15))).await;
        }
        if let Some(key) = self.args.get("expect").and_then(Value::as_str) {
            if !data.contains_key(key) {
                anyhow::bail!("missing job data '{}'", key);
            }
        }
        if self.flag("fail") {
            return Ok(JobReturn::fail("configured to fail").with_output("", "boom"));
        }
        if let Some(times) = self.number("fail_times") {
            if u64::from(attempt) <= times {
                return Ok(JobReturn::fail(format!("failing attempt {}", attempt)));
            }
        }

        let mut ret = JobReturn::complete().with_output(format!("ran {}", self.id), "");
        if let Some(key) = self.args.get("emit").and_then(Value::as_str) {
            ret = ret.with_data(key, json!(self.id));
        }
        Ok(ret)
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_one();
        if self.flag("stop_error") {
            anyhow::bail!("mock job {} did not stop cleanly", self.id);
        }
        Ok(())
    }

    fn status(&self) -> String {
        if self.stopped.load(Ordering::SeqCst) {
            "stopped".to_string()
        } else {
            "ok".to_string()
        }
    }

    fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn registry(recorder: Arc<Recorder>) -> JobRegistry {
    let registry = JobRegistry::new();
    registry
        .register_fn(MOCK, move |id| Box::new(MockJob::new(id, recorder.clone())))
        .unwrap();
    registry
}

pub fn mock(name: &str) -> JobSpec {
    JobSpec::new(name, MOCK)
}

pub fn compile(registry: &JobRegistry, nodes: Vec<JobSpec>) -> Graph {
    let mut grapher = Grapher::new(registry.clone());
    grapher
        .add_sequence(SequenceSpec::new("test", nodes))
        .unwrap();
    grapher.compile_sequence("test").unwrap()
}

pub fn config() -> RunnerConfig {
    RunnerConfig::builder()
        .retry(RetryStrategy::Immediate)
        .build()
        .unwrap()
}

pub fn node_id(graph: &Graph, name: &str) -> String {
    graph.find_by_name(name).unwrap().id.clone()
}
