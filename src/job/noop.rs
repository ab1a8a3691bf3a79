use async_trait::async_trait;
use std::sync::Arc;

use super::{Job, JobArgs, JobData, JobFactory, JobRegistry, JobReturn, BUILTIN_JOBS};

pub const NOOP_JOB_TYPE: &str = "noop";

/// Structural job used for sequence sources and sinks. Always succeeds.
#[derive(Debug, Clone)]
pub struct NoopJob {
    id: String,
}

impl NoopJob {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Job for NoopJob {
    async fn create(&mut self, _args: &JobArgs) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, _data: JobData) -> anyhow::Result<JobReturn> {
        Ok(JobReturn::complete())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn status(&self) -> String {
        "noop".to_string()
    }

    fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

struct NoopFactory;

impl JobFactory for NoopFactory {
    fn job_type(&self) -> &str {
        NOOP_JOB_TYPE
    }

    fn make(&self, node_id: &str) -> Box<dyn Job> {
        Box::new(NoopJob::new(node_id))
    }
}

fn register_noop(registry: &JobRegistry) {
    // Only fails when already present.
    let _ = registry.register(Arc::new(NoopFactory));
}

#[linkme::distributed_slice(BUILTIN_JOBS)]
static REGISTER_NOOP: fn(&JobRegistry) = register_noop;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::State;

    #[tokio::test]
    async fn test_noop_always_completes() {
        let mut job = NoopJob::new("start");
        job.create(&JobArgs::new()).await.unwrap();
        let ret = job.run(JobData::new()).await.unwrap();
        assert_eq!(ret.state, State::Complete);
        assert_eq!(ret.exit, 0);
        assert_eq!(job.status(), "noop");
        assert!(job.serialize().unwrap().is_empty());
        assert!(job.stop().is_ok());
    }
}
