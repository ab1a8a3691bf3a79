use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a spec node expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Job,
    /// Inline expansion of another sequence; `type` names the sequence.
    Sequence,
}

/// One job (or sub-sequence reference) inside a sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: Category,
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Names of other specs in the same sequence.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Maximum attempts; the grapher default applies when unset.
    pub tries: Option<u32>,
    pub retry_wait_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn sequence(name: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: Category::Sequence,
            job_type: sequence.into(),
            ..Default::default()
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn with_retry_wait_ms(mut self, wait: u64) -> Self {
        self.retry_wait_ms = Some(wait);
        self
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }
}

/// A named, reusable list of job specs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SequenceSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<JobSpec>,
}

impl SequenceSpec {
    pub fn new(name: impl Into<String>, nodes: Vec<JobSpec>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

/// A top-level use of a sequence in a chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageSpec {
    pub sequence: String,
    /// Stages whose exit this stage's entry waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StageSpec {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn after<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = stages.into_iter().map(Into::into).collect();
        self
    }
}

/// Ordered stages making up one chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChainSpec {
    pub stages: Vec<StageSpec>,
}

impl ChainSpec {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    /// A chain running a single sequence.
    pub fn single(sequence: impl Into<String>) -> Self {
        Self {
            stages: vec![StageSpec::new(sequence)],
        }
    }
}

/// On-disk layout of a sequence library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SpecFile {
    #[serde(default)]
    pub sequences: Vec<SequenceSpec>,
}
