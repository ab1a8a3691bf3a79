use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use super::graph::{generate_node_id, Graph, Node, NodeId};
use super::spec::{Category, ChainSpec, JobSpec, SequenceSpec, SpecFile};
use crate::error::{CompileError, Result};
use crate::job::{JobArgs, JobRegistry, NOOP_JOB_TYPE};

const CHAIN_SEQUENCE: &str = "chain";

/// Compiles named sequences into executable graphs.
///
/// Every sequence is wrapped in a no-op source and sink so it exposes one
/// entry and one exit. A chain wraps its stages the same way, which gives
/// the compiled graph exactly one start and one end node.
pub struct Grapher {
    sequences: BTreeMap<String, SequenceSpec>,
    registry: JobRegistry,
    default_tries: u32,
}

impl Grapher {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            sequences: BTreeMap::new(),
            registry,
            default_tries: 1,
        }
    }

    /// Attempts granted to specs that do not set `tries`.
    pub fn with_default_tries(mut self, tries: u32) -> Self {
        self.default_tries = tries.max(1);
        self
    }

    pub fn from_yaml_str(registry: JobRegistry, yaml: &str) -> Result<Self> {
        let file: SpecFile = serde_yaml::from_str(yaml)?;
        let mut grapher = Self::new(registry);
        for sequence in file.sequences {
            grapher.add_sequence(sequence)?;
        }
        info!("Loaded {} sequences", grapher.sequences.len());
        Ok(grapher)
    }

    pub fn from_yaml_file(registry: JobRegistry, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(registry, &content)
    }

    pub fn add_sequence(&mut self, sequence: SequenceSpec) -> std::result::Result<(), CompileError> {
        if sequence.name.trim().is_empty() {
            return Err(CompileError::validation_field(
                "sequence name is required",
                "name",
            ));
        }
        if self.sequences.contains_key(&sequence.name) {
            return Err(CompileError::validation(format!(
                "duplicate sequence '{}'",
                sequence.name
            )));
        }
        self.sequences.insert(sequence.name.clone(), sequence);
        Ok(())
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceSpec> {
        self.sequences.get(name)
    }

    pub fn sequence_names(&self) -> Vec<&str> {
        self.sequences.keys().map(String::as_str).collect()
    }

    /// Compiles a chain made of a single sequence.
    pub fn compile_sequence(&self, name: &str) -> std::result::Result<Graph, CompileError> {
        self.compile(&ChainSpec::single(name))
    }

    pub fn compile(&self, chain: &ChainSpec) -> std::result::Result<Graph, CompileError> {
        if chain.stages.is_empty() {
            return Err(CompileError::validation_field(
                "chain has no stages",
                "stages",
            ));
        }

        let mut builder = Builder {
            grapher: self,
            nodes: BTreeMap::new(),
            expanding: Vec::new(),
        };

        let start = builder.add_noop("start", CHAIN_SEQUENCE);
        let end = builder.add_noop("end", CHAIN_SEQUENCE);

        let mut units = Vec::with_capacity(chain.stages.len());
        for stage in &chain.stages {
            let (entry, exit) = builder.expand_sequence(&stage.sequence, CHAIN_SEQUENCE)?;
            units.push(Unit {
                name: &stage.sequence,
                deps: &stage.depends_on,
                entry,
                exit,
            });
        }
        builder.wire(CHAIN_SEQUENCE, &units, &start, &end)?;

        let graph = Graph {
            start,
            end,
            nodes: builder.nodes,
        };
        graph.validate()?;

        debug!(
            nodes = graph.len(),
            jobs = graph.jobs().len(),
            "Compiled chain graph"
        );
        Ok(graph)
    }
}

/// Something with one entry and one exit: a job node or an expanded sequence.
struct Unit<'a> {
    name: &'a str,
    deps: &'a [String],
    entry: NodeId,
    exit: NodeId,
}

struct Builder<'g> {
    grapher: &'g Grapher,
    nodes: BTreeMap<NodeId, Node>,
    /// Sequences currently being expanded, outermost first.
    expanding: Vec<String>,
}

impl<'g> Builder<'g> {
    fn add_noop(&mut self, name: &str, sequence: &str) -> NodeId {
        let id = generate_node_id(&format!("{}-{}", sequence, name));
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                name: format!("{}-{}", sequence, name),
                job_type: NOOP_JOB_TYPE.to_string(),
                sequence: sequence.to_string(),
                args: JobArgs::new(),
                tries: 1,
                retry_wait_ms: None,
                timeout_ms: None,
                prev: Default::default(),
                next: Default::default(),
            },
        );
        id
    }

    fn add_job(&mut self, spec: &JobSpec, sequence: &str) -> NodeId {
        let id = generate_node_id(&spec.name);
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                name: spec.name.clone(),
                job_type: spec.job_type.clone(),
                sequence: sequence.to_string(),
                args: spec.args.clone(),
                tries: spec.tries.unwrap_or(self.grapher.default_tries),
                retry_wait_ms: spec.retry_wait_ms,
                timeout_ms: spec.timeout_ms,
                prev: Default::default(),
                next: Default::default(),
            },
        );
        id
    }

    fn add_edge(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.next.insert(to.clone());
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.prev.insert(from.clone());
        }
    }

    /// Expands a sequence (recursively) and returns its (source, sink).
    fn expand_sequence(
        &mut self,
        name: &str,
        referrer: &str,
    ) -> std::result::Result<(NodeId, NodeId), CompileError> {
        if self.expanding.iter().any(|s| s == name) {
            return Err(CompileError::CyclicGraph {
                node: name.to_string(),
            });
        }
        let grapher = self.grapher;
        let sequence = grapher
            .sequences
            .get(name)
            .ok_or_else(|| CompileError::UnknownDependency {
                node: referrer.to_string(),
                dependency: name.to_string(),
            })?;
        if sequence.nodes.is_empty() {
            return Err(CompileError::validation(format!(
                "sequence '{}' has no nodes",
                name
            )));
        }

        self.expanding.push(name.to_string());

        let source = self.add_noop("start", name);
        let sink = self.add_noop("end", name);

        let mut units = Vec::with_capacity(sequence.nodes.len());
        for spec in &sequence.nodes {
            validate_spec(spec, name)?;
            let (entry, exit) = match spec.category {
                Category::Job => {
                    grapher
                        .registry
                        .validate_args(&spec.name, &spec.job_type, &spec.args)?;
                    let id = self.add_job(spec, name);
                    (id.clone(), id)
                }
                Category::Sequence => self.expand_sequence(&spec.job_type, &spec.name)?,
            };
            units.push(Unit {
                name: &spec.name,
                deps: &spec.deps,
                entry,
                exit,
            });
        }
        self.wire(name, &units, &source, &sink)?;

        self.expanding.pop();
        Ok((source, sink))
    }

    /// Resolves dependency names between units and hangs dependency-free
    /// units off `source` and successor-free units onto `sink`.
    fn wire(
        &mut self,
        owner: &str,
        units: &[Unit<'_>],
        source: &NodeId,
        sink: &NodeId,
    ) -> std::result::Result<(), CompileError> {
        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(units.len());
        for (idx, unit) in units.iter().enumerate() {
            if by_name.insert(unit.name, idx).is_some() {
                return Err(CompileError::validation(format!(
                    "duplicate name '{}' in '{}'",
                    unit.name, owner
                )));
            }
        }

        let mut depended_on: HashSet<usize> = HashSet::new();
        for unit in units {
            for dep in unit.deps {
                if dep == unit.name {
                    return Err(CompileError::CyclicGraph {
                        node: unit.name.to_string(),
                    });
                }
                let dep_idx = *by_name.get(dep.as_str()).ok_or_else(|| {
                    CompileError::UnknownDependency {
                        node: unit.name.to_string(),
                        dependency: dep.clone(),
                    }
                })?;
                depended_on.insert(dep_idx);
                self.add_edge(&units[dep_idx].exit, &unit.entry);
            }
        }

        for (idx, unit) in units.iter().enumerate() {
            if unit.deps.is_empty() {
                self.add_edge(source, &unit.entry);
            }
            if !depended_on.contains(&idx) {
                self.add_edge(&unit.exit, sink);
            }
        }
        Ok(())
    }
}

fn validate_spec(spec: &JobSpec, sequence: &str) -> std::result::Result<(), CompileError> {
    if spec.name.trim().is_empty() {
        return Err(CompileError::validation_field(
            format!("node without a name in sequence '{}'", sequence),
            "name",
        ));
    }
    if spec.job_type.trim().is_empty() {
        return Err(CompileError::validation_field(
            format!("node '{}' has no type", spec.name),
            "type",
        ));
    }
    if spec.tries == Some(0) {
        return Err(CompileError::validation_field(
            format!("node '{}' must allow at least one try", spec.name),
            "tries",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grapher::spec::StageSpec;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn grapher() -> Grapher {
        let registry = JobRegistry::new();
        registry
            .register_fn("work", |id| Box::new(crate::job::NoopJob::new(id)))
            .unwrap();
        Grapher::new(registry)
    }

    fn diamond() -> SequenceSpec {
        SequenceSpec::new(
            "diamond",
            vec![
                JobSpec::new("a", "work"),
                JobSpec::new("b", "work").with_deps(["a"]),
                JobSpec::new("c", "work").with_deps(["a"]),
                JobSpec::new("d", "work").with_deps(["b", "c"]),
            ],
        )
    }

    fn names(graph: &Graph, ids: &BTreeSet<NodeId>) -> BTreeSet<String> {
        ids.iter()
            .map(|id| graph.node(id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_single_start_and_end() {
        let mut g = grapher();
        g.add_sequence(diamond()).unwrap();
        let graph = g.compile_sequence("diamond").unwrap();

        let roots = graph.roots();
        let sinks = graph.sinks();
        assert_eq!(roots.len(), 1);
        assert_eq!(sinks.len(), 1);
        assert_eq!(roots[0].id, graph.start);
        assert_eq!(sinks[0].id, graph.end);
        // chain start/end + sequence start/end + 4 jobs
        assert_eq!(graph.len(), 8);
    }

    #[test]
    fn test_fan_out_fan_in_preserves_jobs_and_edges() {
        let mut g = grapher();
        g.add_sequence(diamond()).unwrap();
        let graph = g.compile_sequence("diamond").unwrap();

        let mut jobs: Vec<&str> = graph.jobs().iter().map(|n| n.name.as_str()).collect();
        jobs.sort();
        assert_eq!(jobs, vec!["a", "b", "c", "d"]);

        let d = graph.find_by_name("d").unwrap();
        assert_eq!(
            names(&graph, &d.prev),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
        let a = graph.find_by_name("a").unwrap();
        assert_eq!(
            names(&graph, &a.prev),
            BTreeSet::from(["diamond-start".to_string()])
        );
        assert_eq!(
            names(&graph, &d.next),
            BTreeSet::from(["diamond-end".to_string()])
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new(
            "loop",
            vec![
                JobSpec::new("a", "work").with_deps(["b"]),
                JobSpec::new("b", "work").with_deps(["a"]),
            ],
        ))
        .unwrap();
        let err = g.compile_sequence("loop").unwrap_err();
        assert!(matches!(err, CompileError::CyclicGraph { .. }), "{:?}", err);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new(
            "selfish",
            vec![JobSpec::new("a", "work").with_deps(["a"])],
        ))
        .unwrap();
        assert_eq!(
            g.compile_sequence("selfish").unwrap_err(),
            CompileError::CyclicGraph { node: "a".into() }
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new(
            "broken",
            vec![JobSpec::new("a", "work").with_deps(["ghost"])],
        ))
        .unwrap();
        assert_eq!(
            g.compile_sequence("broken").unwrap_err(),
            CompileError::UnknownDependency {
                node: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new("no-type", vec![JobSpec::new("a", "")]))
            .unwrap();
        g.add_sequence(SequenceSpec::new("no-name", vec![JobSpec::new("", "work")]))
            .unwrap();
        g.add_sequence(SequenceSpec::new(
            "unregistered",
            vec![JobSpec::new("a", "shell")],
        ))
        .unwrap();
        g.add_sequence(SequenceSpec::new(
            "zero-tries",
            vec![JobSpec::new("a", "work").with_tries(0)],
        ))
        .unwrap();
        g.add_sequence(SequenceSpec::new(
            "dupes",
            vec![JobSpec::new("a", "work"), JobSpec::new("a", "work")],
        ))
        .unwrap();
        g.add_sequence(SequenceSpec::new("empty", vec![])).unwrap();

        for name in ["no-type", "no-name", "unregistered", "zero-tries", "dupes", "empty"] {
            let err = g.compile_sequence(name).unwrap_err();
            assert!(
                matches!(err, CompileError::Validation { .. }),
                "{}: {:?}",
                name,
                err
            );
        }

        assert!(g.add_sequence(diamond()).is_ok());
        assert!(matches!(
            g.add_sequence(diamond()),
            Err(CompileError::Validation { .. })
        ));
    }

    #[test]
    fn test_nested_sequence_expansion() {
        let mut g = grapher();
        g.add_sequence(diamond()).unwrap();
        g.add_sequence(SequenceSpec::new(
            "outer",
            vec![
                JobSpec::new("prep", "work"),
                JobSpec::sequence("inner", "diamond").with_deps(["prep"]),
                JobSpec::new("finish", "work").with_deps(["inner"]),
            ],
        ))
        .unwrap();

        let graph = g.compile_sequence("outer").unwrap();
        assert_eq!(graph.jobs().len(), 6);

        let prep = graph.find_by_name("prep").unwrap();
        assert_eq!(
            names(&graph, &prep.next),
            BTreeSet::from(["diamond-start".to_string()])
        );
        let finish = graph.find_by_name("finish").unwrap();
        assert_eq!(
            names(&graph, &finish.prev),
            BTreeSet::from(["diamond-end".to_string()])
        );
        assert_eq!(graph.find_by_name("d").unwrap().sequence, "diamond");
    }

    #[test]
    fn test_recursive_sequences_are_cyclic() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new(
            "ping",
            vec![JobSpec::sequence("call-pong", "pong")],
        ))
        .unwrap();
        g.add_sequence(SequenceSpec::new(
            "pong",
            vec![JobSpec::sequence("call-ping", "ping")],
        ))
        .unwrap();
        assert_eq!(
            g.compile_sequence("ping").unwrap_err(),
            CompileError::CyclicGraph {
                node: "ping".into()
            }
        );
    }

    #[test]
    fn test_stage_composition() {
        let mut g = grapher();
        g.add_sequence(SequenceSpec::new("backup", vec![JobSpec::new("dump", "work")]))
            .unwrap();
        g.add_sequence(SequenceSpec::new("deploy", vec![JobSpec::new("push", "work")]))
            .unwrap();

        let graph = g
            .compile(&ChainSpec::new(vec![
                StageSpec::new("backup"),
                StageSpec::new("deploy").after(["backup"]),
            ]))
            .unwrap();

        let deploy_start = graph.find_by_name("deploy-start").unwrap();
        assert_eq!(
            names(&graph, &deploy_start.prev),
            BTreeSet::from(["backup-end".to_string()])
        );
        let start = graph.node(&graph.start).unwrap();
        assert_eq!(
            names(&graph, &start.next),
            BTreeSet::from(["backup-start".to_string()])
        );

        let err = g
            .compile(&ChainSpec::new(vec![StageSpec::new("deploy").after(["nope"])]))
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownDependency { .. }));

        let err = g.compile(&ChainSpec::single("missing")).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownDependency {
                node: "chain".into(),
                dependency: "missing".into()
            }
        );
    }

    #[test]
    fn test_default_tries_and_yaml() {
        let registry = JobRegistry::new();
        registry
            .register_fn("work", |id| Box::new(crate::job::NoopJob::new(id)))
            .unwrap();
        let yaml = r#"
sequences:
  - name: build
    nodes:
      - name: compile
        type: work
        args:
          target: release
      - name: test
        type: work
        deps: [compile]
        tries: 3
        retry_wait_ms: 10
"#;
        let g = Grapher::from_yaml_str(registry, yaml)
            .unwrap()
            .with_default_tries(2);
        let graph = g.compile_sequence("build").unwrap();

        let compile = graph.find_by_name("compile").unwrap();
        assert_eq!(compile.tries, 2);
        assert_eq!(compile.args["target"], serde_json::json!("release"));
        let test = graph.find_by_name("test").unwrap();
        assert_eq!(test.tries, 3);
        assert_eq!(test.retry_wait_ms, Some(10));
    }
}
