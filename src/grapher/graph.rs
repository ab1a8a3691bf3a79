use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CompileError;
use crate::job::NOOP_JOB_TYPE;

pub type NodeId = String;

/// Generates a unique node identifier for a spec name.
pub fn generate_node_id(name: &str) -> NodeId {
    format!("{}_{}", name, cuid2::create_id())
}

/// A compiled graph vertex: a job spec plus its resolved edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Name from the spec (not unique across nested sequences).
    pub name: String,
    pub job_type: String,
    /// Sequence this node was expanded from.
    pub sequence: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Maximum number of attempts.
    pub tries: u32,
    pub retry_wait_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub prev: BTreeSet<NodeId>,
    #[serde(default)]
    pub next: BTreeSet<NodeId>,
}

impl Node {
    pub fn is_noop(&self) -> bool {
        self.job_type == NOOP_JOB_TYPE
    }
}

/// A compiled, immutable job graph with a single start and a single end node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub start: NodeId,
    pub end: NodeId,
    pub nodes: BTreeMap<NodeId, Node>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &Node> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.prev.iter())
            .filter_map(|p| self.nodes.get(p))
    }

    pub fn successors(&self, id: &str) -> impl Iterator<Item = &Node> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.next.iter())
            .filter_map(|s| self.nodes.get(s))
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.prev.is_empty()).collect()
    }

    /// Nodes without successors.
    pub fn sinks(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.next.is_empty()).collect()
    }

    /// Work nodes, i.e. everything except the structural no-op nodes.
    pub fn jobs(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| !n.is_noop()).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.name == name)
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(cur) = stack.pop() {
            for next in self.successors(cur) {
                if seen.insert(next.id.clone()) {
                    stack.push(&next.id);
                }
            }
        }
        seen
    }

    /// Checks edge symmetry, acyclicity and the single start/end shape.
    pub fn validate(&self) -> Result<(), CompileError> {
        for node in self.nodes.values() {
            for next in &node.next {
                let succ = self.nodes.get(next).ok_or_else(|| {
                    CompileError::UnknownDependency {
                        node: next.clone(),
                        dependency: node.name.clone(),
                    }
                })?;
                if !succ.prev.contains(&node.id) {
                    return Err(CompileError::validation(format!(
                        "edge {} -> {} is not mirrored",
                        node.id, next
                    )));
                }
            }
        }

        self.check_acyclic()?;

        let roots = self.roots();
        if roots.len() != 1 || roots[0].id != self.start {
            return Err(CompileError::validation(format!(
                "graph must have exactly one start node, found {}",
                roots.len()
            )));
        }
        let sinks = self.sinks();
        if sinks.len() != 1 || sinks[0].id != self.end {
            return Err(CompileError::validation(format!(
                "graph must have exactly one end node, found {}",
                sinks.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_acyclic(&self) -> Result<(), CompileError> {
        let mut dag = DiGraph::<&str, ()>::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for id in self.nodes.keys() {
            indices.insert(id.as_str(), dag.add_node(id.as_str()));
        }
        for node in self.nodes.values() {
            for next in &node.next {
                if let (Some(&from), Some(&to)) =
                    (indices.get(node.id.as_str()), indices.get(next.as_str()))
                {
                    dag.add_edge(from, to, ());
                }
            }
        }

        toposort(&dag, None).map(|_| ()).map_err(|cycle| {
            let id = dag[cycle.node_id()];
            let name = self
                .nodes
                .get(id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| id.to_string());
            CompileError::CyclicGraph { node: name }
        })
    }
}
