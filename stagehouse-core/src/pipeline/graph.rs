//! Pipeline graph construction and validation.
//!
//! Uses petgraph's DiGraph to check that dependencies form a DAG and to fix
//! a topological order for scheduling and summaries.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::GraphError;
use crate::retry::StagePolicy;
use crate::stage::Runnable;

/// A validated stage inside a [`PipelineGraph`].
#[derive(Clone)]
pub struct GraphNode {
    pub id: String,
    pub runnable: Arc<dyn Runnable>,
    pub policy: StagePolicy,
    pub upstream: Vec<String>,
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("kind", &self.runnable.kind())
            .field("upstream", &self.upstream)
            .finish()
    }
}

/// Builder for a [`PipelineGraph`].
///
/// Dependencies may name a stage id or a group; a group stands for all of
/// its members. Errors are collected and reported by [`GraphBuilder::build`].
pub struct GraphBuilder {
    name: String,
    default_policy: StagePolicy,
    stages: Vec<GraphNode>,
    groups: BTreeMap<String, Vec<String>>,
    edges: Vec<(String, String)>,
    error: Option<GraphError>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_policy: StagePolicy::default(),
            stages: Vec::new(),
            groups: BTreeMap::new(),
            edges: Vec::new(),
            error: None,
        }
    }

    /// Policy for stages added without one.
    pub fn default_policy(mut self, policy: StagePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    fn record(&mut self, err: GraphError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn push_stage(&mut self, id: String, runnable: Arc<dyn Runnable>, policy: StagePolicy) {
        if self.stages.iter().any(|s| s.id == id) || self.groups.contains_key(&id) {
            self.record(GraphError::DuplicateStage { id });
            return;
        }
        self.stages.push(GraphNode {
            id,
            runnable,
            policy,
            upstream: Vec::new(),
        });
    }

    pub fn stage(mut self, id: impl Into<String>, runnable: Arc<dyn Runnable>) -> Self {
        let policy = self.default_policy.clone();
        self.push_stage(id.into(), runnable, policy);
        self
    }

    pub fn stage_with_policy(
        mut self,
        id: impl Into<String>,
        runnable: Arc<dyn Runnable>,
        policy: StagePolicy,
    ) -> Self {
        self.push_stage(id.into(), runnable, policy);
        self
    }

    /// Add a group of independent stages; member ids become `group.member`.
    pub fn group(
        mut self,
        group: impl Into<String>,
        members: Vec<(String, Arc<dyn Runnable>, Option<StagePolicy>)>,
    ) -> Self {
        let group = group.into();
        if members.is_empty() {
            self.record(GraphError::EmptyGroup { group });
            return self;
        }
        if self.groups.contains_key(&group) || self.stages.iter().any(|s| s.id == group) {
            self.record(GraphError::DuplicateStage { id: group });
            return self;
        }
        let mut ids = Vec::with_capacity(members.len());
        for (member, runnable, policy) in members {
            let id = format!("{group}.{member}");
            let policy = policy.unwrap_or_else(|| self.default_policy.clone());
            self.push_stage(id.clone(), runnable, policy);
            ids.push(id);
        }
        self.groups.insert(group, ids);
        self
    }

    /// `downstream` runs only after every stage of `upstream` succeeded.
    pub fn depends_on(mut self, downstream: impl Into<String>, upstream: impl Into<String>) -> Self {
        self.edges.push((upstream.into(), downstream.into()));
        self
    }

    /// Link consecutive layers all-to-all: `chain(&["start", "fetch", "load"])`.
    pub fn chain(mut self, layers: &[&str]) -> Self {
        for pair in layers.windows(2) {
            self.edges.push((pair[0].to_string(), pair[1].to_string()));
        }
        self
    }

    fn expand(&self, name: &str) -> Option<Vec<String>> {
        if let Some(members) = self.groups.get(name) {
            return Some(members.clone());
        }
        self.stages
            .iter()
            .any(|s| s.id == name)
            .then(|| vec![name.to_string()])
    }

    pub fn build(mut self) -> Result<PipelineGraph, GraphError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if self.stages.is_empty() {
            return Err(GraphError::EmptyPipeline { pipeline: self.name });
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: HashMap<String, NodeIndex> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), graph.add_node(i)))
            .collect();

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            let targets = self.expand(to).ok_or_else(|| GraphError::UnknownUpstream {
                stage: to.clone(),
                upstream: from.clone(),
            })?;
            let sources = self.expand(from).ok_or_else(|| GraphError::UnknownUpstream {
                stage: to.clone(),
                upstream: from.clone(),
            })?;
            for target in &targets {
                for source in &sources {
                    if source == target {
                        return Err(GraphError::Cycle {
                            stage: source.clone(),
                        });
                    }
                    let entry = upstream.entry(target.clone()).or_default();
                    if !entry.contains(source) {
                        entry.push(source.clone());
                        graph.add_edge(indices[source], indices[target], ());
                    }
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| GraphError::Cycle {
            stage: self.stages[graph[cycle.node_id()]].id.clone(),
        })?;

        let mut slots: Vec<Option<GraphNode>> = self.stages.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(slots.len());
        for idx in order {
            if let Some(mut node) = slots[graph[idx]].take() {
                node.upstream = upstream.remove(&node.id).unwrap_or_default();
                nodes.push(node);
            }
        }
        Ok(PipelineGraph::from_ordered(self.name, nodes, self.groups))
    }
}

/// A validated, topologically ordered pipeline.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    downstream: HashMap<String, Vec<String>>,
    groups: BTreeMap<String, Vec<String>>,
}

impl PipelineGraph {
    fn from_ordered(
        name: String,
        nodes: Vec<GraphNode>,
        groups: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            for up in &node.upstream {
                downstream.entry(up.clone()).or_default().push(node.id.clone());
            }
        }
        Self {
            name,
            nodes,
            index,
            downstream,
            groups,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in topological order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    /// Position of `id` in topological order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn downstream(&self, id: &str) -> &[String] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every stage reachable from `id`, in topological order.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for next in self.downstream(current) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        let mut out: Vec<String> = seen.into_iter().collect();
        out.sort_by_key(|s| self.index.get(s).copied().unwrap_or(usize::MAX));
        out
    }
}
