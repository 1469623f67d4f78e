use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use tracing::{debug, warn};

use trellis_core::config::{Manifest, NodeRole};
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::NodeStatus;

use super::edge::Edge;
use super::node::{Behavior, Node};
use crate::context::{ContextSpec, ProfileRegistry};
use crate::handlers::HandlerRegistry;

/// A validated workflow graph.
///
/// Built once at load; every structural rule is checked in `Dag::new`, so
/// the router never has to re-check them mid-run.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    outbound: HashMap<String, Vec<Edge>>,
    inbound: HashMap<String, Vec<String>>,
    entry: String,
    rank: HashMap<String, usize>,
}

fn dangling(node: &str, reason: impl Into<String>) -> TrellisError {
    TrellisError::DanglingNode {
        node: node.to_string(),
        reason: reason.into(),
    }
}

impl Dag {
    /// Build and validate a graph.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        let mut node_map: HashMap<String, Node> = HashMap::new();
        let mut order = Vec::with_capacity(nodes.len());
        for node in nodes {
            node.validate()?;
            if node_map.contains_key(&node.id) {
                return Err(TrellisError::DuplicateNode(node.id));
            }
            order.push(node.id.clone());
            node_map.insert(node.id.clone(), node);
        }

        let mut outbound: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut inbound: HashMap<String, Vec<String>> = HashMap::new();
        for edge in edges {
            for end in [&edge.from, &edge.to] {
                if !node_map.contains_key(end) {
                    return Err(TrellisError::UnknownNode(end.clone()));
                }
            }
            inbound
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
            outbound.entry(edge.from.clone()).or_default().push(edge);
        }

        let entries: Vec<&String> = order
            .iter()
            .filter(|id| node_map[*id].role == NodeRole::Entry)
            .collect();
        let entry = match entries.as_slice() {
            [only] => (*only).clone(),
            [] => return Err(TrellisError::EntryNode("graph has no ENTRY node".into())),
            many => {
                return Err(TrellisError::EntryNode(format!(
                    "graph has {} ENTRY nodes, expected exactly one",
                    many.len()
                )))
            }
        };

        let mut dag = Self {
            nodes: node_map,
            order,
            outbound,
            inbound,
            entry,
            rank: HashMap::new(),
        };
        dag.validate_degrees()?;
        dag.rank = dag.topological_rank()?;

        debug!(
            nodes = dag.nodes.len(),
            entry = %dag.entry,
            "DAG validated"
        );
        Ok(dag)
    }

    /// Build from a manifest, checking handler and profile references.
    pub fn from_manifest(
        manifest: &Manifest,
        profiles: &ProfileRegistry,
        handlers: &HandlerRegistry,
    ) -> Result<Self> {
        let nodes = manifest
            .nodes
            .iter()
            .map(Node::from_config)
            .collect::<Result<Vec<_>>>()?;
        let edges = manifest.edges.iter().map(Edge::from).collect();
        let dag = Self::new(nodes, edges)?;
        dag.check_references(profiles, handlers)?;
        Ok(dag)
    }

    /// Every deterministic handler must be registered. Unknown profile ids
    /// only warn here; they fail the task when the node is reached.
    pub fn check_references(
        &self,
        profiles: &ProfileRegistry,
        handlers: &HandlerRegistry,
    ) -> Result<()> {
        for node in self.nodes() {
            if node.behavior() == Behavior::RunHandler && !handlers.contains(node.handler_name()) {
                return Err(TrellisError::HandlerNotFound(node.handler_name().to_string()));
            }
            if let ContextSpec::Profile(id) = &node.context {
                if profiles.get(id).is_none() {
                    warn!(
                        node = %node.id,
                        profile = %id,
                        "Node references an unknown context profile"
                    );
                }
            }
        }
        Ok(())
    }

    fn validate_degrees(&self) -> Result<()> {
        if !self.inbound(&self.entry).is_empty() {
            return Err(TrellisError::EntryNode(format!(
                "entry node {} has inbound edges",
                self.entry
            )));
        }

        let mut exits = 0;
        for node in self.nodes() {
            let outs = self.outbound(&node.id).len();
            let ins = self.inbound(&node.id).len();
            match node.role {
                NodeRole::Exit => {
                    exits += 1;
                    if outs != 0 {
                        return Err(TrellisError::MalformedExitNode {
                            node: node.id.clone(),
                            reason: format!(
                                "exit nodes must have no outbound edges (found {})",
                                outs
                            ),
                        });
                    }
                    if ins == 0 {
                        return Err(TrellisError::MalformedExitNode {
                            node: node.id.clone(),
                            reason: "exit nodes need at least one inbound edge".into(),
                        });
                    }
                }
                NodeRole::Branch | NodeRole::Split if outs < 2 => {
                    return Err(dangling(
                        &node.id,
                        format!("{:?} nodes need at least two outbound edges", node.role),
                    ));
                }
                NodeRole::Merge if ins < 2 => {
                    return Err(dangling(&node.id, "merge nodes need at least two inbound edges"));
                }
                _ if outs == 0 => {
                    return Err(dangling(&node.id, "non-exit node has no outbound edges"));
                }
                _ => {}
            }
        }

        if exits == 0 {
            return Err(dangling(&self.entry, "graph has no EXIT node"));
        }
        Ok(())
    }

    /// Rejects cycles and unreachable nodes, then returns each node's
    /// position in a topological order.
    fn topological_rank(&self) -> Result<HashMap<String, usize>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .order
            .iter()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();
        for edges in self.outbound.values() {
            for edge in edges {
                graph.add_edge(index[edge.from.as_str()], index[edge.to.as_str()], ());
            }
        }

        let sorted = toposort(&graph, None)
            .map_err(|cycle| TrellisError::CycleDetected(graph[cycle.node_id()].to_string()))?;

        let mut reached = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&graph, index[self.entry.as_str()]);
        while let Some(ix) = dfs.next(&graph) {
            reached.insert(graph[ix]);
        }
        if let Some(orphan) = self.order.iter().find(|id| !reached.contains(id.as_str())) {
            return Err(dangling(orphan, "not reachable from the entry node"));
        }
        Ok(sorted
            .into_iter()
            .enumerate()
            .map(|(rank, ix)| (graph[ix].to_string(), rank))
            .collect())
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn outbound(&self, id: &str) -> &[Edge] {
        self.outbound.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of the nodes with an edge into `id`.
    pub fn inbound(&self, id: &str) -> &[String] {
        self.inbound.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges to follow after `id` finished. SPLIT follows every matching
    /// edge; every other role takes the first match.
    pub fn route(&self, id: &str, status: NodeStatus, output: &serde_json::Value) -> Vec<&Edge> {
        let mut matching = self
            .outbound(id)
            .iter()
            .filter(|edge| edge.fires(status, output));
        match self.node(id).map(|n| n.role) {
            Some(NodeRole::Split) => matching.collect(),
            _ => matching.next().into_iter().collect(),
        }
    }

    /// Position of `id` in a topological order of the graph. A node never
    /// ranks below anything that can reach it.
    pub fn rank(&self, id: &str) -> usize {
        self.rank.get(id).copied().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::config::{EdgeCondition, MergeFailureMode, NodeKind};

    fn linear() -> (Vec<Node>, Vec<Edge>) {
        (
            vec![
                Node::agent("start", NodeRole::Entry),
                Node::agent("work", NodeRole::Standard),
                Node::exit("done"),
            ],
            vec![Edge::always("start", "work"), Edge::always("work", "done")],
        )
    }

    #[test]
    fn test_valid_linear_graph() {
        let (nodes, edges) = linear();
        let dag = Dag::new(nodes, edges).unwrap();
        assert_eq!(dag.entry(), "start");
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.inbound("done"), &["work".to_string()]);
        assert!(dag.outbound("done").is_empty());
    }

    #[test]
    fn test_exit_with_tools_rejected() {
        let nodes = vec![
            Node::agent("start", NodeRole::Entry),
            Node::exit("done").with_tools(vec!["bash".into()]),
        ];
        let err = Dag::new(nodes, vec![Edge::always("start", "done")]).unwrap_err();
        assert!(matches!(err, TrellisError::MalformedExitNode { .. }));
    }

    #[test]
    fn test_exit_with_outbound_rejected() {
        let nodes = vec![
            Node::agent("start", NodeRole::Entry),
            Node::exit("done"),
            Node::exit("after"),
        ];
        let edges = vec![Edge::always("start", "done"), Edge::always("done", "after")];
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::MalformedExitNode { .. })
        ));
    }

    #[test]
    fn test_always_fail_outside_exit_rejected() {
        let nodes = vec![
            Node::agent("start", NodeRole::Entry).always_fail(true),
            Node::exit("done"),
        ];
        assert!(matches!(
            Dag::new(nodes, vec![Edge::always("start", "done")]),
            Err(TrellisError::AlwaysFailOutsideExit(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            Node::agent("start", NodeRole::Entry),
            Node::agent("a", NodeRole::Branch),
            Node::agent("b", NodeRole::Standard),
            Node::exit("done"),
        ];
        let edges = vec![
            Edge::always("start", "a"),
            Edge::new("a", "b", EdgeCondition::OnSuccess),
            Edge::new("a", "done", EdgeCondition::OnFailure),
            Edge::always("b", "a"),
        ];
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_entry_rules() {
        let nodes = vec![Node::agent("a", NodeRole::Standard), Node::exit("done")];
        assert!(matches!(
            Dag::new(nodes, vec![Edge::always("a", "done")]),
            Err(TrellisError::EntryNode(_))
        ));

        let nodes = vec![
            Node::agent("a", NodeRole::Entry),
            Node::agent("b", NodeRole::Entry),
            Node::exit("done"),
        ];
        let edges = vec![Edge::always("a", "done"), Edge::always("b", "done")];
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::EntryNode(_))
        ));
    }

    #[test]
    fn test_unknown_edge_target() {
        let (nodes, mut edges) = linear();
        edges.push(Edge::always("work", "ghost"));
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::UnknownNode(ref id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_node() {
        let (mut nodes, edges) = linear();
        nodes.push(Node::agent("work", NodeRole::Standard));
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_unreachable_node() {
        let (mut nodes, mut edges) = linear();
        nodes.push(Node::agent("island", NodeRole::Standard));
        edges.push(Edge::always("island", "done"));
        assert!(matches!(
            Dag::new(nodes, edges),
            Err(TrellisError::DanglingNode { ref node, .. }) if node == "island"
        ));
    }

    #[test]
    fn test_split_routes_all_matching_edges() {
        let nodes = vec![
            Node::deterministic("in", NodeRole::Entry),
            Node::deterministic("start", NodeRole::Split),
            Node::agent("a", NodeRole::Standard),
            Node::agent("b", NodeRole::Standard),
            Node::deterministic("join", NodeRole::Merge).with_merge_mode(MergeFailureMode::Partial),
            Node::exit("done"),
        ];
        let edges = vec![
            Edge::always("in", "start"),
            Edge::always("start", "a"),
            Edge::always("start", "b"),
            Edge::always("a", "join"),
            Edge::always("b", "join"),
            Edge::always("join", "done"),
        ];
        let dag = Dag::new(nodes, edges).unwrap();
        let routes = dag.route("start", NodeStatus::Succeeded, &json!(null));
        assert_eq!(routes.len(), 2);
        assert_eq!(dag.inbound("join").len(), 2);
    }

    #[test]
    fn test_rank_follows_edges() {
        let nodes = vec![
            Node::deterministic("in", NodeRole::Entry),
            Node::deterministic("fork", NodeRole::Split),
            Node::agent("x", NodeRole::Standard),
            Node::agent("y", NodeRole::Standard),
            Node::agent("z", NodeRole::Standard),
            Node::deterministic("outer", NodeRole::Merge),
            Node::deterministic("inner", NodeRole::Merge),
            Node::exit("done"),
        ];
        let edges = vec![
            Edge::always("in", "fork"),
            Edge::always("fork", "x"),
            Edge::always("fork", "y"),
            Edge::always("fork", "z"),
            Edge::always("x", "outer"),
            Edge::always("y", "inner"),
            Edge::always("z", "inner"),
            Edge::always("inner", "outer"),
            Edge::always("outer", "done"),
        ];
        let dag = Dag::new(nodes, edges).unwrap();

        assert_eq!(dag.rank("in"), 0);
        assert!(dag.rank("inner") < dag.rank("outer"));
        assert!(dag.rank("outer") < dag.rank("done"));
        assert_eq!(dag.rank("ghost"), usize::MAX);
    }

    #[test]
    fn test_branch_takes_first_match() {
        let nodes = vec![
            Node::agent("start", NodeRole::Entry),
            Node::agent("check", NodeRole::Branch),
            Node::agent("fix", NodeRole::Standard),
            Node::exit("done"),
        ];
        let edges = vec![
            Edge::always("start", "check"),
            Edge::new(
                "check",
                "fix",
                EdgeCondition::Conditional {
                    expr: r#"verdict == "reject""#.into(),
                },
            ),
            Edge::always("check", "done"),
            Edge::always("fix", "done"),
        ];
        let dag = Dag::new(nodes, edges).unwrap();

        let reject = dag.route("check", NodeStatus::Succeeded, &json!({"verdict": "reject"}));
        assert_eq!(reject.len(), 1);
        assert_eq!(reject[0].to, "fix");

        let approve = dag.route("check", NodeStatus::Succeeded, &json!({"verdict": "ok"}));
        assert_eq!(approve[0].to, "done");
    }

    #[test]
    fn test_missing_handler_rejected() {
        let mut m = trellis_test_utils::linear_manifest();
        m.nodes[1].kind = NodeKind::Deterministic;
        m.nodes[1].handler = Some("nonexistent".into());
        let handlers = HandlerRegistry::with_builtins();
        let err = Dag::from_manifest(&m, &ProfileRegistry::new(100), &handlers).unwrap_err();
        assert!(matches!(err, TrellisError::HandlerNotFound(_)));
    }
}
