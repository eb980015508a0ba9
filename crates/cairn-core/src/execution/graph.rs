//! Plan graph validation.
//!
//! Uses `petgraph` to model parent/child and sibling edges. A graph is
//! accepted only when every reference resolves, every node is reachable from
//! the root and there is no cycle through either kind of edge.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use thiserror::Error;

use cairn_types::graph::{ExecutionMode, PlanGraph};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("root node '{0}' is not defined")]
    MissingRoot(String),

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("node '{from}' references unknown node '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("cycle detected at node '{0}'")]
    CycleDetected(String),

    #[error("node '{0}' is not reachable from the root")]
    Unreachable(String),

    #[error("node '{node}' has invalid children for its mode: {reason}")]
    InvalidChildren { node: String, reason: String },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `graph` can be executed.
pub fn validate_graph(graph: &PlanGraph) -> Result<(), GraphError> {
    let mut dag = DiGraph::<&str, ()>::new();
    let mut index = HashMap::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if index.contains_key(node.id.as_str()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
        index.insert(node.id.as_str(), dag.add_node(node.id.as_str()));
    }

    let root = *index
        .get(graph.root_node_id.as_str())
        .ok_or_else(|| GraphError::MissingRoot(graph.root_node_id.clone()))?;

    for node in &graph.nodes {
        check_children(node.mode, &node.id, node.children.len())?;

        let from = index[node.id.as_str()];
        let targets = node.children.iter().chain(node.next_node_id.iter());
        for target in targets {
            let to = index
                .get(target.as_str())
                .ok_or_else(|| GraphError::UnknownReference {
                    from: node.id.clone(),
                    to: target.clone(),
                })?;
            dag.add_edge(from, *to, ());
        }
    }

    toposort(&dag, None)
        .map_err(|cycle| GraphError::CycleDetected(dag[cycle.node_id()].to_string()))?;

    let mut seen = vec![false; dag.node_count()];
    let mut dfs = Dfs::new(&dag, root);
    while let Some(ix) = dfs.next(&dag) {
        seen[ix.index()] = true;
    }
    if let Some(ix) = seen.iter().position(|reached| !reached) {
        return Err(GraphError::Unreachable(graph.nodes[ix].id.clone()));
    }

    Ok(())
}

fn check_children(mode: ExecutionMode, node: &str, count: usize) -> Result<(), GraphError> {
    let reason = match mode {
        ExecutionMode::Child if count != 1 => {
            Some(format!("child mode needs exactly one child, got {count}"))
        }
        ExecutionMode::Children | ExecutionMode::ChildChain if count == 0 => {
            Some("composite mode needs at least one child".to_string())
        }
        ExecutionMode::Sync | ExecutionMode::Async if count > 0 => {
            Some("leaf modes cannot declare children".to_string())
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(GraphError::InvalidChildren {
            node: node.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::graph::PlanNode;
    use uuid::Uuid;

    fn leaf(id: &str, next: Option<&str>) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            identifier: id.to_string(),
            name: id.to_string(),
            step_type: "noop".to_string(),
            step_category: Default::default(),
            mode: ExecutionMode::Sync,
            children: vec![],
            max_concurrency: None,
            next_node_id: next.map(str::to_string),
            failure_strategy: Default::default(),
            parameters: serde_json::Value::Null,
        }
    }

    fn parent(id: &str, mode: ExecutionMode, children: &[&str]) -> PlanNode {
        PlanNode {
            mode,
            children: children.iter().map(|c| c.to_string()).collect(),
            ..leaf(id, None)
        }
    }

    fn graph(nodes: Vec<PlanNode>) -> PlanGraph {
        PlanGraph {
            plan_id: Uuid::now_v7(),
            root_node_id: "root".to_string(),
            nodes,
        }
    }

    #[test]
    fn accepts_chain_under_child_root() {
        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a"]),
            leaf("a", Some("b")),
            leaf("b", Some("c")),
            leaf("c", None),
        ]);
        assert_eq!(validate_graph(&g), Ok(()));
    }

    #[test]
    fn rejects_missing_root() {
        let g = PlanGraph {
            root_node_id: "nope".into(),
            ..graph(vec![leaf("a", None)])
        };
        assert_eq!(validate_graph(&g), Err(GraphError::MissingRoot("nope".into())));
    }

    #[test]
    fn rejects_duplicates_and_unknown_refs() {
        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a"]),
            leaf("a", None),
            leaf("a", None),
        ]);
        assert_eq!(validate_graph(&g), Err(GraphError::DuplicateNode("a".into())));

        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a"]),
            leaf("a", Some("zzz")),
        ]);
        assert!(matches!(validate_graph(&g), Err(GraphError::UnknownReference { .. })));
    }

    #[test]
    fn rejects_sibling_cycle() {
        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a"]),
            leaf("a", Some("b")),
            leaf("b", Some("a")),
        ]);
        assert!(matches!(validate_graph(&g), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn rejects_unreachable_node() {
        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a"]),
            leaf("a", None),
            leaf("orphan", None),
        ]);
        assert_eq!(validate_graph(&g), Err(GraphError::Unreachable("orphan".into())));
    }

    #[test]
    fn child_mode_requires_exactly_one_child() {
        let g = graph(vec![
            parent("root", ExecutionMode::Child, &["a", "b"]),
            leaf("a", None),
            leaf("b", None),
        ]);
        assert!(matches!(validate_graph(&g), Err(GraphError::InvalidChildren { .. })));

        let g = graph(vec![parent("root", ExecutionMode::Children, &[])]);
        assert!(matches!(validate_graph(&g), Err(GraphError::InvalidChildren { .. })));
    }
}
