//! Dependency graph solver.
//!
//! Turns the frontend's operation stream into a DAG: one node per operation,
//! edges from each input to the node that produced it, cycle detection,
//! levels (longest path from a root) and a stable execution order.

use crate::builder::frontend::{CONTEXT_INPUT_PREFIX, IMAGE_INPUT_PREFIX};
use crate::types::{Operation, OperationType};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A directed acyclic graph representing a build plan.
///
/// Nodes live in an arena indexed by id; edges are index vectors. The graph
/// is read-only once solved.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    /// All nodes in the graph, `nodes[i].id == i`
    pub nodes: Vec<BuildNode>,
    /// Root nodes (no dependencies)
    pub roots: Vec<usize>,
    /// Execution order: ascending level, then ascending id
    pub order: Vec<usize>,
    /// Node ids grouped by level
    pub levels: Vec<Vec<usize>>,
}

/// A single node in the build graph (one operation).
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub id: usize,
    pub operation: Operation,
    /// Cache key of the operation, computed once
    pub cache_key: String,
    /// Nodes whose outputs this node consumes
    pub dependencies: Vec<usize>,
    /// Nodes consuming this node's outputs
    pub dependents: Vec<usize>,
    /// 0 for roots, otherwise 1 + max level of the dependencies
    pub level: usize,
}

/// Lifecycle of a node during scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

/// Error type for build graph operations.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Circular dependency detected
    CircularDependency { cycle: Vec<usize> },
    /// An input names no known output and no external source
    DanglingInput { node: usize, input: String },
    /// Two operations declare the same output
    DuplicateOutput { output: String, first: usize, second: usize },
    /// Invalid graph state
    InvalidGraph { message: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::CircularDependency { cycle } => {
                write!(f, "Circular dependency detected: {:?}", cycle)
            }
            GraphError::DanglingInput { node, input } => {
                write!(f, "Node {} consumes unknown input: {}", node, input)
            }
            GraphError::DuplicateOutput { output, first, second } => {
                write!(f, "Output {} is produced by both node {} and node {}", output, first, second)
            }
            GraphError::InvalidGraph { message } => {
                write!(f, "Invalid graph: {}", message)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Solver knobs.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Merge chains of meta operations with no other readers
    pub coalesce_meta: bool,
    /// Input prefixes that resolve outside the graph
    pub external_prefixes: Vec<String>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            coalesce_meta: true,
            external_prefixes: vec![CONTEXT_INPUT_PREFIX.to_string(), IMAGE_INPUT_PREFIX.to_string()],
        }
    }
}

impl BuildGraph {
    /// Solves a list of operations with default options.
    pub fn solve(operations: Vec<Operation>) -> Result<Self, GraphError> {
        Self::solve_with(operations, &SolverOptions::default())
    }

    /// Solves a list of operations into a validated, levelled graph.
    ///
    /// # Returns
    /// * `Ok(BuildGraph)` - An acyclic graph with levels and order computed
    /// * `Err(GraphError)` - Cycle, dangling input or duplicate output
    pub fn solve_with(operations: Vec<Operation>, options: &SolverOptions) -> Result<Self, GraphError> {
        let operations =
            if options.coalesce_meta { coalesce_meta(operations) } else { operations };

        let mut builder = GraphBuilder::new(operations, options);
        builder.link()?;
        builder.detect_cycles()?;
        Ok(builder.finish())
    }

    /// Node ids in execution order.
    pub fn topological_sort(&self) -> Vec<usize> {
        self.order.clone()
    }

    /// Gets a node by ID.
    pub fn get_node(&self, id: usize) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    /// Gets dependencies for a node.
    pub fn get_dependencies(&self, node_id: usize) -> &[usize] {
        self.nodes.get(node_id).map(|n| n.dependencies.as_slice()).unwrap_or(&[])
    }

    /// Gets dependents for a node.
    pub fn get_dependents(&self, node_id: usize) -> &[usize] {
        self.nodes.get(node_id).map(|n| n.dependents.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes with no dependents; their outputs form the build result.
    pub fn leaves(&self) -> Vec<usize> {
        self.nodes.iter().filter(|n| n.dependents.is_empty()).map(|n| n.id).collect()
    }

    /// Cache keys in execution order.
    pub fn ordered_keys(&self) -> Vec<&str> {
        self.order.iter().map(|&id| self.nodes[id].cache_key.as_str()).collect()
    }
}

/// Internal builder for constructing the build graph.
struct GraphBuilder<'a> {
    nodes: Vec<BuildNode>,
    options: &'a SolverOptions,
}

impl<'a> GraphBuilder<'a> {
    fn new(operations: Vec<Operation>, options: &'a SolverOptions) -> Self {
        let nodes = operations
            .into_iter()
            .enumerate()
            .map(|(id, operation)| BuildNode {
                id,
                cache_key: operation.cache_key(),
                operation,
                dependencies: Vec::new(),
                dependents: Vec::new(),
                level: 0,
            })
            .collect();

        Self { nodes, options }
    }

    fn is_external(&self, input: &str) -> bool {
        self.options.external_prefixes.iter().any(|p| input.starts_with(p.as_str()))
    }

    /// Resolves every input to its producing node.
    fn link(&mut self) -> Result<(), GraphError> {
        let mut producers: BTreeMap<&str, usize> = BTreeMap::new();
        for node in &self.nodes {
            for output in &node.operation.outputs {
                if let Some(&first) = producers.get(output.as_str()) {
                    return Err(GraphError::DuplicateOutput {
                        output: output.clone(),
                        first,
                        second: node.id,
                    });
                }
                producers.insert(output, node.id);
            }
        }

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for node in &self.nodes {
            let mut deps = BTreeSet::new();
            for input in &node.operation.inputs {
                match producers.get(input.as_str()) {
                    Some(&producer) => {
                        deps.insert(producer);
                    }
                    None if self.is_external(input) => {}
                    None => {
                        return Err(GraphError::DanglingInput { node: node.id, input: input.clone() })
                    }
                }
            }
            edges.extend(deps.into_iter().map(|dep| (dep, node.id)));
        }

        for (dep, node) in edges {
            self.nodes[node].dependencies.push(dep);
            self.nodes[dep].dependents.push(node);
        }

        Ok(())
    }

    /// Iterative DFS over dependency edges; fails on the first back edge.
    fn detect_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // (node, index of the next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::InProgress;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let deps = &self.nodes[node].dependencies;
                if top.1 < deps.len() {
                    let dep = deps[top.1];
                    top.1 += 1;
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::InProgress;
                            stack.push((dep, 0));
                        }
                        Mark::InProgress => {
                            let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                            let cycle = stack[from..].iter().map(|(n, _)| *n).collect();
                            return Err(GraphError::CircularDependency { cycle });
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    fn finish(mut self) -> BuildGraph {
        // Longest path from a root; acyclicity makes the fixpoint a DP over
        // nodes in dependency-first order.
        let mut resolved = vec![false; self.nodes.len()];
        for start in 0..self.nodes.len() {
            let mut stack = vec![start];
            while let Some(&node) = stack.last() {
                if resolved[node] {
                    stack.pop();
                    continue;
                }
                let pending: Vec<usize> = self.nodes[node]
                    .dependencies
                    .iter()
                    .copied()
                    .filter(|&d| !resolved[d])
                    .collect();
                if pending.is_empty() {
                    self.nodes[node].level = self.nodes[node]
                        .dependencies
                        .iter()
                        .map(|&d| self.nodes[d].level + 1)
                        .max()
                        .unwrap_or(0);
                    resolved[node] = true;
                    stack.pop();
                } else {
                    stack.extend(pending);
                }
            }
        }

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&id| (self.nodes[id].level, id));

        let depth = self.nodes.iter().map(|n| n.level + 1).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); depth];
        for &id in &order {
            levels[self.nodes[id].level].push(id);
        }

        let roots = self.nodes.iter().filter(|n| n.dependencies.is_empty()).map(|n| n.id).collect();

        BuildGraph { nodes: self.nodes, roots, order, levels }
    }
}

/// Merges a meta operation into the meta operation that is the only reader
/// of its outputs. Chains collapse into their last member.
fn coalesce_meta(operations: Vec<Operation>) -> Vec<Operation> {
    let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();

    for i in 0..slots.len() {
        let Some(first) = slots[i].as_ref() else { continue };
        if first.op_type != OperationType::Meta || first.outputs.is_empty() {
            continue;
        }

        let readers: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(j, slot)| {
                *j != i
                    && slot
                        .as_ref()
                        .map(|op| op.inputs.iter().any(|input| first.outputs.contains(input)))
                        .unwrap_or(false)
            })
            .map(|(j, _)| j)
            .collect();

        let [reader] = readers[..] else { continue };
        let mergeable = reader > i
            && slots[reader].as_ref().map(|op| op.op_type == OperationType::Meta).unwrap_or(false);
        if !mergeable {
            continue;
        }

        if let (Some(first), Some(second)) = (slots[i].take(), slots[reader].as_mut()) {
            let mut inputs = first.inputs.clone();
            inputs.extend(second.inputs.iter().filter(|input| !first.outputs.contains(*input)).cloned());
            second.inputs = inputs;

            let mut command = first.command;
            command.append(&mut second.command);
            second.command = command;

            let mut metadata = first.metadata;
            metadata.append(&mut second.metadata);
            second.metadata = metadata;
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::frontend;
    use crate::config::BuildConfig;
    use crate::types::Platform;

    fn op(op_type: OperationType, name: &str, inputs: &[&str], outputs: &[&str]) -> Operation {
        let mut op = Operation::new(op_type, vec![name.to_string()], Platform::new("linux", "amd64", None));
        op.inputs = inputs.iter().map(|s| s.to_string()).collect();
        op.outputs = outputs.iter().map(|s| s.to_string()).collect();
        op
    }

    fn plain() -> SolverOptions {
        SolverOptions { coalesce_meta: false, ..Default::default() }
    }

    #[test]
    fn test_linear_chain() {
        let config = BuildConfig::default();
        let ops = frontend::parse("FROM alpine\nRUN echo hi\nCMD [\"sh\"]", &config).unwrap();
        let graph = BuildGraph::solve(ops).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots, vec![0]);
        assert_eq!(graph.order, vec![0, 1, 2]);
        assert_eq!(graph.levels, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(graph.get_dependencies(2), &[1]);
        assert_eq!(graph.get_dependents(0), &[1]);
        assert_eq!(graph.leaves(), vec![2]);
    }

    #[test]
    fn test_levels_longest_path() {
        // a -> b -> d, a -> c, c -> d
        let ops = vec![
            op(OperationType::Pull, "a", &["image://x"], &["a"]),
            op(OperationType::Exec, "b", &["a"], &["b"]),
            op(OperationType::Exec, "c", &["a"], &["c"]),
            op(OperationType::File, "d", &["b", "c", "context://f"], &["d"]),
            op(OperationType::Pull, "e", &[], &["e"]),
        ];
        let graph = BuildGraph::solve_with(ops, &plain()).unwrap();

        let levels: Vec<usize> = graph.nodes.iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![0, 1, 1, 2, 0]);
        assert_eq!(graph.order, vec![0, 4, 1, 2, 3]);
        assert_eq!(graph.levels[0], vec![0, 4]);

        for node in &graph.nodes {
            let expected = node.dependencies.iter().map(|&d| graph.nodes[d].level + 1).max().unwrap_or(0);
            assert_eq!(node.level, expected);
        }
    }

    #[test]
    fn test_cycle_detected() {
        let ops = vec![
            op(OperationType::Exec, "a", &["b"], &["a"]),
            op(OperationType::Exec, "b", &["a"], &["b"]),
        ];
        match BuildGraph::solve_with(ops, &plain()) {
            Err(GraphError::CircularDependency { cycle }) => {
                let cycle: BTreeSet<usize> = cycle.into_iter().collect();
                assert_eq!(cycle, BTreeSet::from([0, 1]));
            }
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_detected() {
        let ops = vec![op(OperationType::Exec, "a", &["a"], &["a"])];
        assert!(matches!(
            BuildGraph::solve(ops),
            Err(GraphError::CircularDependency { cycle }) if cycle == vec![0]
        ));
    }

    #[test]
    fn test_dangling_input() {
        let ops = vec![op(OperationType::Exec, "a", &["ghost"], &["a"])];
        assert_eq!(
            BuildGraph::solve(ops).unwrap_err(),
            GraphError::DanglingInput { node: 0, input: "ghost".into() }
        );
    }

    #[test]
    fn test_duplicate_output() {
        let ops = vec![
            op(OperationType::Pull, "a", &[], &["x"]),
            op(OperationType::Pull, "b", &[], &["x"]),
        ];
        assert!(matches!(BuildGraph::solve(ops), Err(GraphError::DuplicateOutput { .. })));
    }

    #[test]
    fn test_coalesce_meta_chain() {
        let config = BuildConfig::default();
        let ops = frontend::parse(
            "FROM alpine\nENV A=1\nLABEL x=y\nEXPOSE 80\nRUN echo $A",
            &config,
        )
        .unwrap();
        assert_eq!(ops.len(), 5);

        let graph = BuildGraph::solve(ops).unwrap();
        assert_eq!(graph.len(), 3);

        let merged = &graph.nodes[1].operation;
        assert_eq!(merged.op_type, OperationType::Meta);
        assert_eq!(merged.command, vec!["ENV", "A=1", "LABEL", "x=y", "EXPOSE", "80/tcp"]);
        assert_eq!(graph.get_dependencies(2), &[1]);
    }

    #[test]
    fn test_coalesce_keeps_shared_reads() {
        // b is read by both c and d, so it cannot merge into either
        let ops = vec![
            op(OperationType::Pull, "a", &[], &["a"]),
            op(OperationType::Meta, "b", &["a"], &["b"]),
            op(OperationType::Meta, "c", &["b"], &["c"]),
            op(OperationType::Exec, "d", &["b"], &["d"]),
        ];
        let graph = BuildGraph::solve(ops).unwrap();
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_multi_stage_graph() {
        let config = BuildConfig::default();
        let ops = frontend::parse(
            "FROM golang AS build\nRUN go build\nFROM alpine\nCOPY --from=build /app /app",
            &config,
        )
        .unwrap();
        let graph = BuildGraph::solve(ops).unwrap();

        // COPY waits on both the runtime base and the build stage
        assert_eq!(graph.get_dependencies(3), &[1, 2]);
        assert_eq!(graph.nodes[3].level, 2);
        assert_eq!(graph.roots, vec![0, 2]);
    }
}
