//! Command dependency graph, validation and execution planning
//!
//! [`CommandGraph`] wraps a petgraph `DiGraph` whose node indices follow the
//! commands' declaration order. Cycle detection uses an iterative three-color
//! depth-first search so deep graphs cannot exhaust the call stack; level
//! assignment uses Kahn's algorithm.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::model::{Command, CommandId, Dependency, DependencyKind};

pub mod plan;
pub mod validator;

pub use plan::{ExecutionPlan, PlanBuilder, PlanWarning, Stage};
pub use validator::{GraphValidator, ParameterValidator, SchemaValidator, ValidationReport, Violation};

/// Errors specific to graph operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Id not present in the graph
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// The graph contains a cycle through these commands
    #[error("Cycle detected through commands: {}", .0.join(" -> "))]
    CycleDetected(Vec<CommandId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

struct Frame {
    node: NodeIndex,
    successors: Vec<NodeIndex>,
    next: usize,
}

/// Directed graph of commands; an edge `a -> b` means `b` depends on `a`
#[derive(Debug, Clone)]
pub struct CommandGraph {
    graph: DiGraph<CommandId, DependencyKind>,
    node_map: HashMap<CommandId, NodeIndex>,
}

impl CommandGraph {
    /// Build a graph from commands and dependencies.
    ///
    /// Duplicate command ids keep their first declaration. Dependencies
    /// whose endpoints are unknown are left out; their indices are returned
    /// alongside the graph.
    pub fn build(commands: &[Command], dependencies: &[Dependency]) -> (Self, Vec<usize>) {
        let mut graph = DiGraph::with_capacity(commands.len(), dependencies.len());
        let mut node_map = HashMap::with_capacity(commands.len());

        for command in commands {
            if !node_map.contains_key(&command.id) {
                let idx = graph.add_node(command.id.clone());
                node_map.insert(command.id.clone(), idx);
            }
        }

        let mut dangling = Vec::new();
        for (index, dep) in dependencies.iter().enumerate() {
            match (node_map.get(&dep.from), node_map.get(&dep.to)) {
                (Some(&from), Some(&to)) => {
                    graph.add_edge(from, to, dep.kind);
                }
                _ => dangling.push(index),
            }
        }

        (Self { graph, node_map }, dangling)
    }

    /// Number of commands
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of dependency edges
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether a command id is present
    pub fn contains(&self, id: &str) -> bool {
        self.node_map.contains_key(id)
    }

    /// Commands that depend directly on `id`
    pub fn dependents(&self, id: &str) -> Result<Vec<CommandId>, GraphError> {
        let idx = self.index_of(id)?;
        Ok(self
            .successors(idx)
            .into_iter()
            .map(|n| self.graph[n].clone())
            .collect())
    }

    /// Commands `id` depends on directly
    pub fn prerequisites(&self, id: &str) -> Result<Vec<CommandId>, GraphError> {
        let idx = self.index_of(id)?;
        let mut preds: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        preds.sort();
        preds.dedup();
        Ok(preds.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    fn index_of(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.node_map
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::CommandNotFound(id.to_string()))
    }

    /// Outgoing neighbours in declaration order
    fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        next.sort();
        next.dedup();
        next
    }

    /// Whether any cycle exists
    pub fn has_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Find a cycle, if any, as the path of commands forming it.
    ///
    /// Every node is a traversal root, visited in declaration order, so
    /// disconnected sub-graphs are all checked.
    pub fn find_cycle(&self) -> Option<Vec<CommandId>> {
        let mut color = vec![Color::Unvisited; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if color[root.index()] != Color::Unvisited {
                continue;
            }

            color[root.index()] = Color::InProgress;
            let mut stack = vec![Frame {
                node: root,
                successors: self.successors(root),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                if frame.next < frame.successors.len() {
                    let target = frame.successors[frame.next];
                    frame.next += 1;

                    match color[target.index()] {
                        Color::InProgress => {
                            // Back edge: the cycle is the stack suffix starting at `target`
                            let start = stack.iter().position(|f| f.node == target).unwrap_or(0);
                            let cycle = stack[start..]
                                .iter()
                                .map(|f| self.graph[f.node].clone())
                                .collect();
                            return Some(cycle);
                        }
                        Color::Unvisited => {
                            color[target.index()] = Color::InProgress;
                            stack.push(Frame {
                                node: target,
                                successors: self.successors(target),
                                next: 0,
                            });
                        }
                        Color::Done => {}
                    }
                } else {
                    color[frame.node.index()] = Color::Done;
                    stack.pop();
                }
            }
        }

        None
    }

    /// Assign every command to a level with Kahn's algorithm.
    ///
    /// Level 0 holds commands without incoming edges; a command joins level
    /// `k + 1` once every edge into it comes from levels `<= k`. Commands
    /// inside a level keep declaration order.
    pub fn levels(&self) -> Result<Vec<Vec<CommandId>>, GraphError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut levels = Vec::new();
        let mut leveled = 0;

        while !current.is_empty() {
            leveled += current.len();
            let mut next = Vec::new();

            for &node in &current {
                for target in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    let degree = &mut in_degree[target.index()];
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(target);
                    }
                }
            }

            next.sort();
            levels.push(current.iter().map(|n| self.graph[*n].clone()).collect());
            current = next;
        }

        if leveled < self.graph.node_count() {
            let remaining = self
                .graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| self.graph[n].clone())
                .collect();
            return Err(GraphError::CycleDetected(remaining));
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Command;

    fn commands(ids: &[&str]) -> Vec<Command> {
        ids.iter().map(|id| Command::wait(*id, 10)).collect()
    }

    #[test]
    fn test_build_skips_dangling_edges() {
        let cmds = commands(&["a", "b"]);
        let deps = vec![Dependency::completion("a", "b"), Dependency::completion("a", "zzz")];

        let (graph, dangling) = CommandGraph::build(&cmds, &deps);

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(dangling, vec![1]);
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let cmds = commands(&["a", "b", "c"]);
        let deps = vec![
            Dependency::completion("a", "b"),
            Dependency::completion("b", "c"),
            Dependency::completion("c", "a"),
        ];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        assert_eq!(graph.find_cycle(), Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let cmds = commands(&["a"]);
        let deps = vec![Dependency::completion("a", "a")];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        assert!(graph.has_cycles());
    }

    #[test]
    fn test_disconnected_cycle_found() {
        let cmds = commands(&["a", "b", "c", "d"]);
        let deps = vec![Dependency::completion("c", "d"), Dependency::completion("d", "c")];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        assert!(graph.has_cycles());
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let cmds = commands(&["a", "b", "c", "d"]);
        let deps = vec![
            Dependency::completion("a", "b"),
            Dependency::completion("a", "c"),
            Dependency::completion("b", "d"),
            Dependency::completion("c", "d"),
        ];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        assert!(!graph.has_cycles());
        assert_eq!(
            graph.levels().unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()], vec!["d".to_string()]]
        );
    }

    #[test]
    fn test_levels_fail_on_cycle() {
        let cmds = commands(&["a", "b", "c"]);
        let deps = vec![Dependency::completion("b", "c"), Dependency::completion("c", "b")];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        match graph.levels() {
            Err(GraphError::CycleDetected(remaining)) => {
                assert_eq!(remaining, vec!["b".to_string(), "c".to_string()])
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_neighbours() {
        let cmds = commands(&["a", "b", "c"]);
        let deps = vec![Dependency::completion("a", "c"), Dependency::completion("b", "c")];
        let (graph, _) = CommandGraph::build(&cmds, &deps);

        assert_eq!(graph.prerequisites("c").unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(graph.dependents("a").unwrap(), vec!["c".to_string()]);
        assert!(matches!(graph.dependents("x"), Err(GraphError::CommandNotFound(_))));
    }
}
