//! Dependency graph collaborator.
//!
//! A thin wrapper over [`petgraph::graph::DiGraph`] keyed by instance name.
//! The System and the Loading Set each own one of these; the graph stores
//! node identifiers only, never owning references to instance handles.

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A directed graph of instance names, used both by the System (the
/// subsystem-wide dependency graph) and by the Loading Set (the transient
/// load graph built during commit).
#[derive(Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index_of.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_owned());
        self.index_of.insert(name.to_owned(), idx);
        idx
    }

    pub fn remove_node(&mut self, name: &str) {
        if let Some(idx) = self.index_of.remove(name) {
            self.graph.remove_node(idx);
            // `remove_node` swaps the last node into `idx`'s slot; fix up
            // the index for whichever node (if any) got relocated there.
            if let Some(moved) = self.graph.node_weight(idx) {
                self.index_of.insert(moved.clone(), idx);
            }
        }
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.index_of.contains_key(name)
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.index_of.get(name).copied()
    }

    /// Inserts a directed edge `from -> to` ("`from` requires `to`").
    /// Both endpoints must already be present as nodes.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) {
        if let (Some(&a), Some(&b)) = (self.index_of.get(from), self.index_of.get(to)) {
            if let Some(edge) = self.graph.find_edge(a, b) {
                self.graph.remove_edge(edge);
            }
        }
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index_of.get(from), self.index_of.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// True iff a directed path `from -> ... -> to` exists.
    pub fn path_exists(&self, from: &str, to: &str) -> bool {
        match (self.index_of.get(from), self.index_of.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// True iff the graph, taken as a whole, contains a cycle.
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Names of all nodes reachable from `name` in `direction` (direct
    /// neighbors only).
    pub fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index_of.get(name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Names of all nodes with no edges in `direction` (e.g. `Incoming`
    /// externals have no dependents still pointing at them).
    pub fn externals(&self, direction: Direction) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    pub fn incoming_count(&self, name: &str) -> usize {
        match self.index_of.get(name) {
            Some(&idx) => self.graph.neighbors_directed(idx, Direction::Incoming).count(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cycle() {
        let mut g = DependencyGraph::new();
        g.add_edge("a", "b");
        assert!(!g.is_cyclic());
        g.add_edge("b", "a");
        assert!(g.is_cyclic());
    }

    #[test]
    fn path_exists_transitively() {
        let mut g = DependencyGraph::new();
        g.add_edge("a", "b");
        g.add_edge("b", "c");
        assert!(g.path_exists("a", "c"));
        assert!(!g.path_exists("c", "a"));
    }

    #[test]
    fn remove_node_keeps_remaining_edges_consistent() {
        let mut g = DependencyGraph::new();
        g.add_edge("a", "b");
        g.add_edge("b", "c");
        g.remove_node("b");
        assert!(!g.contains_node("b"));
        assert!(!g.path_exists("a", "c"));
    }
}
