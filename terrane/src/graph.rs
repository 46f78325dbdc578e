//! Dependency graphs over node keys, their ordering and their cycles.
//!
//! Edges point from a dependent to its dependency: `a -> b` means `a` can
//! only be evaluated after `b`.

pub mod builder;
pub mod walk;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Graph<K: Ord> {
    nodes: BTreeMap<K, BTreeSet<K>>,
}

impl<K: Ord> Default for Graph<K> {
    fn default() -> Self {
        Graph {
            nodes: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Graph<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, key: K) {
        self.nodes.entry(key).or_default();
    }

    /// Record that `dependent` needs `dependency`. Both become nodes. A
    /// node that needs itself is a cycle of one.
    pub fn add_edge(&mut self, dependent: K, dependency: K) {
        self.add_node(dependency.clone());
        self.nodes.entry(dependent).or_default().insert(dependency);
    }

    pub fn dependencies(&self, key: &K) -> impl Iterator<Item = &K> {
        self.nodes.get(key).into_iter().flatten()
    }

    /// Every edge as `(dependent, dependency)`.
    pub fn edges(&self) -> impl Iterator<Item = (&K, &K)> {
        self.nodes
            .iter()
            .flat_map(|(k, deps)| deps.iter().map(move |d| (k, d)))
    }

    /// Dependencies first. Among nodes that are ready at the same time, the
    /// smallest key goes first, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<K>, CycleError<K>> {
        let mut remaining: BTreeMap<&K, usize> =
            self.nodes.iter().map(|(k, deps)| (k, deps.len())).collect();
        let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();
        for (dependent, dependency) in self.edges() {
            dependents.entry(dependency).or_default().push(dependent);
        }
        let mut ready: BTreeSet<&K> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(next.clone());
            for dependent in dependents.get(next).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        if order.len() < self.nodes.len() {
            let ordered: BTreeSet<&K> = order.iter().collect();
            let stuck: Vec<&K> = self.nodes.keys().filter(|k| !ordered.contains(k)).collect();
            return Err(self.find_cycle(&stuck).unwrap_or_else(|| CycleError {
                path: stuck.into_iter().cloned().collect(),
            }));
        }
        Ok(order)
    }

    /// A shortest cycle through any of `candidates`.
    fn find_cycle(&self, candidates: &[&K]) -> Option<CycleError<K>> {
        let mut best: Option<Vec<K>> = None;
        for start in candidates {
            if let Some(path) = self.shortest_path_back(start) {
                if best.as_ref().map(|b| path.len() < b.len()).unwrap_or(true) {
                    best = Some(path);
                }
            }
        }
        best.map(|path| CycleError { path })
    }

    /// Breadth-first search from `start` along dependency edges back to
    /// `start`.
    fn shortest_path_back(&self, start: &K) -> Option<Vec<K>> {
        let mut came_from: BTreeMap<&K, &K> = BTreeMap::new();
        let mut queue: VecDeque<&K> = VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            for next in self.dependencies(current) {
                if next == start {
                    let mut path = vec![current.clone()];
                    let mut k = current;
                    while k != start {
                        k = came_from[k];
                        path.push(k.clone());
                    }
                    path.reverse();
                    return Some(path);
                }
                if !came_from.contains_key(next) {
                    came_from.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

/// A dependency cycle. The first element depends on the second, and so
/// forth; the last depends on the first, which is not repeated.
pub struct CycleError<Key> {
    path: Vec<Key>,
}
impl<Key: Clone> Clone for CycleError<Key> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
        }
    }
}
impl<Key> CycleError<Key> {
    pub fn path(&self) -> &Vec<Key> {
        &self.path
    }
}
impl<Key: std::fmt::Display> std::fmt::Display for CycleError<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency cycle: ")?;
        for k in &self.path {
            write!(f, "{} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => write!(f, "(empty)"),
        }
    }
}
impl<Key: std::fmt::Display> std::fmt::Debug for CycleError<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CycleError({})", self)
    }
}
impl<Key: std::fmt::Display> std::error::Error for CycleError<Key> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &'static str)]) -> Graph<&'static str> {
        let mut g = Graph::new();
        for (a, b) in edges {
            g.add_edge(*a, *b);
        }
        g
    }

    #[test]
    fn order_respects_edges() {
        let g = graph(&[("c", "b"), ("b", "a"), ("d", "a")]);
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(g.dependencies(&"c").collect::<Vec<_>>(), vec![&"b"]);
    }

    #[test]
    fn order_is_deterministic_for_independent_nodes() {
        let mut g = Graph::new();
        for k in ["z", "m", "a"] {
            g.add_node(k);
        }
        assert_eq!(g.topological_order().unwrap(), vec!["a", "m", "z"]);
    }

    #[test]
    fn reports_a_shortest_cycle() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("c", "d"), ("d", "c"), ("e", "a")]);
        let err = g.topological_order().unwrap_err();
        assert_eq!(err.path(), &vec!["c", "d"]);
        assert_eq!(err.to_string(), "dependency cycle: c -> d -> c");
    }

    #[test]
    fn a_node_that_needs_itself_is_a_cycle() {
        let g = graph(&[("a", "a"), ("b", "a")]);
        let err = g.topological_order().unwrap_err();
        assert_eq!(err.path(), &vec!["a"]);
        assert_eq!(err.to_string(), "dependency cycle: a -> a");
    }
}
