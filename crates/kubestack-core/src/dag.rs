//! Index-based directed acyclic graph shared by resource graphs and stack sets.
//!
//! Vertices are dense indices handed out in insertion order. Edges point from
//! a dependent to its dependency. Acyclicity is kept incrementally: an edge is
//! only inserted if the dependent is not already reachable from the dependency.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

#[derive(Debug, Clone, Default)]
pub(crate) struct Dag {
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

/// Outcome of a rejected edge insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeError {
    UnknownVertex(usize),
    Cycle,
}

impl Dag {
    pub(crate) fn add_vertex(&mut self) -> usize {
        self.dependencies.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        self.dependencies.len() - 1
    }

    /// Remove the most recently added vertex together with its edges.
    pub(crate) fn pop_vertex(&mut self) -> Option<usize> {
        let dependencies = self.dependencies.pop()?;
        let dependents = self.dependents.pop()?;
        let v = self.dependencies.len();
        for u in dependencies {
            self.dependents[u].remove(&v);
        }
        for d in dependents {
            self.dependencies[d].remove(&v);
        }
        Some(v)
    }

    pub(crate) fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub(crate) fn contains(&self, v: usize) -> bool {
        v < self.len()
    }

    /// Insert `dependent -> dependency`. Returns `false` if the edge was
    /// already present.
    pub(crate) fn add_edge(&mut self, dependent: usize, dependency: usize) -> Result<bool, EdgeError> {
        for v in [dependent, dependency] {
            if !self.contains(v) {
                return Err(EdgeError::UnknownVertex(v));
            }
        }
        if dependent == dependency || self.reaches(dependency, dependent) {
            return Err(EdgeError::Cycle);
        }
        let inserted = self.dependencies[dependent].insert(dependency);
        self.dependents[dependency].insert(dependent);
        Ok(inserted)
    }

    /// Whether `to` is reachable from `from` following dependency edges,
    /// i.e. whether `from` transitively depends on `to`.
    pub(crate) fn reaches(&self, from: usize, to: usize) -> bool {
        if from == to {
            return true;
        }
        let mut seen = vec![false; self.len()];
        let mut stack = vec![from];
        while let Some(v) = stack.pop() {
            for &next in &self.dependencies[v] {
                if next == to {
                    return true;
                }
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        false
    }

    pub(crate) fn dependencies(&self, v: usize) -> &BTreeSet<usize> {
        &self.dependencies[v]
    }

    pub(crate) fn dependents(&self, v: usize) -> &BTreeSet<usize> {
        &self.dependents[v]
    }

    /// Every vertex `v` transitively depends on, excluding `v`.
    pub(crate) fn ancestors(&self, v: usize) -> BTreeSet<usize> {
        Self::closure(v, &self.dependencies)
    }

    /// Every vertex that transitively depends on `v`, excluding `v`.
    pub(crate) fn descendants(&self, v: usize) -> BTreeSet<usize> {
        Self::closure(v, &self.dependents)
    }

    fn closure(start: usize, edges: &[BTreeSet<usize>]) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(v) = stack.pop() {
            for &next in &edges[v] {
                if out.insert(next) {
                    stack.push(next);
                }
            }
        }
        out
    }

    /// Lazy topological order; among ready vertices the lowest index wins.
    pub(crate) fn topo(&self) -> Topo<'_> {
        let remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(v, _)| Reverse(v))
            .collect();
        Topo {
            dag: self,
            remaining,
            ready,
        }
    }
}

/// Kahn's algorithm driven one vertex per `next()` call.
#[derive(Debug, Clone)]
pub(crate) struct Topo<'a> {
    dag: &'a Dag,
    remaining: Vec<usize>,
    ready: BinaryHeap<Reverse<usize>>,
}

impl Iterator for Topo<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let Reverse(v) = self.ready.pop()?;
        for &dependent in self.dag.dependents(v) {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 {
                self.ready.push(Reverse(dependent));
            }
        }
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ready.len(), Some(self.dag.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(n: usize) -> Dag {
        let mut dag = Dag::default();
        for _ in 0..n {
            dag.add_vertex();
        }
        dag
    }

    #[test]
    fn test_topo_prefers_declaration_order() {
        let mut d = dag(4);
        d.add_edge(0, 3).unwrap();
        let order: Vec<_> = d.topo().collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut d = dag(3);
        d.add_edge(0, 1).unwrap();
        d.add_edge(1, 2).unwrap();
        assert_eq!(d.add_edge(2, 0), Err(EdgeError::Cycle));
        assert_eq!(d.add_edge(1, 1), Err(EdgeError::Cycle));
    }

    #[test]
    fn test_duplicate_and_implied_edges_accepted() {
        let mut d = dag(3);
        d.add_edge(2, 1).unwrap();
        d.add_edge(1, 0).unwrap();
        assert_eq!(d.add_edge(2, 1), Ok(false));
        assert_eq!(d.add_edge(2, 0), Ok(true));
    }

    #[test]
    fn test_pop_vertex_drops_its_edges() {
        let mut d = dag(3);
        d.add_edge(1, 0).unwrap();
        d.add_edge(2, 1).unwrap();
        d.add_edge(2, 0).unwrap();
        assert_eq!(d.pop_vertex(), Some(2));
        assert_eq!(d.len(), 2);
        assert!(d.dependents(0).contains(&1));
        assert!(!d.dependents(0).contains(&2));
        assert!(!d.dependents(1).contains(&2));
        assert_eq!(d.topo().collect::<Vec<_>>(), vec![0, 1]);

        assert_eq!(d.add_vertex(), 2);
        assert!(d.dependencies(2).is_empty());
        assert_eq!(dag(0).pop_vertex(), None);
    }

    #[test]
    fn test_unknown_vertex() {
        let mut d = dag(1);
        assert_eq!(d.add_edge(0, 5), Err(EdgeError::UnknownVertex(5)));
    }

    #[test]
    fn test_closures() {
        let mut d = dag(4);
        d.add_edge(1, 0).unwrap();
        d.add_edge(2, 1).unwrap();
        d.add_edge(3, 0).unwrap();
        assert_eq!(d.ancestors(2), BTreeSet::from([0, 1]));
        assert_eq!(d.descendants(0), BTreeSet::from([1, 2, 3]));
        assert!(d.descendants(2).is_empty());
    }
}
