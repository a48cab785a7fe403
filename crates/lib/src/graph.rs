//! The package dependency DAG.
//!
//! Vertices are packages, edges run from a dependency to its dependent.
//! The scheduler asks for in-degree-zero vertices (`ready`), deletes
//! vertices as packages finish, and falls back to a strongly-connected
//! component query when it cannot make progress.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use thiserror::Error;

use crate::package::Package;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("dependency cycle detected involving: {}", packages.join(", "))]
  Cycle { packages: Vec<String> },
}

type PackageKey = (String, String);

fn key_of(package: &Package) -> PackageKey {
  (package.ns().name().to_string(), package.name().to_string())
}

/// Dependency DAG over shared package handles.
#[derive(Debug, Default)]
pub struct DepGraph {
  graph: StableDiGraph<Arc<Package>, ()>,
  nodes: HashMap<PackageKey, NodeIndex>,
}

impl DepGraph {
  /// Build the graph from the packages reachable from `base`.
  pub fn fill(base: &Arc<Package>) -> Self {
    let mut graph = Self::default();

    let mut stack = vec![base.clone()];
    let mut seen: HashSet<PackageKey> = HashSet::new();
    while let Some(package) = stack.pop() {
      if !seen.insert(key_of(&package)) {
        continue;
      }
      graph.add_node(&package);
      for dep in package.depends_snapshot() {
        stack.push(dep.package().clone());
      }
    }

    // Edges from dependency to dependent.
    let packages: Vec<Arc<Package>> = graph.graph.node_weights().cloned().collect();
    for package in packages {
      let to = graph.nodes[&key_of(&package)];
      for dep in package.depends_snapshot() {
        let from = graph.nodes[&key_of(dep.package())];
        graph.graph.add_edge(from, to, ());
      }
    }
    graph
  }

  fn add_node(&mut self, package: &Arc<Package>) {
    let idx = self.graph.add_node(package.clone());
    self.nodes.insert(key_of(package), idx);
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  /// Fail on any dependency loop, naming the packages involved.
  pub fn check_for_dependency_loops(&self) -> Result<(), GraphError> {
    if toposort(&self.graph, None).is_ok() {
      return Ok(());
    }
    Err(GraphError::Cycle {
      packages: self.cycled_packages(),
    })
  }

  /// A topological ordering: every dependency precedes its dependents.
  pub fn topological(&self) -> Result<Vec<Arc<Package>>, GraphError> {
    let order = toposort(&self.graph, None).map_err(|_| GraphError::Cycle {
      packages: self.cycled_packages(),
    })?;
    Ok(order.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }

  /// Packages with no remaining dependencies in the graph.
  pub fn ready(&self) -> Vec<Arc<Package>> {
    self
      .graph
      .node_indices()
      .filter(|&idx| self.graph.neighbors_directed(idx, Direction::Incoming).next().is_none())
      .map(|idx| self.graph[idx].clone())
      .collect()
  }

  /// Remove a finished package, unblocking its dependents.
  pub fn delete_node(&mut self, package: &Package) {
    if let Some(idx) = self.nodes.remove(&key_of(package)) {
      self.graph.remove_node(idx);
    }
  }

  /// Names of the packages sitting on cycles. The scheduler's safety
  /// net when no vertex is ready and nothing is running.
  pub fn cycled_packages(&self) -> Vec<String> {
    let mut names: Vec<String> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .flatten()
      .map(|idx| self.graph[idx].name().to_string())
      .collect();
    names.sort();
    names
  }

  /// Dump the graph to `dependencies.dot` for inspection.
  pub fn output_dot(&self, path: &Path) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "digraph dependencies {{")?;
    for idx in self.graph.node_indices() {
      let p = &self.graph[idx];
      writeln!(
        file,
        "  n{} [label=\"{}\\nCmds:{}\\nSecs:{}\"];",
        idx.index(),
        p.name(),
        p.command_count(),
        p.run_secs()
      )?;
    }
    for edge in self.graph.edge_indices() {
      if let Some((from, to)) = self.graph.edge_endpoints(edge) {
        writeln!(file, "  n{} -> n{};", from.index(), to.index())?;
      }
    }
    writeln!(file, "}}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::namespace::NameSpace;
  use crate::package::Depend;
  use tempfile::TempDir;

  fn chain(top: &TempDir) -> (Arc<Package>, Arc<Package>, Arc<Package>) {
    let ns = NameSpace::new("ns");
    let a = ns.register(Package::new(ns.clone(), "a", top.path(), None));
    let b = ns.register(Package::new(ns.clone(), "b", top.path(), None));
    let c = ns.register(Package::new(ns.clone(), "c", top.path(), None));
    // a depends on b, b depends on c
    a.depend(Depend::new(b.clone(), false));
    b.depend(Depend::new(c.clone(), false));
    (a, b, c)
  }

  #[test]
  fn ready_tracks_remaining_dependencies() {
    let top = TempDir::new().unwrap();
    let (a, b, c) = chain(&top);
    let mut graph = DepGraph::fill(&a);
    assert_eq!(graph.len(), 3);

    let ready: Vec<String> = graph.ready().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(ready, vec!["c"]);

    graph.delete_node(&c);
    let ready: Vec<String> = graph.ready().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(ready, vec!["b"]);

    graph.delete_node(&b);
    graph.delete_node(&a);
    assert!(graph.is_empty());
  }

  #[test]
  fn topological_puts_dependencies_first() {
    let top = TempDir::new().unwrap();
    let (a, _, _) = chain(&top);
    let graph = DepGraph::fill(&a);

    let sorted = graph.topological().unwrap();
    let order: Vec<&str> = sorted.iter().map(|p| p.name()).collect();
    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(pos("c") < pos("b"));
    assert!(pos("b") < pos("a"));
  }

  #[test]
  fn diamond_dedups_shared_dependency() {
    let top = TempDir::new().unwrap();
    let ns = NameSpace::new("ns");
    let a = ns.register(Package::new(ns.clone(), "a", top.path(), None));
    let b = ns.register(Package::new(ns.clone(), "b", top.path(), None));
    let c = ns.register(Package::new(ns.clone(), "c", top.path(), None));
    let d = ns.register(Package::new(ns.clone(), "d", top.path(), None));
    a.depend(Depend::new(b.clone(), false));
    a.depend(Depend::new(c.clone(), false));
    b.depend(Depend::new(d.clone(), false));
    c.depend(Depend::new(d.clone(), false));

    let graph = DepGraph::fill(&a);
    assert_eq!(graph.len(), 4);

    let ready: Vec<String> = graph.ready().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(ready, vec!["d"]);
  }

  #[test]
  fn cycles_are_detected_and_named() {
    let top = TempDir::new().unwrap();
    let ns = NameSpace::new("ns");
    let a = ns.register(Package::new(ns.clone(), "a", top.path(), None));
    let b = ns.register(Package::new(ns.clone(), "b", top.path(), None));
    a.depend(Depend::new(b.clone(), false));
    b.depend(Depend::new(a.clone(), false));

    let graph = DepGraph::fill(&a);
    let err = graph.check_for_dependency_loops().unwrap_err();
    let GraphError::Cycle { packages } = err;
    assert_eq!(packages, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn acyclic_graph_passes_the_loop_check() {
    let top = TempDir::new().unwrap();
    let (a, _, _) = chain(&top);
    DepGraph::fill(&a).check_for_dependency_loops().unwrap();
  }
}
