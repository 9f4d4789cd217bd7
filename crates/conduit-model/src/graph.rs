use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::connection::{ConnectionSource, StageConnection};

/// Graph view of a canvas, built from its stage connections.
///
/// Nodes are event sources and stages. Every edge ends at a stage.
#[derive(Debug, Clone, Default)]
pub struct CanvasGraph {
  /// Adjacency list: source -> stages it feeds.
  adjacency: BTreeMap<ConnectionSource, Vec<Uuid>>,
  /// Reverse adjacency: stage -> sources feeding it.
  reverse_adjacency: BTreeMap<Uuid, Vec<ConnectionSource>>,
}

impl CanvasGraph {
  /// Build a graph from the stages of a canvas and all their connections.
  pub fn new<'a>(
    stages: impl IntoIterator<Item = Uuid>,
    connections: impl IntoIterator<Item = &'a StageConnection>,
  ) -> Self {
    let mut graph = Self::default();

    for stage_id in stages {
      graph.add_stage(stage_id);
    }
    for connection in connections {
      graph.add_edge(connection.source, connection.stage_id);
    }

    graph
  }

  pub fn add_stage(&mut self, stage_id: Uuid) {
    self
      .adjacency
      .entry(ConnectionSource::Stage(stage_id))
      .or_default();
    self.reverse_adjacency.entry(stage_id).or_default();
  }

  pub fn add_edge(&mut self, source: ConnectionSource, stage_id: Uuid) {
    self.add_stage(stage_id);
    let targets = self.adjacency.entry(source).or_default();
    if !targets.contains(&stage_id) {
      targets.push(stage_id);
      targets.sort();
    }
    let sources = self.reverse_adjacency.entry(stage_id).or_default();
    if !sources.contains(&source) {
      sources.push(source);
      sources.sort();
    }
  }

  /// Replace every inbound edge of `stage_id`.
  pub fn replace_inbound(&mut self, stage_id: Uuid, sources: impl IntoIterator<Item = ConnectionSource>) {
    if let Some(previous) = self.reverse_adjacency.remove(&stage_id) {
      for source in previous {
        if let Some(targets) = self.adjacency.get_mut(&source) {
          targets.retain(|id| *id != stage_id);
        }
      }
    }
    self.add_stage(stage_id);
    for source in sources {
      self.add_edge(source, stage_id);
    }
  }

  /// Stages with no inbound connections.
  pub fn entry_points(&self) -> Vec<Uuid> {
    self
      .reverse_adjacency
      .iter()
      .filter(|(_, sources)| sources.is_empty())
      .map(|(id, _)| *id)
      .collect()
  }

  /// Stages fed by `source`.
  pub fn downstream(&self, source: &ConnectionSource) -> &[Uuid] {
    self
      .adjacency
      .get(source)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Sources feeding `stage_id`.
  pub fn upstream(&self, stage_id: Uuid) -> &[ConnectionSource] {
    self
      .reverse_adjacency
      .get(&stage_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// First stage cycle found, as the stage ids along it. The first id is
  /// repeated at the end.
  pub fn find_cycle(&self) -> Option<Vec<Uuid>> {
    let mut done = BTreeSet::new();

    for &start in self.reverse_adjacency.keys() {
      if done.contains(&start) {
        continue;
      }
      let mut path = Vec::new();
      let mut on_path = BTreeSet::new();
      if let Some(cycle) = self.visit(start, &mut path, &mut on_path, &mut done) {
        return Some(cycle);
      }
    }

    None
  }

  pub fn is_acyclic(&self) -> bool {
    self.find_cycle().is_none()
  }

  fn visit(
    &self,
    stage_id: Uuid,
    path: &mut Vec<Uuid>,
    on_path: &mut BTreeSet<Uuid>,
    done: &mut BTreeSet<Uuid>,
  ) -> Option<Vec<Uuid>> {
    if on_path.contains(&stage_id) {
      let start = path.iter().position(|id| *id == stage_id).unwrap_or(0);
      let mut cycle = path[start..].to_vec();
      cycle.push(stage_id);
      return Some(cycle);
    }
    if done.contains(&stage_id) {
      return None;
    }

    path.push(stage_id);
    on_path.insert(stage_id);

    for &next in self.downstream(&ConnectionSource::Stage(stage_id)) {
      if let Some(cycle) = self.visit(next, path, on_path, done) {
        return Some(cycle);
      }
    }

    path.pop();
    on_path.remove(&stage_id);
    done.insert(stage_id);
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::NewConnection;

  fn ids(n: usize) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
    ids.sort();
    ids
  }

  fn edge(source: ConnectionSource, stage_id: Uuid) -> StageConnection {
    NewConnection::new(source.source_type(), "src").into_connection(stage_id, source.id())
  }

  #[test]
  fn test_linear_canvas() {
    let source = ConnectionSource::EventSource(Uuid::new_v4());
    let stages = ids(2);
    let connections = vec![
      edge(source, stages[0]),
      edge(ConnectionSource::Stage(stages[0]), stages[1]),
    ];
    let graph = CanvasGraph::new(stages.clone(), &connections);

    assert_eq!(graph.downstream(&source), &[stages[0]]);
    assert_eq!(graph.upstream(stages[1]), &[ConnectionSource::Stage(stages[0])]);
    assert!(graph.entry_points().is_empty());
    assert!(graph.is_acyclic());
  }

  #[test]
  fn test_entry_points() {
    let stages = ids(3);
    let connections = vec![edge(ConnectionSource::Stage(stages[0]), stages[2])];
    let graph = CanvasGraph::new(stages.clone(), &connections);

    assert_eq!(graph.entry_points(), vec![stages[0], stages[1]]);
  }

  #[test]
  fn test_cycle_detection() {
    let stages = ids(3);
    let connections = vec![
      edge(ConnectionSource::Stage(stages[0]), stages[1]),
      edge(ConnectionSource::Stage(stages[1]), stages[2]),
      edge(ConnectionSource::Stage(stages[2]), stages[0]),
    ];
    let graph = CanvasGraph::new(stages.clone(), &connections);

    let cycle = graph.find_cycle().unwrap();
    assert_eq!(cycle.len(), 4);
    assert_eq!(cycle.first(), cycle.last());
  }

  #[test]
  fn test_replace_inbound() {
    let stages = ids(2);
    let mut graph = CanvasGraph::new(
      stages.clone(),
      &[edge(ConnectionSource::Stage(stages[0]), stages[1])],
    );

    graph.replace_inbound(stages[0], [ConnectionSource::Stage(stages[1])]);
    assert!(!graph.is_acyclic());

    graph.replace_inbound(stages[0], std::iter::empty());
    assert!(graph.is_acyclic());
    assert_eq!(graph.entry_points(), vec![stages[0]]);
  }
}
