//! Directed acyclic graph of actions with parallel topological iteration.
//!
//! The graph stores an opaque payload and a predecessor set per vertex and is
//! consumed by the scheduler through [`DagIterator`]:
//! - checked mutation keeps the graph acyclic (cycle attempts roll back),
//! - the iterator hands out vertices whose predecessors are all visited,
//! - busy-state iteration lets parallel workers claim a vertex, execute it,
//!   and release it with [`DagIterator::leave`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("vertex {0} already exists")]
    DuplicateVertex(String),
    #[error("unknown vertex {0}")]
    UnknownVertex(String),
    #[error("predecessors on non existing vertices: {0}")]
    MissingPredecessors(String),
    #[error("cycle detected (involving {0})")]
    CycleDetected(String),
    #[error("cannot prune {0}: it still carries a tag")]
    PrunedTag(String),
}

/// Dependency graph over string vertex ids with optional opaque payloads.
///
/// Edges point from a vertex to its predecessors (the vertices it depends
/// on). Payloads are never interpreted; tags are an opaque side channel used
/// by [`Dag::get_context`].
#[derive(Debug, Clone)]
pub struct Dag<D> {
    vertex_data: BTreeMap<String, Option<D>>,
    vertex_predecessors: BTreeMap<String, BTreeSet<String>>,
    tags: BTreeMap<String, Value>,
}

impl<D> Default for Dag<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Dag<D> {
    pub fn new() -> Self {
        Self {
            vertex_data: BTreeMap::new(),
            vertex_predecessors: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vertex_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_data.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vertex_data.contains_key(id)
    }

    /// Vertex ids in lexicographic order.
    pub fn vertices(&self) -> impl Iterator<Item = &str> {
        self.vertex_data.keys().map(String::as_str)
    }

    /// Payload of a vertex; `Ok(None)` when the vertex exists without data.
    pub fn data(&self, id: &str) -> Result<Option<&D>, DagError> {
        self.vertex_data
            .get(id)
            .map(Option::as_ref)
            .ok_or_else(|| DagError::UnknownVertex(id.to_string()))
    }

    pub fn get_predecessors(&self, id: &str) -> Result<&BTreeSet<String>, DagError> {
        self.vertex_predecessors
            .get(id)
            .ok_or_else(|| DagError::UnknownVertex(id.to_string()))
    }

    /// Add a new vertex. Fails on duplicate ids, missing predecessors, or a
    /// predecessor set that would close a cycle.
    pub fn add_vertex(
        &mut self,
        id: &str,
        data: Option<D>,
        predecessors: &[&str],
    ) -> Result<(), DagError> {
        if self.vertex_data.contains_key(id) {
            return Err(DagError::DuplicateVertex(id.to_string()));
        }
        self.update_vertex(id, data, predecessors)
    }

    /// Create the vertex or merge into it: predecessor sets are unioned and
    /// the payload is overwritten only when one is given.
    pub fn update_vertex(
        &mut self,
        id: &str,
        data: Option<D>,
        predecessors: &[&str],
    ) -> Result<(), DagError> {
        let missing: Vec<&str> = predecessors
            .iter()
            .copied()
            .filter(|p| !self.vertex_data.contains_key(*p))
            .collect();
        if !missing.is_empty() {
            return Err(DagError::MissingPredecessors(missing.join(", ")));
        }
        self.apply_update(id, data, predecessors, true)
    }

    /// Same as [`Dag::update_vertex`] without existence and cycle checks, for
    /// trusted construction paths. Run [`Dag::check`] afterwards when in
    /// doubt.
    pub fn update_vertex_unchecked(&mut self, id: &str, data: Option<D>, predecessors: &[&str]) {
        // Cannot fail with checks disabled.
        let _ = self.apply_update(id, data, predecessors, false);
    }

    fn apply_update(
        &mut self,
        id: &str,
        data: Option<D>,
        predecessors: &[&str],
        enable_checks: bool,
    ) -> Result<(), DagError> {
        let added: BTreeSet<String> = predecessors.iter().map(|p| p.to_string()).collect();

        let Some(previous) = self.vertex_predecessors.get(id).cloned() else {
            self.vertex_predecessors.insert(id.to_string(), added);
            self.vertex_data.insert(id.to_string(), data);
            return Ok(());
        };

        let merged: BTreeSet<String> = previous.union(&added).cloned().collect();
        self.vertex_predecessors.insert(id.to_string(), merged);

        if enable_checks && self.get_closure(id).is_err() {
            // Roll back so the graph stays valid.
            self.vertex_predecessors.insert(id.to_string(), previous);
            return Err(DagError::CycleDetected(id.to_string()));
        }

        if data.is_some() {
            self.vertex_data.insert(id.to_string(), data);
        }
        Ok(())
    }

    /// Transitive predecessor set of a vertex.
    ///
    /// Fails when the closure contains the vertex itself, which means the
    /// graph holds a cycle through it.
    pub fn get_closure(&self, id: &str) -> Result<BTreeSet<String>, DagError> {
        let start = self
            .vertex_predecessors
            .get(id)
            .ok_or_else(|| DagError::UnknownVertex(id.to_string()))?;

        let mut closure: BTreeSet<String> = start.clone();
        let mut frontier: Vec<String> = closure.iter().cloned().collect();
        while let Some(vertex) = frontier.pop() {
            if vertex == id {
                return Err(DagError::CycleDetected(id.to_string()));
            }
            if let Some(preds) = self.vertex_predecessors.get(&vertex) {
                for p in preds {
                    if closure.insert(p.clone()) {
                        frontier.push(p.clone());
                    }
                }
            }
        }
        Ok(closure)
    }

    /// Validate the whole graph: every referenced predecessor exists and the
    /// graph is acyclic. Meant for use after unchecked construction.
    pub fn check(&self) -> Result<(), DagError> {
        for (vertex, preds) in &self.vertex_predecessors {
            for p in preds {
                if !self.vertex_data.contains_key(p) {
                    return Err(DagError::MissingPredecessors(format!(
                        "{p} (referenced by {vertex})"
                    )));
                }
            }
        }
        let mut iterator = DagIterator::new(self, false);
        loop {
            match iterator.next_element() {
                NextVertex::Ready { .. } => continue,
                NextVertex::Exhausted => return Ok(()),
                NextVertex::Stalled => {
                    let blocked = iterator
                        .remaining()
                        .next()
                        .map(str::to_string)
                        .unwrap_or_default();
                    return Err(DagError::CycleDetected(blocked));
                }
            }
        }
    }

    fn successors(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (vertex, preds) in &self.vertex_predecessors {
            for p in preds {
                successors
                    .entry(p.as_str())
                    .or_default()
                    .push(vertex.as_str());
            }
        }
        successors
    }

    /// Shortest path from `source` to `target` following successor edges
    /// (BFS). `source == target` only resolves through a real cycle. Returns
    /// `None` when no path exists.
    pub fn shortest_path(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<Vec<String>>, DagError> {
        let src = self
            .vertex_data
            .get_key_value(source)
            .map(|(k, _)| k.as_str())
            .ok_or_else(|| DagError::UnknownVertex(source.to_string()))?;
        let dst = self
            .vertex_data
            .get_key_value(target)
            .map(|(k, _)| k.as_str())
            .ok_or_else(|| DagError::UnknownVertex(target.to_string()))?;

        let successors = self.successors();
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut visited: BTreeSet<&str> = BTreeSet::from([src]);
        let mut queue: VecDeque<&str> = VecDeque::from([src]);

        while let Some(vertex) = queue.pop_front() {
            let Some(nexts) = successors.get(vertex) else {
                continue;
            };
            for next in nexts {
                if *next == dst {
                    let mut path = vec![dst.to_string(), vertex.to_string()];
                    let mut cursor = vertex;
                    while let Some(p) = prev.get(cursor) {
                        path.push((*p).to_string());
                        cursor = *p;
                    }
                    path.reverse();
                    return Ok(Some(path));
                }
                if visited.insert(*next) {
                    prev.insert(*next, vertex);
                    queue.push_back(*next);
                }
            }
        }
        Ok(None)
    }

    /// New graph with every edge inverted. Tags and payloads are preserved.
    pub fn reverse_graph(&self) -> Result<Dag<D>, DagError>
    where
        D: Clone,
    {
        let mut result = Dag::new();
        for (vertex, data) in &self.vertex_data {
            result.vertex_data.insert(vertex.clone(), data.clone());
            result.vertex_predecessors.entry(vertex.clone()).or_default();
        }
        for (vertex, preds) in &self.vertex_predecessors {
            for p in preds {
                result
                    .vertex_predecessors
                    .entry(p.clone())
                    .or_default()
                    .insert(vertex.clone());
            }
        }
        result.tags = self.tags.clone();
        // The reverse of a corrupted graph is just as cyclic.
        result.check()?;
        Ok(result)
    }

    /// Union of two graphs: vertices and predecessor sets are merged, the
    /// payload from `self` wins on conflict, and cycle checks apply.
    pub fn merge(&self, other: &Dag<D>) -> Result<Dag<D>, DagError>
    where
        D: Clone,
    {
        let mut result: Dag<D> = Dag::new();

        // Vertices first so that predecessor references always resolve.
        for id in self.vertex_data.keys().chain(other.vertex_data.keys()) {
            if !result.contains(id) {
                result
                    .vertex_predecessors
                    .insert(id.clone(), BTreeSet::new());
                result.vertex_data.insert(id.clone(), None);
            }
        }

        // Predecessors from both sides; self's payload is applied last so it
        // wins when both sides carry one.
        for (id, preds) in &other.vertex_predecessors {
            let preds: Vec<&str> = preds.iter().map(String::as_str).collect();
            result.apply_update(id, other.vertex_data[id].clone(), &preds, true)?;
        }
        for (id, preds) in &self.vertex_predecessors {
            let preds: Vec<&str> = preds.iter().map(String::as_str).collect();
            result.apply_update(id, self.vertex_data[id].clone(), &preds, true)?;
        }

        for (id, tag) in &other.tags {
            result.tags.insert(id.clone(), tag.clone());
        }
        for (id, tag) in &self.tags {
            result.tags.insert(id.clone(), tag.clone());
        }
        Ok(result)
    }

    /// Drop every vertex for which `predicate` holds, reconnecting its
    /// predecessors to its successors so reachability is preserved.
    ///
    /// With `preserve_context` set, pruning a tagged vertex is an error:
    /// dropping it would silently lose context for [`Dag::get_context`].
    pub fn prune<F>(&self, predicate: F, preserve_context: bool) -> Result<Dag<D>, DagError>
    where
        D: Clone,
        F: Fn(&Dag<D>, &str) -> bool,
    {
        let mut result = Dag::new();
        // Effective predecessor sets of pruned vertices, resolved in
        // topological order so chains of pruned vertices collapse.
        let mut replaced: HashMap<String, BTreeSet<String>> = HashMap::new();

        let mut iterator = DagIterator::new(self, false);
        loop {
            match iterator.next_element() {
                NextVertex::Exhausted => break,
                NextVertex::Stalled => {
                    let blocked = iterator
                        .remaining()
                        .next()
                        .map(str::to_string)
                        .unwrap_or_default();
                    return Err(DagError::CycleDetected(blocked));
                }
                NextVertex::Ready {
                    id,
                    data,
                    predecessors,
                } => {
                    let mut preds = BTreeSet::new();
                    for p in predecessors {
                        match replaced.get(p.as_str()) {
                            Some(resolved) => preds.extend(resolved.iter().cloned()),
                            None => {
                                preds.insert(p.clone());
                            }
                        }
                    }
                    if predicate(self, id) {
                        if preserve_context && self.tags.contains_key(id) {
                            return Err(DagError::PrunedTag(id.to_string()));
                        }
                        replaced.insert(id.to_string(), preds);
                    } else {
                        result.vertex_data.insert(id.to_string(), data.cloned());
                        result.vertex_predecessors.insert(id.to_string(), preds);
                        if let Some(tag) = self.tags.get(id) {
                            result.tags.insert(id.to_string(), tag.clone());
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Attach an opaque tag to a vertex, replacing any previous one.
    pub fn add_tag(&mut self, id: &str, data: Value) -> Result<(), DagError> {
        if !self.contains(id) {
            return Err(DagError::UnknownVertex(id.to_string()));
        }
        self.tags.insert(id.to_string(), data);
        Ok(())
    }

    pub fn get_tag(&self, id: &str) -> Option<&Value> {
        self.tags.get(id)
    }

    /// Tags reachable from a vertex, as `(distance, vertex, tag)` sorted by
    /// distance. Walks predecessors, or successors with `reverse` set. A
    /// tagged vertex is reported and its own ancestors are not explored.
    pub fn get_context(
        &self,
        id: &str,
        reverse: bool,
        max_distance: Option<usize>,
        max_elements: Option<usize>,
    ) -> Result<Vec<(usize, String, Value)>, DagError> {
        if !self.contains(id) {
            return Err(DagError::UnknownVertex(id.to_string()));
        }
        // A corrupted graph would make the walk below loop forever.
        self.check()?;

        let successors = if reverse { Some(self.successors()) } else { None };
        let neighbors = |vertex: &str| -> Vec<String> {
            match &successors {
                Some(map) => map
                    .get(vertex)
                    .map(|s| s.iter().map(|v| v.to_string()).collect())
                    .unwrap_or_default(),
                None => self
                    .vertex_predecessors
                    .get(vertex)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            }
        };

        let limit = max_elements.unwrap_or(usize::MAX);
        let mut context = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::from([id.to_string()]);
        let mut frontier: Vec<String> = vec![id.to_string()];
        let mut distance = 0usize;

        while !frontier.is_empty() && max_distance.is_none_or(|max| distance <= max) {
            let mut next = Vec::new();
            for vertex in &frontier {
                if let Some(tag) = self.tags.get(vertex) {
                    if context.len() >= limit {
                        return Ok(context);
                    }
                    context.push((distance, vertex.clone(), tag.clone()));
                } else {
                    for neighbor in neighbors(vertex) {
                        if visited.insert(neighbor.clone()) {
                            next.push(neighbor);
                        }
                    }
                }
            }
            frontier = next;
            distance += 1;
        }
        Ok(context)
    }

    /// Graphviz rendering of the graph. Edges point at predecessors.
    pub fn as_dot(&self) -> String {
        let mut lines = vec!["digraph G {".to_string(), "rankdir=\"LR\";".to_string()];
        for vertex in self.vertex_data.keys() {
            lines.push(format!("\"{vertex}\""));
        }
        for (vertex, preds) in &self.vertex_predecessors {
            for p in preds {
                lines.push(format!("\"{vertex}\" -> \"{p}\""));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

impl<D> fmt::Display for Dag<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (vertex, preds) in &self.vertex_predecessors {
            if preds.is_empty() {
                writeln!(f, "{vertex} -> (none)")?;
            } else {
                let joined = preds.iter().cloned().collect::<Vec<_>>().join(", ");
                writeln!(f, "{vertex} -> {joined}")?;
            }
        }
        Ok(())
    }
}

/// Per-vertex state during one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitState {
    NotVisited,
    /// Claimed by a worker; successors stay blocked until `leave`.
    Busy,
    Visited,
}

/// Outcome of one [`DagIterator::next_element`] call.
#[derive(Debug)]
pub enum NextVertex<'a, D> {
    /// A vertex whose predecessors are all visited.
    Ready {
        id: &'a str,
        data: Option<&'a D>,
        predecessors: &'a BTreeSet<String>,
    },
    /// Nothing is ready right now, but unvisited vertices remain (they are
    /// blocked on busy vertices, or on a cycle in an unchecked graph).
    Stalled,
    /// Every vertex has been visited.
    Exhausted,
}

/// Topological iterator over a frozen [`Dag`].
///
/// Without busy state, `next_element` marks the returned vertex visited
/// immediately. With busy state enabled, the vertex is only reserved and the
/// caller must invoke [`DagIterator::leave`] once its work completed;
/// successors become ready only after that.
pub struct DagIterator<'a, D> {
    dag: &'a Dag<D>,
    states: HashMap<&'a str, VisitState>,
    non_visited: BTreeSet<&'a str>,
    enable_busy_state: bool,
}

impl<'a, D> DagIterator<'a, D> {
    pub fn new(dag: &'a Dag<D>, enable_busy_state: bool) -> Self {
        Self {
            dag,
            states: dag
                .vertex_data
                .keys()
                .map(|k| (k.as_str(), VisitState::NotVisited))
                .collect(),
            non_visited: dag.vertex_data.keys().map(String::as_str).collect(),
            enable_busy_state,
        }
    }

    pub fn next_element(&mut self) -> NextVertex<'a, D> {
        if self.non_visited.is_empty() {
            return NextVertex::Exhausted;
        }

        let dag = self.dag;
        let states = &self.states;
        let ready = self.non_visited.iter().copied().find(|id| {
            dag.vertex_predecessors.get(*id).is_none_or(|preds| {
                preds
                    .iter()
                    .all(|p| states.get(p.as_str()).copied() == Some(VisitState::Visited))
            })
        });

        match ready {
            None => NextVertex::Stalled,
            Some(id) => {
                let state = if self.enable_busy_state {
                    VisitState::Busy
                } else {
                    VisitState::Visited
                };
                self.states.insert(id, state);
                self.non_visited.remove(id);
                NextVertex::Ready {
                    id,
                    data: self.dag.vertex_data[id].as_ref(),
                    predecessors: &self.dag.vertex_predecessors[id],
                }
            }
        }
    }

    /// Switch a vertex from busy to visited, unblocking its successors.
    ///
    /// Panics when the vertex is not in busy state; that is a caller bug.
    pub fn leave(&mut self, id: &str) {
        let Some(state) = self.states.get_mut(id) else {
            panic!("leave called on unknown vertex {id}");
        };
        assert_eq!(
            *state,
            VisitState::Busy,
            "leave called on vertex {id} not in busy state"
        );
        *state = VisitState::Visited;
    }

    /// Vertices not yet visited (nor busy).
    pub fn remaining(&self) -> impl Iterator<Item = &str> {
        self.non_visited.iter().copied()
    }
}

impl<'a, D> Iterator for DagIterator<'a, D> {
    type Item = (&'a str, Option<&'a D>);

    /// Plain (non-busy) iteration; stops on exhaustion or on a stall, which
    /// without busy state can only mean a cycle.
    fn next(&mut self) -> Option<Self::Item> {
        match self.next_element() {
            NextVertex::Ready { id, data, .. } => Some((id, data)),
            NextVertex::Stalled | NextVertex::Exhausted => None,
        }
    }
}
