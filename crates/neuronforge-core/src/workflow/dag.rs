//! Step dependency graph, validation, and parallel batch computation.
//!
//! Uses `petgraph` to model dependencies as a directed graph with edges
//! pointing from a dependency to its dependent. Edges come from declared
//! `depends_on`, from `{{stepId...}}` references, and from conditional
//! branch membership (conditional -> branch step).
//!
//! Validation collects every problem instead of stopping at the first:
//!
//! 1. Duplicate ids, and ids that shadow the `input` or `loop` bindings,
//!    abort before any graph analysis.
//! 2. Unknown dependency targets and forward references are recorded.
//! 3. A coloured DFS records the full path of every cycle.
//! 4. Without cycles, Kahn's algorithm (declaration order breaks ties)
//!    gives the execution order, longest-path depths give the batches, and
//!    the longest chain is the critical path.

use std::collections::{BTreeSet, HashMap, HashSet};

use neuronforge_types::step::{Step, StepKind};
use neuronforge_types::validation::{DagValidationResult, ParallelBatch, ValidationIssue};
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};

use super::reference::{is_reserved, step_references, supports_implicit_iteration};

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// Dependency graph over one step list. Node indices equal declaration
/// positions.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    issues: Vec<ValidationIssue>,
    warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl StepGraph {
    /// Build the graph for `steps`. Ids in `external_ids` (and the reserved
    /// bindings) may be referenced without being part of the list.
    ///
    /// Returns the id errors when any id repeats or names a reserved binding.
    pub fn build(steps: &[Step], external_ids: &HashSet<String>) -> Result<Self, Vec<ValidationIssue>> {
        let mut seen = HashSet::new();
        let mut rejected: Vec<ValidationIssue> = Vec::new();
        for step in steps {
            let issue = if is_reserved(&step.id) {
                ValidationIssue::ReservedStepId { step_id: step.id.clone() }
            } else if !seen.insert(step.id.as_str()) {
                ValidationIssue::DuplicateStepId { step_id: step.id.clone() }
            } else {
                continue;
            };
            if !rejected.contains(&issue) {
                rejected.push(issue);
            }
        }
        if !rejected.is_empty() {
            return Err(rejected);
        }

        let mut graph = DiGraph::<String, ()>::with_capacity(steps.len(), steps.len());
        let index: HashMap<String, NodeIndex> = steps
            .iter()
            .map(|s| (s.id.clone(), graph.add_node(s.id.clone())))
            .collect();

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let is_external = |id: &str| is_reserved(id) || external_ids.contains(id);

        let missing = |issues: &mut Vec<ValidationIssue>, step_id: &str, dependency: &str| {
            let issue = ValidationIssue::MissingDependency {
                step_id: step_id.to_string(),
                dependency: dependency.to_string(),
            };
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        };

        for (position, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if is_external(dep) {
                    continue;
                }
                match index.get(dep) {
                    Some(from) => {
                        edges.insert((from.index(), position));
                    }
                    None => missing(&mut issues, &step.id, dep),
                }
            }

            let refs = step_references(step);
            for reference in &refs {
                if is_external(&reference.step_id) {
                    continue;
                }
                match index.get(&reference.step_id) {
                    None => missing(&mut issues, &step.id, &reference.step_id),
                    Some(from) if from.index() >= position => {
                        let issue = ValidationIssue::ForwardReference {
                            step_id: step.id.clone(),
                            reference: reference.step_id.clone(),
                        };
                        if !issues.contains(&issue) {
                            issues.push(issue);
                        }
                    }
                    Some(from) => {
                        edges.insert((from.index(), position));
                    }
                }
            }

            if supports_implicit_iteration(&step.kind) {
                if let Some(array_ref) = refs.iter().find(|r| r.iterates()) {
                    warnings.push(format!(
                        "step '{}' runs once per element of '{{{{{}}}}}'",
                        step.id, array_ref.raw
                    ));
                }
            }

            if let StepKind::Conditional { true_branch, false_branch, .. } = &step.kind {
                for branch in true_branch.iter().chain(false_branch) {
                    match index.get(branch) {
                        Some(to) => {
                            edges.insert((position, to.index()));
                        }
                        None => missing(&mut issues, &step.id, branch),
                    }
                }
            }
        }

        for (from, to) in edges {
            graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
        }

        if steps.len() > 1 {
            for node in graph.node_indices() {
                let connected = graph.neighbors_undirected(node).next().is_some();
                if !connected {
                    warnings.push(format!(
                        "step '{}' is disconnected from the rest of the workflow",
                        graph[node]
                    ));
                }
            }
        }

        Ok(Self {
            graph,
            index,
            issues,
            warnings,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Missing-dependency and forward-reference problems found while building.
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn id(&self, idx: usize) -> String {
        self.graph[NodeIndex::new(idx)].clone()
    }

    fn sorted_neighbors(&self, idx: usize, dir: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(idx), dir)
            .map(|n| n.index())
            .collect();
        out.sort_unstable();
        out
    }

    // -----------------------------------------------------------------------
    // Cycles
    // -----------------------------------------------------------------------

    /// Every cycle reachable by DFS in declaration order. Each path starts
    /// and ends with the same id.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let n = self.len();
        let mut color = vec![Color::White; n];
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for start in 0..n {
            if color[start] == Color::White {
                self.visit(start, &mut color, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    /// Iterative DFS from `start`. `stack` holds the current gray path; each
    /// frame keeps the neighbors still to visit.
    fn visit(&self, start: usize, color: &mut [Color], stack: &mut Vec<usize>, cycles: &mut Vec<Vec<String>>) {
        let mut frames = vec![(start, self.sorted_neighbors(start, Direction::Outgoing).into_iter())];
        color[start] = Color::Gray;
        stack.push(start);

        while let Some((node, neighbors)) = frames.last_mut() {
            let node = *node;
            let Some(next) = neighbors.next() else {
                frames.pop();
                stack.pop();
                color[node] = Color::Black;
                continue;
            };
            match color[next] {
                Color::White => {
                    color[next] = Color::Gray;
                    stack.push(next);
                    frames.push((next, self.sorted_neighbors(next, Direction::Outgoing).into_iter()));
                }
                Color::Gray => {
                    if let Some(pos) = stack.iter().position(|&s| s == next) {
                        let mut path: Vec<String> = stack[pos..].iter().map(|&i| self.id(i)).collect();
                        path.push(self.id(next));
                        cycles.push(path);
                    }
                }
                Color::Black => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Kahn's algorithm, always taking the earliest-declared ready step.
    /// `None` when the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        self.topological_indices()
            .map(|order| order.into_iter().map(|i| self.id(i)).collect())
    }

    fn topological_indices(&self) -> Option<Vec<usize>> {
        let n = self.len();
        let mut in_degree: Vec<usize> = (0..n)
            .map(|i| self.graph.neighbors_directed(NodeIndex::new(i), Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for next in self.sorted_neighbors(node, Direction::Outgoing) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        (order.len() == n).then_some(order)
    }

    /// Longest-path depth of every node, by declaration index.
    fn depths(&self) -> Option<Vec<usize>> {
        let order = self.topological_indices()?;
        let mut depth = vec![0usize; self.len()];
        for node in order {
            depth[node] = self
                .sorted_neighbors(node, Direction::Incoming)
                .into_iter()
                .map(|p| depth[p] + 1)
                .max()
                .unwrap_or(0);
        }
        Some(depth)
    }

    /// Steps grouped by depth. Every dependency of a step in batch `k` lies
    /// in a batch before `k`.
    pub fn batches(&self) -> Option<Vec<ParallelBatch>> {
        let depth = self.depths()?;
        let levels = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut batches: Vec<ParallelBatch> = (0..levels)
            .map(|batch_number| ParallelBatch {
                batch_number,
                steps: Vec::new(),
            })
            .collect();
        for (node, d) in depth.into_iter().enumerate() {
            batches[d].steps.push(self.id(node));
        }
        Some(batches)
    }

    /// Longest chain by step count; ties go to the chain discovered first.
    pub fn critical_path(&self) -> Option<Vec<String>> {
        let order = self.topological_indices()?;
        let n = self.len();
        let mut length = vec![1usize; n];
        let mut previous: Vec<Option<usize>> = vec![None; n];

        for &node in &order {
            for pred in self.sorted_neighbors(node, Direction::Incoming) {
                if length[pred] + 1 > length[node] {
                    length[node] = length[pred] + 1;
                    previous[node] = Some(pred);
                }
            }
        }

        let mut end = None;
        for &node in &order {
            if end.is_none_or(|e: usize| length[node] > length[e]) {
                end = Some(node);
            }
        }

        let mut path = Vec::new();
        let mut cursor = end;
        while let Some(node) = cursor {
            path.push(self.id(node));
            cursor = previous[node];
        }
        path.reverse();
        Some(path)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Steps with two or more incoming edges.
    pub fn merge_points(&self) -> Vec<String> {
        (0..self.len())
            .filter(|&i| self.graph.neighbors_directed(NodeIndex::new(i), Direction::Incoming).count() >= 2)
            .map(|i| self.id(i))
            .collect()
    }

    /// Whether `step` transitively depends on `dependency`.
    pub fn depends_on(&self, step: &str, dependency: &str) -> bool {
        match (self.index.get(step), self.index.get(dependency)) {
            (Some(&to), Some(&from)) if to != from => has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }

    /// Transitive dependencies, in declaration order.
    pub fn ancestors(&self, step: &str) -> Vec<String> {
        let Some(&start) = self.index.get(step) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                found.push(node.index());
            }
        }
        found.sort_unstable();
        found.into_iter().map(|i| self.id(i)).collect()
    }

    /// Transitive dependents, in declaration order.
    pub fn descendants(&self, step: &str) -> Vec<String> {
        let Some(&start) = self.index.get(step) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.push(node.index());
            }
        }
        found.sort_unstable();
        found.into_iter().map(|i| self.id(i)).collect()
    }

    /// Steps without dependencies.
    pub fn root_nodes(&self) -> Vec<String> {
        (0..self.len())
            .filter(|&i| self.sorted_neighbors(i, Direction::Incoming).is_empty())
            .map(|i| self.id(i))
            .collect()
    }

    /// Steps nothing depends on.
    pub fn leaf_nodes(&self) -> Vec<String> {
        (0..self.len())
            .filter(|&i| self.sorted_neighbors(i, Direction::Outgoing).is_empty())
            .map(|i| self.id(i))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a top-level step list.
pub fn validate_dag(steps: &[Step]) -> DagValidationResult {
    validate_dag_with(steps, &HashSet::new())
}

/// Validate a step list whose references may also point at `external_ids`
/// (used for loop and scatter-gather bodies).
pub fn validate_dag_with(steps: &[Step], external_ids: &HashSet<String>) -> DagValidationResult {
    let graph = match StepGraph::build(steps, external_ids) {
        Ok(graph) => graph,
        Err(errors) => {
            return DagValidationResult {
                is_valid: false,
                errors,
                ..Default::default()
            };
        }
    };

    let mut errors = graph.issues().to_vec();
    let cycles = graph.find_cycles();
    let has_cycles = !cycles.is_empty();
    errors.extend(
        cycles
            .iter()
            .map(|path| ValidationIssue::CycleDetected { path: path.clone() }),
    );

    let (execution_order, batches, critical_path) = if has_cycles {
        (None, None, None)
    } else {
        (graph.topological_order(), graph.batches(), graph.critical_path())
    };

    DagValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings: graph.warnings().to_vec(),
        has_cycles,
        cycles: has_cycles.then_some(cycles),
        merge_points: Some(graph.merge_points()),
        execution_order,
        max_depth: batches.as_ref().map(Vec::len),
        parallelization_opportunities: batches,
        critical_path,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
