//! Dependency graph for chain nodes.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::TaskId;

/// DFS colouring used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

/// Dependency graph for tracking task dependencies.
///
/// This graph maintains both forward and reverse edges for efficient lookups:
/// - `edges`: TaskId -> Set of TaskIds it depends on
/// - `reverse_edges`: TaskId -> Set of TaskIds waiting for it
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Every node, in insertion order.
    nodes: Vec<TaskId>,

    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-adding an existing node is a no-op.
    pub fn add_node(&mut self, task: TaskId) {
        if !self.nodes.contains(&task) {
            self.nodes.push(task);
        }
    }

    pub fn nodes(&self) -> &[TaskId] {
        &self.nodes
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.add_node(task);
        self.add_node(depends_on);
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Tasks waiting directly on `completed_task`.
    ///
    /// Note: This returns ALL tasks waiting for `completed_task`, even if they
    /// have other dependencies. The caller must check if all dependencies are resolved.
    pub fn get_waiting_tasks(&self, completed_task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&completed_task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependency_count(&self, task: TaskId) -> usize {
        self.edges.get(&task).map_or(0, HashSet::len)
    }

    /// Nodes without dependencies, in insertion order.
    pub fn roots(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .copied()
            .filter(|t| !self.has_dependencies(*t))
            .collect()
    }

    /// Every task that (directly or indirectly) waits on `task`, in BFS order.
    pub fn transitive_dependents(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut frontier = VecDeque::from([task]);
        while let Some(next) = frontier.pop_front() {
            for waiting in self.get_waiting_tasks(next) {
                if waiting != task && seen.insert(waiting) {
                    order.push(waiting);
                    frontier.push_back(waiting);
                }
            }
        }
        order
    }

    /// Detect a cycle in the dependency graph.
    ///
    /// Returns the first cycle found as a closed path (`[a, b, ..., a]`), or
    /// `None` if the graph is a DAG. Colour-marking DFS over forward edges:
    /// meeting a Gray node means the current path loops back onto itself.
    /// O(V + E).
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<TaskId, Color> =
            self.nodes.iter().map(|t| (*t, Color::White)).collect();
        let mut path = Vec::new();
        for &start in &self.nodes {
            if colors.get(&start) == Some(&Color::White)
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        let mut deps = self.get_dependencies(node);
        deps.sort();
        for dep in deps {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|t| *t == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
