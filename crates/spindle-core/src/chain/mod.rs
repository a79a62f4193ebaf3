//! Task chains: a DAG of tasks where each node starts once every task it
//! depends on has succeeded.
//!
//! Nodes are built up front with pre-assigned ids, validated (unknown
//! dependencies, cycles), then roots are submitted. Everything after that is
//! driven by completion callbacks: a success releases dependents whose last
//! dependency it was; a failure cancels according to `ChainPolicy`. The chain
//! as a whole is exposed as one more task record that finishes when every
//! node is terminal.

mod graph;

pub use graph::DependencyGraph;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::domain::{ChainId, SubmitOptions, TaskId, TaskOutcome, TaskRecord, TaskState};
use crate::engine::{Engine, Shared};
use crate::error::{ChainError, TaskError, WaitError};
use crate::handle::TaskHandle;
use crate::payload::Payload;

/// What happens to the rest of a chain when one node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainPolicy {
    /// Cancel every node that has not started yet.
    #[default]
    FailFast,
    /// Cancel only the failed node's (transitive) dependents; independent
    /// branches keep running.
    ContinueIndependent,
}

struct ChainNode {
    id: TaskId,
    payload: Payload,
    options: SubmitOptions,
    depends_on: Vec<TaskId>,
}

/// Builds and runs a chain on an engine.
///
/// ```ignore
/// let mut chain = ChainExecutor::new(&engine);
/// let a = chain.add_task(fetch, &[]);
/// let b = chain.add_task(transform, &[a]);
/// let run = chain.execute()?;
/// let results = run.wait(None).await?; // {"task-...": value, ...}
/// ```
pub struct ChainExecutor {
    shared: Arc<Shared>,
    id: ChainId,
    policy: ChainPolicy,
    nodes: Vec<ChainNode>,
    executed: bool,
}

impl ChainExecutor {
    pub fn new(engine: &Engine) -> Self {
        let shared = Arc::clone(engine.shared());
        Self {
            id: shared.ids.chain_id(),
            shared,
            policy: ChainPolicy::default(),
            nodes: Vec::new(),
            executed: false,
        }
    }

    pub fn with_policy(mut self, policy: ChainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node with default options. Returns the id the task will run under.
    pub fn add_task(&mut self, payload: Payload, depends_on: &[TaskId]) -> TaskId {
        self.add_task_with(payload, SubmitOptions::default(), depends_on)
    }

    pub fn add_task_with(
        &mut self,
        payload: Payload,
        options: SubmitOptions,
        depends_on: &[TaskId],
    ) -> TaskId {
        let id = self.shared.ids.task_id();
        self.nodes.push(ChainNode {
            id,
            payload,
            options,
            depends_on: depends_on.to_vec(),
        });
        id
    }

    /// Validate the graph and submit its roots.
    ///
    /// Nothing is submitted when validation fails. If a root is rejected at
    /// admission the whole chain is cancelled and the admission error returned.
    pub fn execute(&mut self) -> Result<ChainRun, ChainError> {
        if self.executed {
            return Err(ChainError::AlreadyExecuted);
        }
        if self.nodes.is_empty() {
            return Err(ChainError::Empty);
        }

        let known: HashSet<TaskId> = self.nodes.iter().map(|n| n.id).collect();
        let mut graph = DependencyGraph::new();
        for node in &self.nodes {
            graph.add_node(node.id);
            for &dependency in &node.depends_on {
                if !known.contains(&dependency) {
                    return Err(ChainError::UnknownDependency {
                        task: node.id,
                        dependency,
                    });
                }
                graph.add_dependency(node.id, dependency);
            }
        }
        if let Some(cycle) = graph.detect_cycle() {
            return Err(ChainError::CyclicDependency { cycle });
        }
        self.executed = true;

        let shared = &self.shared;
        let mut records = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            let record = shared.new_record(
                node.id,
                Some(node.payload),
                node.options,
                None,
            );
            shared.store.insert(Arc::clone(&record));
            records.insert(node.id, record);
        }

        let completion = shared.new_record(
            shared.ids.task_id(),
            None,
            SubmitOptions::default().max_retries(0),
            None,
        );
        // Running until the last node settles
        completion.try_start(shared.clock.now());
        shared.store.insert(Arc::clone(&completion));

        let order = graph.nodes().to_vec();
        let roots = graph.roots();
        let progress = Progress {
            waiting_on: order
                .iter()
                .map(|id| (*id, graph.dependency_count(*id)))
                .collect(),
            unfinished: order.len(),
            results: Map::new(),
            unsuccessful: Vec::new(),
            doomed: HashSet::new(),
        };
        let state = Arc::new(ChainState {
            shared: Arc::clone(shared),
            id: self.id,
            policy: self.policy,
            graph,
            records,
            completion: Arc::clone(&completion),
            progress: Mutex::new(progress),
        });

        for id in &order {
            let watcher = Arc::clone(&state);
            let node = *id;
            state.records[id].add_callback(Box::new(move |outcome| {
                watcher.on_node_finished(node, outcome);
            }));
        }

        info!(
            target: "spindle::chain",
            chain_id = %self.id,
            tasks = order.len(),
            roots = roots.len(),
            policy = ?self.policy,
            "chain started"
        );

        for root in roots {
            let record = Arc::clone(&state.records[&root]);
            if let Err(e) = shared.admit(record) {
                shared.stats.record_rejected();
                warn!(
                    target: "spindle::chain",
                    chain_id = %self.id,
                    task_id = %root,
                    error = %e,
                    "chain root rejected; cancelling chain"
                );
                state.cancel_all(TaskError::Cancelled);
                return Err(e.into());
            }
        }

        let tasks = order
            .iter()
            .map(|id| {
                (
                    *id,
                    TaskHandle::new(Arc::clone(&state.records[id]), Arc::clone(shared)),
                )
            })
            .collect();
        Ok(ChainRun {
            id: self.id,
            completion: TaskHandle::new(completion, Arc::clone(shared)),
            tasks,
            order,
            state,
        })
    }
}

impl fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("tasks", &self.nodes.len())
            .field("executed", &self.executed)
            .finish()
    }
}

/// A running chain.
pub struct ChainRun {
    id: ChainId,
    completion: TaskHandle,
    tasks: HashMap<TaskId, TaskHandle>,
    order: Vec<TaskId>,
    state: Arc<ChainState>,
}

impl ChainRun {
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Handle for the chain as a whole. Succeeds with an object mapping every
    /// task id to its result; fails with `TaskError::ChainFailed`.
    pub fn completion(&self) -> &TaskHandle {
        &self.completion
    }

    pub fn into_completion(self) -> TaskHandle {
        self.completion
    }

    /// Handle for one node.
    pub fn handle(&self, id: TaskId) -> Option<&TaskHandle> {
        self.tasks.get(&id)
    }

    /// Node handles in the order they were added.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Value, WaitError> {
        self.completion.wait(timeout).await
    }

    /// Cancel every node that has not started. Running nodes get their
    /// cooperative flag raised. Returns how many were cancelled outright.
    pub fn cancel(&self) -> usize {
        self.state.cancel_all(TaskError::Cancelled)
    }
}

impl fmt::Debug for ChainRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRun")
            .field("id", &self.id)
            .field("state", &self.completion.state())
            .field("tasks", &self.order.len())
            .finish()
    }
}

struct Progress {
    /// Unfinished dependencies per node.
    waiting_on: HashMap<TaskId, usize>,
    unfinished: usize,
    results: Map<String, Value>,
    unsuccessful: Vec<TaskId>,
    /// Nodes already picked for cancellation.
    doomed: HashSet<TaskId>,
}

struct ChainState {
    shared: Arc<Shared>,
    id: ChainId,
    policy: ChainPolicy,
    graph: DependencyGraph,
    records: HashMap<TaskId, Arc<TaskRecord>>,
    completion: Arc<TaskRecord>,
    progress: Mutex<Progress>,
}

impl ChainState {
    /// Completion callback of every node. Runs on whichever thread finished
    /// the node; cancellations below re-enter it, so the lock is released
    /// before acting.
    fn on_node_finished(&self, node: TaskId, outcome: &TaskOutcome) {
        let mut release = Vec::new();
        let mut cancel = Vec::new();
        let finished = {
            let mut p = self.progress.lock();
            p.unfinished = p.unfinished.saturating_sub(1);
            match outcome {
                Ok(value) => {
                    p.results.insert(node.to_string(), value.clone());
                    for dependent in self.graph.get_waiting_tasks(node) {
                        if let Some(left) = p.waiting_on.get_mut(&dependent) {
                            *left = left.saturating_sub(1);
                            if *left == 0 && !p.doomed.contains(&dependent) {
                                release.push(dependent);
                            }
                        }
                    }
                }
                Err(error) => {
                    p.unsuccessful.push(node);
                    debug!(
                        target: "spindle::chain",
                        chain_id = %self.id,
                        task_id = %node,
                        error = %error,
                        "chain task did not succeed"
                    );
                    let dependents = self.graph.transitive_dependents(node);
                    for dependent in &dependents {
                        if p.doomed.insert(*dependent) {
                            cancel.push((*dependent, TaskError::DependencyFailed { dependency: node }));
                        }
                    }
                    if self.policy == ChainPolicy::FailFast {
                        for other in self.graph.nodes() {
                            if *other != node && p.doomed.insert(*other) {
                                cancel.push((*other, TaskError::Cancelled));
                            }
                        }
                    }
                }
            }
            (p.unfinished == 0).then(|| {
                if p.unsuccessful.is_empty() {
                    Ok(Value::Object(std::mem::take(&mut p.results)))
                } else {
                    Err(TaskError::ChainFailed {
                        failed: p.unsuccessful.clone(),
                    })
                }
            })
        };

        for (id, error) in cancel {
            self.shared.cancel(&self.records[&id], error);
        }
        for id in release {
            let record = &self.records[&id];
            if record.state() != TaskState::Pending {
                continue;
            }
            if self.shared.accepting() {
                self.shared.admit_forced(Arc::clone(record));
            } else {
                self.shared.cancel(record, TaskError::Cancelled);
            }
        }
        if let Some(outcome) = finished {
            self.finish(outcome);
        }
    }

    fn finish(&self, outcome: TaskOutcome) {
        let state = if outcome.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        info!(
            target: "spindle::chain",
            chain_id = %self.id,
            task_id = %self.completion.id(),
            state = %state,
            "chain finished"
        );
        self.completion
            .finish(state, outcome, None, self.shared.clock.now());
    }

    fn cancel_all(&self, error: TaskError) -> usize {
        let targets: Vec<TaskId> = {
            let mut p = self.progress.lock();
            self.graph
                .nodes()
                .iter()
                .copied()
                .filter(|id| p.doomed.insert(*id))
                .collect()
        };
        targets
            .into_iter()
            .filter(|id| self.shared.cancel(&self.records[id], error.clone()))
            .count()
    }
}
