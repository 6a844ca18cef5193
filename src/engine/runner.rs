pub(crate) mod diagnostics;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::TaskContext;
use crate::blueprint::{Edge, Task, Workload};
use crate::engine::NodeView;
use crate::engine::dependencies::{DependenciesState, DependencyNodes};
use crate::engine::dependents::DependentNodes;
use crate::engine::node::{ExecutionState, NodeState};
use crate::error::{BuildError, TaskFailure};
use crate::processor::EventProcessor;

use diagnostics::{Diagnostics, TaskDiagnostics, TaskExecution, TaskOutcome};

/// How long to wait for the diagnostics backlog to drain after the last task.
const DIAGNOSTICS_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable view over node lifecycles, used when deciding readiness.
struct StateView<'a, G: Send + Sync> {
    graph: &'a Graph<Task<G>, Edge>,
    nodes: &'a [NodeState],
}

impl<G: Send + Sync> NodeView for StateView<'_, G> {
    fn is_complete(&self, node: NodeIndex) -> bool {
        self.nodes[node.index()].is_complete()
    }

    fn should_continue(&self, dependent: NodeIndex, dependency: NodeIndex) -> bool {
        let state = &self.nodes[dependency.index()];
        if state.is_successful() {
            return true;
        }
        if !state.is_verification_failure() {
            return false;
        }
        // A verification failure only stops explicitly declared dependents.
        // Nodes wired through outputs still run on whatever was produced.
        !self
            .graph
            .edges_connecting(dependency, dependent)
            .any(|edge| *edge.weight() == Edge::DependsOn)
    }
}

/// Executes the whole graph on the Rayon pool.
///
/// The main thread owns all scheduling state and sits in a loop waiting for
/// completions. Workers only run task actions and report back over a channel,
/// so no lock is ever taken on the graph bookkeeping.
///
/// Scheduling follows the dependency tables eagerly: when a node completes,
/// every node waiting on it is notified and re-queued for a readiness check.
/// Ready nodes are spawned immediately. Nodes whose dependencies completed
/// in a way they cannot continue past are marked as failed without running,
/// which completes them and cascades further.
pub(crate) fn execute<G: Send + Sync + 'static>(
    workload: &Workload<G>,
    data: &G,
) -> Result<Diagnostics, BuildError> {
    let graph = &workload.graph;
    let count = graph.node_count();

    let mut nodes: Vec<NodeState> = (0..count).map(|_| NodeState::default()).collect();
    let mut deps: Vec<DependencyNodes> = (0..count).map(|_| DependencyNodes::default()).collect();
    let mut dependents: Vec<DependentNodes> =
        (0..count).map(|_| DependentNodes::default()).collect();
    let mut is_finalizer = vec![false; count];

    for edge in graph.edge_references() {
        let (source, target) = (edge.source(), edge.target());
        match edge.weight() {
            Edge::DependsOn | Edge::Consumes => {
                deps[target.index()].add_dependency(source);
                dependents[source.index()].add_predecessor(target);
            }
            Edge::OrderedAfter => {
                deps[target.index()].add_ordered_after(source);
                dependents[source.index()].add_ordered_dependent(target);
            }
            Edge::Finalizes => {
                // The finalizer waits for its target but does not care how
                // it ended.
                deps[target.index()].add_ordered_after(source);
                dependents[source.index()].add_finalizer(target);
                is_finalizer[target.index()] = true;
            }
        }
    }

    let mut queue = VecDeque::new();
    let mut completed = 0usize;
    let mut aborted = false;

    // Everything except finalizers is part of the run from the start.
    // Finalizers are pulled in once a node they finalize executes.
    for node in graph.node_indices() {
        if !is_finalizer[node.index()] {
            nodes[node.index()].require();
            queue.push_back(node);
        }
    }

    let root_span = tracing::span!(Level::INFO, "executing_tasks");
    root_span.pb_set_length(count as u64);
    root_span.pb_set_style(&crate::utils::bar_style());
    root_span.pb_set_message("Executing tasks...");
    let _enter = root_span.enter();

    let timings: Arc<Mutex<Vec<Option<TaskExecution>>>> = Arc::new(Mutex::new(vec![None; count]));
    let sink = Arc::clone(&timings);
    let events = EventProcessor::spawn("diagnostics", move |(node, execution): (NodeIndex, TaskExecution)| {
        sink.lock().expect("timings lock poisoned")[node.index()] = Some(execution);
        Ok(())
    })?;

    let mut failures: Vec<TaskFailure> = Vec::new();

    // The scheduler loop blocks on the results channel, so it must stay on
    // the calling thread. Handing it to the pool would wedge a one-worker
    // pool with the loop itself.
    rayon::in_place_scope(|scope| -> Result<(), BuildError> {
        let (result_sender, result_receiver) =
            crossbeam_channel::unbounded::<(NodeIndex, anyhow::Result<()>)>();

        let events = &events;
        let spawn_node = |node: NodeIndex| {
            let task = graph[node].clone();
            let sender = result_sender.clone();
            let pb_style = crate::utils::task_style();

            scope.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = task.name.as_ref());
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {}", task.name));
                let _enter = span.enter();

                let context = TaskContext {
                    data,
                    task: task.name.as_ref(),
                };

                let start = Instant::now();
                // The action only sees shared references, a panic cannot
                // leave the scheduler state half-updated.
                let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (task.action)(&context)
                })) {
                    Ok(result) => result,
                    Err(payload) => Err(anyhow::anyhow!(
                        "Task panicked: {}",
                        crate::utils::panic_message(&*payload)
                    )),
                };

                let execution = TaskExecution {
                    start,
                    duration: start.elapsed(),
                };
                // A submit failure here resurfaces when the processor stops.
                let _ = events.submit((node, execution));
                sender.send((node, result)).unwrap();
            });
        };

        let mut running = 0usize;
        let mut reported = 0usize;
        loop {
            // Drain the queue, spawning everything ready and cascading
            // failures through nodes that can no longer run.
            while let Some(node) = queue.pop_front() {
                if nodes[node.index()].execution != ExecutionState::ShouldRun {
                    continue;
                }
                let state = {
                    let view = StateView {
                        graph,
                        nodes: &nodes,
                    };
                    deps[node.index()].state(node, &view)
                };
                match state {
                    DependenciesState::NotComplete => {}
                    DependenciesState::CompleteAndSuccessful => {
                        nodes[node.index()].start();
                        spawn_node(node);
                        running += 1;
                    }
                    DependenciesState::CompleteAndNotSuccessful => {
                        nodes[node.index()].mark_failed_dependency();
                        post_complete(
                            graph,
                            &mut nodes,
                            &mut deps,
                            &dependents,
                            &mut queue,
                            &mut completed,
                            node,
                        );
                    }
                }
            }

            if completed == count {
                break;
            }

            if running == 0 {
                // Finalizers whose targets never executed are all that can
                // be left over, release anything ordered after them.
                let deferred: Vec<_> = graph
                    .node_indices()
                    .filter(|node| nodes[node.index()].execution == ExecutionState::NotScheduled)
                    .collect();
                if deferred.is_empty() {
                    return Err(BuildError::Stalled {
                        report: health_report(graph, &nodes, &deps),
                    });
                }
                for node in deferred {
                    nodes[node.index()].skip();
                    post_complete(
                        graph,
                        &mut nodes,
                        &mut deps,
                        &dependents,
                        &mut queue,
                        &mut completed,
                        node,
                    );
                }
                continue;
            }

            let (node, result) = result_receiver
                .recv()
                .expect("a running task holds a sender");
            running -= 1;

            let failure = match result {
                Ok(()) => None,
                Err(error) => {
                    let error = Arc::new(error);
                    failures.push(TaskFailure {
                        task: graph[node].name.to_string(),
                        error: Arc::clone(&error),
                    });
                    Some(error)
                }
            };
            let failed = failure.is_some();
            nodes[node.index()].finish(failure);
            post_complete(
                graph,
                &mut nodes,
                &mut deps,
                &dependents,
                &mut queue,
                &mut completed,
                node,
            );

            if failed && !workload.continue_on_failure && !aborted {
                aborted = true;
                abort_pending(
                    graph,
                    &mut nodes,
                    &mut deps,
                    &dependents,
                    &is_finalizer,
                    &mut queue,
                    &mut completed,
                );
            }

            root_span.pb_inc((completed - reported) as u64);
            reported = completed;
        }

        Ok(())
    })?;

    events.stop(DIAGNOSTICS_STOP_TIMEOUT)?;
    let timings = timings.lock().expect("timings lock poisoned");

    let cancelled = nodes
        .iter()
        .filter(|node| matches!(node.execution, ExecutionState::Cancelled | ExecutionState::FailedDependency))
        .count();

    let diagnostics = Diagnostics {
        tasks: graph
            .node_indices()
            .map(|node| TaskDiagnostics {
                name: graph[node].name.to_string(),
                outcome: outcome_of(&nodes[node.index()]),
                execution: timings[node.index()],
            })
            .collect(),
        edges: graph
            .edge_references()
            .map(|edge| {
                let arrow = match edge.weight() {
                    Edge::DependsOn => "-->",
                    Edge::Consumes => "==>",
                    Edge::OrderedAfter => "-.->",
                    Edge::Finalizes => "-. finalized by .->",
                };
                (edge.source().index(), edge.target().index(), arrow)
            })
            .collect(),
    };

    if failures.is_empty() {
        tracing::info!(
            "{}",
            console::style(format!("Executed {count} task(s)")).green()
        );
        Ok(diagnostics)
    } else {
        Err(BuildError::Failed {
            failures,
            cancelled,
        })
    }
}

/// Bookkeeping after `node` reached a terminal state: trigger its finalizers
/// if it actually ran, then notify and re-queue everything waiting on it.
fn post_complete<G: Send + Sync>(
    graph: &Graph<Task<G>, Edge>,
    nodes: &mut [NodeState],
    deps: &mut [DependencyNodes],
    dependents: &[DependentNodes],
    queue: &mut VecDeque<NodeIndex>,
    completed: &mut usize,
    node: NodeIndex,
) {
    *completed += 1;

    if nodes[node.index()].has_executed() {
        let finalizers: Vec<_> = dependents[node.index()].finalizers().collect();
        for finalizer in finalizers {
            require_with_dependencies(nodes, deps, queue, finalizer);
        }
    }

    let view = StateView {
        graph,
        nodes: &*nodes,
    };
    dependents[node.index()].for_each_waiting(|dependent| {
        deps[dependent.index()].on_node_complete(dependent, node, &view);
        queue.push_back(dependent);
    });
}

/// Pull a deferred node and its whole strict dependency chain into the run.
fn require_with_dependencies(
    nodes: &mut [NodeState],
    deps: &mut [DependencyNodes],
    queue: &mut VecDeque<NodeIndex>,
    node: NodeIndex,
) {
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if nodes[current.index()].execution == ExecutionState::NotScheduled {
            nodes[current.index()].require();
            queue.push_back(current);
            stack.extend(deps[current.index()].ordered());
        }
    }
    // The node may have been required by an earlier target already, a
    // second queue entry is harmless.
    queue.push_back(node);
}

/// Cancel everything not yet started. Tasks already executing run to
/// completion, and finalizers still run for targets that executed.
fn abort_pending<G: Send + Sync>(
    graph: &Graph<Task<G>, Edge>,
    nodes: &mut [NodeState],
    deps: &mut [DependencyNodes],
    dependents: &[DependentNodes],
    is_finalizer: &[bool],
    queue: &mut VecDeque<NodeIndex>,
    completed: &mut usize,
) {
    let to_cancel: Vec<_> = graph
        .node_indices()
        .filter(|node| {
            nodes[node.index()].execution == ExecutionState::ShouldRun
                && !is_finalizer[node.index()]
        })
        .collect();
    for node in to_cancel {
        nodes[node.index()].cancel();
        post_complete(graph, nodes, deps, dependents, queue, completed, node);
    }
}

fn outcome_of(node: &NodeState) -> TaskOutcome {
    match node.execution {
        ExecutionState::Executed if node.failure.is_some() => TaskOutcome::Failed,
        ExecutionState::Executed => TaskOutcome::Success,
        ExecutionState::FailedDependency => TaskOutcome::DependencyFailed,
        ExecutionState::Cancelled => TaskOutcome::Cancelled,
        _ => TaskOutcome::Skipped,
    }
}

fn health_report<G: Send + Sync>(
    graph: &Graph<Task<G>, Edge>,
    nodes: &[NodeState],
    deps: &[DependencyNodes],
) -> String {
    use std::fmt::Write;

    let mut report = String::new();
    for node in graph.node_indices() {
        if nodes[node.index()].is_complete() {
            continue;
        }
        let waiting: Vec<_> = deps[node.index()]
            .waiting_on()
            .into_iter()
            .map(|other| graph[other].name.as_ref().to_string())
            .collect();
        let _ = writeln!(
            report,
            "- '{}' in state {:?}, waiting on [{}]",
            graph[node].name,
            nodes[node.index()].execution,
            waiting.join(", ")
        );
    }
    report
}
