//! Declarative construction of a work graph.
//!
//! A [`Blueprint`] collects tasks and the relationships between them, then
//! freezes into a [`Workload`] which can be executed. Tasks are referenced
//! through opaque [`TaskHandle`]s returned at registration, so relationships
//! can only point at tasks that actually exist.

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};

use crate::TaskContext;
use crate::engine::runner;
use crate::engine::runner::diagnostics::Diagnostics;
use crate::error::{BuildError, PlanError};

type Action<G> = Arc<dyn for<'a> Fn(&TaskContext<'a, G>) -> anyhow::Result<()> + Send + Sync>;

/// A single unit of work in the graph.
pub(crate) struct Task<G: Send + Sync> {
    pub name: Cow<'static, str>,
    pub action: Action<G>,
}

impl<G: Send + Sync> Clone for Task<G> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: Arc::clone(&self.action),
        }
    }
}

/// How one task relates to another. Edges point from the task that completes
/// first to the task that waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    /// Target waits for the source and refuses to run unless it succeeded.
    DependsOn,
    /// Target is wired to the source through its output. It still runs when
    /// the source ended in a recoverable verification failure.
    Consumes,
    /// Target waits for the source to complete, outcome irrelevant.
    OrderedAfter,
    /// Target is a finalizer that runs once the source has executed.
    Finalizes,
}

/// Opaque reference to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) NodeIndex);

/// Work graph under construction.
pub struct Blueprint<G: Send + Sync = ()> {
    graph: Graph<Task<G>, Edge>,
}

impl<G: Send + Sync> Default for Blueprint<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Send + Sync> Blueprint<G> {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
        }
    }

    /// Start defining a new task.
    pub fn task(&mut self) -> TaskDef<'_, G> {
        TaskDef {
            blueprint: self,
            name: None,
            depends_on: Vec::new(),
            consumes: Vec::new(),
            after: Vec::new(),
            finalizes: Vec::new(),
        }
    }

    /// How many tasks are registered.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Freeze the graph into an executable [`Workload`].
    ///
    /// Fails if the relationships form a cycle.
    pub fn finish(self) -> Result<Workload<G>, PlanError> {
        if let Err(cycle) = toposort(&self.graph, None) {
            let task = self.graph[cycle.node_id()].name.to_string();
            return Err(PlanError::Cycle { task });
        }
        Ok(Workload {
            graph: self.graph,
            continue_on_failure: false,
        })
    }
}

impl<G: Send + Sync> Display for Blueprint<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_mermaid(&self.graph, f)
    }
}

/// Builder for a single task, obtained from [`Blueprint::task`].
pub struct TaskDef<'a, G: Send + Sync> {
    blueprint: &'a mut Blueprint<G>,
    name: Option<Cow<'static, str>>,
    depends_on: Vec<TaskHandle>,
    consumes: Vec<TaskHandle>,
    after: Vec<TaskHandle>,
    finalizes: Vec<TaskHandle>,
}

impl<'a, G: Send + Sync + 'static> TaskDef<'a, G> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Tasks that must complete successfully before this one starts. Any
    /// failure, including a verification failure, blocks this task.
    pub fn depends_on(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.depends_on.extend(handles);
        self
    }

    /// Tasks whose output this one reads. Like
    /// [`depends_on`](Self::depends_on), except a verification failure of
    /// the upstream task is tolerated: whatever output it produced is still
    /// worth processing, e.g. rendering a report over failed results.
    pub fn consumes(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.consumes.extend(handles);
        self
    }

    /// Tasks that must merely be out of the way before this one starts;
    /// their outcome does not matter.
    pub fn after(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.after.extend(handles);
        self
    }

    /// Tasks this one finalizes. A finalizer is scheduled as soon as any of
    /// its targets executes, even when the run is otherwise failing, and
    /// runs after all of them are out of the way.
    pub fn finalizes(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.finalizes.extend(handles);
        self
    }

    /// Register the task with the given action and get a handle to it.
    pub fn run<F>(self, action: F) -> TaskHandle
    where
        F: for<'b> Fn(&TaskContext<'b, G>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = self
            .name
            .unwrap_or_else(|| Cow::Borrowed(std::any::type_name::<F>()));
        let node = self.blueprint.graph.add_node(Task {
            name,
            action: Arc::new(action),
        });
        for handle in self.depends_on {
            self.blueprint.graph.add_edge(handle.0, node, Edge::DependsOn);
        }
        for handle in self.consumes {
            self.blueprint.graph.add_edge(handle.0, node, Edge::Consumes);
        }
        for handle in self.after {
            self.blueprint.graph.add_edge(handle.0, node, Edge::OrderedAfter);
        }
        for handle in self.finalizes {
            self.blueprint.graph.add_edge(handle.0, node, Edge::Finalizes);
        }
        TaskHandle(node)
    }
}

/// Frozen, cycle-free work graph ready for execution.
pub struct Workload<G: Send + Sync = ()> {
    pub(crate) graph: Graph<Task<G>, Edge>,
    pub(crate) continue_on_failure: bool,
}

impl<G: Send + Sync + 'static> Workload<G> {
    /// Keep executing tasks whose dependencies are unaffected after another
    /// task fails, instead of cancelling everything still pending.
    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    /// Execute the whole graph, running independent tasks in parallel.
    ///
    /// Returns diagnostics for the run when every task succeeded. On
    /// failure the error carries the individual task failures and the
    /// number of tasks that never got to run.
    pub fn execute(&self, data: G) -> Result<Diagnostics, BuildError> {
        runner::execute(self, &data)
    }
}

impl<G: Send + Sync> Display for Workload<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_mermaid(&self.graph, f)
    }
}

fn render_mermaid<G: Send + Sync>(
    graph: &Graph<Task<G>, Edge>,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    use petgraph::visit::EdgeRef;

    writeln!(f, "flowchart TD")?;
    for node in graph.node_indices() {
        writeln!(f, "    N{}[\"{}\"]", node.index(), graph[node].name)?;
    }
    for node in graph.node_indices() {
        for edge in graph.edges_directed(node, Direction::Outgoing) {
            let arrow = match edge.weight() {
                Edge::DependsOn => "-->",
                Edge::Consumes => "==>",
                Edge::OrderedAfter => "-.->",
                Edge::Finalizes => "-. finalized by .->",
            };
            writeln!(f, "    N{} {} N{}", node.index(), arrow, edge.target().index())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_reference_registered_tasks() {
        let mut plan = Blueprint::<()>::new();
        let first = plan.task().name("first").run(|_| Ok(()));
        let second = plan.task().name("second").depends_on([first]).run(|_| Ok(()));
        assert_ne!(first, second);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn default_name_comes_from_the_action_type() {
        let mut plan = Blueprint::<()>::new();
        let handle = plan.task().run(|_| Ok(()));
        let workload = plan.finish().unwrap();
        let name = &workload.graph[handle.0].name;
        assert!(!name.is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut plan = Blueprint::<()>::new();
        let first = plan.task().name("first").run(|_| Ok(()));
        // A task ordered after a task that depends on it.
        let second = plan
            .task()
            .name("second")
            .depends_on([first])
            .run(|_| Ok(()));
        plan.graph.add_edge(second.0, first.0, Edge::OrderedAfter);

        let Err(error) = plan.finish() else {
            panic!("expected the cycle to be rejected");
        };
        assert!(matches!(error, PlanError::Cycle { .. }));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut plan = Blueprint::<()>::new();
        let task = plan.task().name("task").run(|_| Ok(()));
        plan.graph.add_edge(task.0, task.0, Edge::DependsOn);
        assert!(plan.finish().is_err());
    }

    #[test]
    fn mermaid_rendering_lists_nodes_and_edges() {
        let mut plan = Blueprint::<()>::new();
        let first = plan.task().name("fetch").run(|_| Ok(()));
        plan.task().name("build").depends_on([first]).run(|_| Ok(()));

        let rendered = plan.to_string();
        assert!(rendered.contains("flowchart TD"));
        assert!(rendered.contains("fetch"));
        assert!(rendered.contains("N0 --> N1"));
    }
}
