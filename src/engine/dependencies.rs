//! Forward dependency tracking for a single node.
//!
//! Most nodes have no dependencies at all, and most of the rest only have
//! strict ones, so the bookkeeping is an enum that starts empty and grows a
//! representation only when an edge of the corresponding kind shows up.
//!
//! Completion of a dependency reaches a node two ways. The executor notifies
//! eagerly through [`DependencyNodes::on_node_complete`] whenever any node
//! finishes, and [`DependencyNodes::state`] additionally prunes lazily on
//! first query so the scan over the waiting set happens at most once.

use std::collections::{BTreeSet, HashSet};
use std::mem;

use petgraph::graph::NodeIndex;

use super::NodeView;

/// Aggregate verdict over everything a node waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DependenciesState {
    NotComplete,
    CompleteAndSuccessful,
    CompleteAndNotSuccessful,
}

impl DependenciesState {
    pub fn is_complete(self) -> bool {
        self != Self::NotComplete
    }
}

#[derive(Debug, Default)]
pub(crate) enum DependencyNodes {
    #[default]
    Empty,
    Successors(DependencySuccessors),
    Complex(ComplexDependencies),
}

impl DependencyNodes {
    /// Record a strict dependency: `dependency` must finish, and be allowed
    /// to continue past, before this node may start.
    pub fn add_dependency(&mut self, dependency: NodeIndex) {
        match self {
            Self::Empty => {
                let mut successors = DependencySuccessors::default();
                successors.add(dependency);
                *self = Self::Successors(successors);
            }
            Self::Successors(successors) => successors.add(dependency),
            Self::Complex(complex) => complex.successors.add(dependency),
        }
    }

    /// Record an ordering constraint: `predecessor` must finish before this
    /// node may start, but its outcome does not matter.
    pub fn add_ordered_after(&mut self, predecessor: NodeIndex) {
        match self {
            Self::Empty => {
                let mut complex = ComplexDependencies::default();
                complex.ordered_after.insert(predecessor);
                *self = Self::Complex(complex);
            }
            Self::Successors(_) => {
                let Self::Successors(successors) = mem::take(self) else {
                    unreachable!();
                };
                let mut complex = ComplexDependencies {
                    successors,
                    ordered_after: BTreeSet::new(),
                };
                complex.ordered_after.insert(predecessor);
                *self = Self::Complex(complex);
            }
            Self::Complex(complex) => {
                complex.ordered_after.insert(predecessor);
            }
        }
    }

    /// Eager notification that `node` reached a terminal state.
    pub fn on_node_complete(&mut self, dependent: NodeIndex, node: NodeIndex, view: &dyn NodeView) {
        match self {
            Self::Empty => {}
            Self::Successors(successors) => successors.on_node_complete(dependent, node, view),
            Self::Complex(complex) => complex.successors.on_node_complete(dependent, node, view),
        }
    }

    /// Aggregate state of everything this node waits for. Memoized where a
    /// scan is needed, so repeated queries are cheap.
    pub fn state(&mut self, dependent: NodeIndex, view: &dyn NodeView) -> DependenciesState {
        match self {
            Self::Empty => DependenciesState::CompleteAndSuccessful,
            Self::Successors(successors) => successors.state(dependent, view),
            Self::Complex(complex) => complex.state(dependent, view),
        }
    }

    /// Strict dependencies in a stable order, for rendering and diagnostics.
    pub fn ordered(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        match self {
            Self::Empty => None,
            Self::Successors(successors) => Some(successors.ordered.iter().copied()),
            Self::Complex(complex) => Some(complex.successors.ordered.iter().copied()),
        }
        .into_iter()
        .flatten()
    }

    /// Nodes still holding this one back, for the stall report.
    pub fn waiting_on(&self) -> Vec<NodeIndex> {
        match self {
            Self::Empty => Vec::new(),
            Self::Successors(successors) => successors.waiting_for.iter().copied().collect(),
            Self::Complex(complex) => {
                let mut waiting: Vec<_> = complex.successors.waiting_for.iter().copied().collect();
                waiting.extend(complex.ordered_after.iter().copied());
                waiting
            }
        }
    }
}

/// Strict dependencies only.
#[derive(Debug, Default)]
pub(crate) struct DependencySuccessors {
    /// Every strict dependency, in insertion-stable order.
    ordered: BTreeSet<NodeIndex>,
    /// The subset not yet known to be complete.
    waiting_for: HashSet<NodeIndex>,
    /// Set once the initial scan over `waiting_for` has happened; after that,
    /// completions arrive only through `on_node_complete`.
    pruned: bool,
    /// A dependency finished in a way this node cannot continue past.
    /// Permanent, discovering one failed dependency is enough.
    blocked: bool,
}

impl DependencySuccessors {
    fn add(&mut self, dependency: NodeIndex) {
        self.ordered.insert(dependency);
        self.waiting_for.insert(dependency);
        // Force the next query to re-scan, the new entry may already be
        // complete.
        self.pruned = false;
    }

    fn on_node_complete(&mut self, dependent: NodeIndex, node: NodeIndex, view: &dyn NodeView) {
        if self.waiting_for.remove(&node) && !view.should_continue(dependent, node) {
            self.blocked = true;
        }
    }

    fn state(&mut self, dependent: NodeIndex, view: &dyn NodeView) -> DependenciesState {
        if self.blocked {
            return DependenciesState::CompleteAndNotSuccessful;
        }
        if !self.pruned {
            self.waiting_for.retain(|&dependency| {
                if !view.is_complete(dependency) {
                    return true;
                }
                if !view.should_continue(dependent, dependency) {
                    self.blocked = true;
                }
                false
            });
            self.pruned = true;
            if self.blocked {
                return DependenciesState::CompleteAndNotSuccessful;
            }
        }
        if self.waiting_for.is_empty() {
            DependenciesState::CompleteAndSuccessful
        } else {
            DependenciesState::NotComplete
        }
    }
}

/// Strict dependencies plus ordering-only predecessors.
#[derive(Debug, Default)]
pub(crate) struct ComplexDependencies {
    successors: DependencySuccessors,
    /// Predecessors that must merely be complete, whatever their outcome.
    ordered_after: BTreeSet<NodeIndex>,
}

impl ComplexDependencies {
    fn state(&mut self, dependent: NodeIndex, view: &dyn NodeView) -> DependenciesState {
        let strict = self.successors.state(dependent, view);
        if strict == DependenciesState::CompleteAndNotSuccessful {
            return strict;
        }
        self.ordered_after
            .retain(|&predecessor| !view.is_complete(predecessor));
        if !self.ordered_after.is_empty() {
            return DependenciesState::NotComplete;
        }
        strict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeView {
        complete: HashSet<NodeIndex>,
        veto: HashSet<NodeIndex>,
    }

    impl FakeView {
        fn new() -> Self {
            Self {
                complete: HashSet::new(),
                veto: HashSet::new(),
            }
        }
    }

    impl NodeView for FakeView {
        fn is_complete(&self, node: NodeIndex) -> bool {
            self.complete.contains(&node)
        }

        fn should_continue(&self, _dependent: NodeIndex, dependency: NodeIndex) -> bool {
            !self.veto.contains(&dependency)
        }
    }

    fn ix(value: u32) -> NodeIndex {
        NodeIndex::new(value as usize)
    }

    #[test]
    fn no_dependencies_is_trivially_satisfied() {
        let mut deps = DependencyNodes::default();
        let view = FakeView::new();
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn waits_for_strict_dependency() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));

        let mut view = FakeView::new();
        assert_eq!(deps.state(ix(0), &view), DependenciesState::NotComplete);

        view.complete.insert(ix(1));
        deps.on_node_complete(ix(0), ix(1), &view);
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn vetoed_dependency_blocks_permanently() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));
        deps.add_dependency(ix(2));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        view.veto.insert(ix(1));
        deps.on_node_complete(ix(0), ix(1), &view);

        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndNotSuccessful
        );

        // Remains blocked even after the other dependency succeeds.
        view.complete.insert(ix(2));
        deps.on_node_complete(ix(0), ix(2), &view);
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndNotSuccessful
        );
    }

    #[test]
    fn initial_query_prunes_already_complete_dependencies() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));
        deps.add_dependency(ix(2));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        view.complete.insert(ix(2));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn pruning_during_initial_query_detects_a_veto() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        view.veto.insert(ix(1));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndNotSuccessful
        );
    }

    #[test]
    fn ordering_predecessor_needs_completion_only() {
        let mut deps = DependencyNodes::default();
        deps.add_ordered_after(ix(1));

        let mut view = FakeView::new();
        assert_eq!(deps.state(ix(0), &view), DependenciesState::NotComplete);

        // A vetoed predecessor satisfies an ordering constraint.
        view.complete.insert(ix(1));
        view.veto.insert(ix(1));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn strict_and_ordering_constraints_combine() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));
        deps.add_ordered_after(ix(2));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        deps.on_node_complete(ix(0), ix(1), &view);
        assert_eq!(deps.state(ix(0), &view), DependenciesState::NotComplete);

        view.complete.insert(ix(2));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn strict_veto_wins_over_pending_ordering() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));
        deps.add_ordered_after(ix(2));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        view.veto.insert(ix(1));
        deps.on_node_complete(ix(0), ix(1), &view);

        // The ordering predecessor never completes but the verdict is
        // already known.
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndNotSuccessful
        );
    }

    #[test]
    fn dependency_added_after_a_query_is_pruned_on_requery() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));

        let mut view = FakeView::new();
        view.complete.insert(ix(1));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );

        // A dependency registered late, already complete by then.
        view.complete.insert(ix(2));
        deps.add_dependency(ix(2));
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );
    }

    #[test]
    fn dependency_added_after_a_query_can_still_block() {
        let mut deps = DependencyNodes::default();
        let mut view = FakeView::new();
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndSuccessful
        );

        deps.add_dependency(ix(1));
        assert_eq!(deps.state(ix(0), &view), DependenciesState::NotComplete);

        view.complete.insert(ix(1));
        view.veto.insert(ix(1));
        deps.on_node_complete(ix(0), ix(1), &view);
        assert_eq!(
            deps.state(ix(0), &view),
            DependenciesState::CompleteAndNotSuccessful
        );
    }

    #[test]
    fn waiting_on_lists_outstanding_nodes() {
        let mut deps = DependencyNodes::default();
        deps.add_dependency(ix(1));
        deps.add_ordered_after(ix(2));

        let view = FakeView::new();
        let _ = deps.state(ix(0), &view);
        let mut waiting = deps.waiting_on();
        waiting.sort();
        assert_eq!(waiting, vec![ix(1), ix(2)]);
    }
}
