//! Scheduling internals of a [`Workload`](crate::Workload).
//!
//! The graph built by the [`Blueprint`](crate::Blueprint) is static; during
//! execution each node carries mutable bookkeeping split across three parallel
//! tables, its lifecycle state ([`node`]), the nodes it waits for
//! ([`dependencies`]) and the nodes waiting for it ([`dependents`]).

pub(crate) mod dependencies;
pub(crate) mod dependents;
pub(crate) mod node;
pub(crate) mod runner;

use petgraph::graph::NodeIndex;

/// Read access to the lifecycle of other nodes, as needed when deciding
/// whether a node may start.
pub(crate) trait NodeView {
    /// Has this node reached a terminal state, in any outcome?
    fn is_complete(&self, node: NodeIndex) -> bool;

    /// May `dependent` still run given how `dependency` ended?
    fn should_continue(&self, dependent: NodeIndex, dependency: NodeIndex) -> bool;
}
