//! Reverse dependency tracking, who is waiting on a given node.
//!
//! Mirrors [`dependencies`](super::dependencies): an enum that starts empty
//! and only grows richer representations as edges of new kinds are wired in.
//! The executor walks this set when a node completes to deliver eager
//! notifications and to trigger finalizers.

use std::collections::BTreeSet;
use std::mem;

use petgraph::graph::NodeIndex;

#[derive(Debug, Default)]
pub(crate) enum DependentNodes {
    #[default]
    Empty,
    Predecessors(DependencyPredecessors),
    Complex(ComplexDependents),
}

impl DependentNodes {
    /// `dependent` strictly depends on this node.
    pub fn add_predecessor(&mut self, dependent: NodeIndex) {
        match self {
            Self::Empty => {
                let mut predecessors = DependencyPredecessors::default();
                predecessors.0.insert(dependent);
                *self = Self::Predecessors(predecessors);
            }
            Self::Predecessors(predecessors) => {
                predecessors.0.insert(dependent);
            }
            Self::Complex(complex) => {
                complex.predecessors.insert(dependent);
            }
        }
    }

    /// `dependent` is ordered after this node but does not consume it.
    pub fn add_ordered_dependent(&mut self, dependent: NodeIndex) {
        self.as_complex().ordered_dependents.insert(dependent);
    }

    /// `finalizer` runs once this node has executed, whatever the outcome.
    pub fn add_finalizer(&mut self, finalizer: NodeIndex) {
        self.as_complex().finalizers.insert(finalizer);
    }

    fn as_complex(&mut self) -> &mut ComplexDependents {
        if let Self::Complex(complex) = self {
            return complex;
        }
        let predecessors = match mem::take(self) {
            Self::Empty => BTreeSet::new(),
            Self::Predecessors(predecessors) => predecessors.0,
            Self::Complex(_) => unreachable!(),
        };
        *self = Self::Complex(ComplexDependents {
            predecessors,
            ordered_dependents: BTreeSet::new(),
            finalizers: BTreeSet::new(),
        });
        let Self::Complex(complex) = self else {
            unreachable!();
        };
        complex
    }

    /// Every node whose readiness may change when this one completes.
    pub fn for_each_waiting(&self, mut visit: impl FnMut(NodeIndex)) {
        match self {
            Self::Empty => {}
            Self::Predecessors(predecessors) => {
                predecessors.0.iter().copied().for_each(&mut visit);
            }
            Self::Complex(complex) => {
                complex.predecessors.iter().copied().for_each(&mut visit);
                complex
                    .ordered_dependents
                    .iter()
                    .copied()
                    .for_each(&mut visit);
                complex.finalizers.iter().copied().for_each(&mut visit);
            }
        }
    }

    pub fn finalizers(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        match self {
            Self::Complex(complex) => Some(complex.finalizers.iter().copied()),
            _ => None,
        }
        .into_iter()
        .flatten()
    }
}

/// Strict dependents only, the common case.
#[derive(Debug, Default)]
pub(crate) struct DependencyPredecessors(BTreeSet<NodeIndex>);

#[derive(Debug)]
pub(crate) struct ComplexDependents {
    predecessors: BTreeSet<NodeIndex>,
    ordered_dependents: BTreeSet<NodeIndex>,
    finalizers: BTreeSet<NodeIndex>,
}
