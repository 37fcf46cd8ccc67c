//! Per-step lifecycle of one plan run

use crate::plan::DependencyGraph;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Step states plus the ready set, indexed by declaration position.
///
/// Ready steps are kept ordered so that simultaneously ready steps are
/// dispatched in declaration order.
#[derive(Debug)]
pub(crate) struct RunState {
    states: Vec<StepState>,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}

impl RunState {
    pub fn new(graph: &DependencyGraph) -> Self {
        let n = graph.producers.len();
        let waiting_on: Vec<usize> = (0..n).map(|i| graph.in_degree(i)).collect();
        let ready: BTreeSet<usize> = (0..n).filter(|&i| waiting_on[i] == 0).collect();
        let states = (0..n)
            .map(|i| {
                if ready.contains(&i) {
                    StepState::Ready
                } else {
                    StepState::Pending
                }
            })
            .collect();

        Self {
            states,
            waiting_on,
            dependents: graph.dependents.clone(),
            ready,
        }
    }

    pub fn state(&self, step: usize) -> StepState {
        self.states[step]
    }

    /// Ready steps in declaration order
    pub fn ready(&self) -> Vec<usize> {
        self.ready.iter().copied().collect()
    }

    pub fn start(&mut self, step: usize) {
        debug_assert_eq!(self.states[step], StepState::Ready);
        self.ready.remove(&step);
        self.states[step] = StepState::Running;
    }

    /// Mark a step succeeded and promote dependents whose producers are all done
    pub fn succeed(&mut self, step: usize) {
        self.states[step] = StepState::Succeeded;
        for &dependent in &self.dependents[step] {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 && self.states[dependent] == StepState::Pending {
                self.states[dependent] = StepState::Ready;
                self.ready.insert(dependent);
            }
        }
    }

    pub fn fail(&mut self, step: usize) {
        self.ready.remove(&step);
        self.states[step] = StepState::Failed;
    }

    /// Steps currently in `state`, in declaration order
    pub fn in_state(&self, state: StepState) -> Vec<usize> {
        (0..self.states.len()).filter(|&i| self.states[i] == state).collect()
    }

    /// Steps that have not started yet
    pub fn not_started(&self) -> Vec<usize> {
        (0..self.states.len())
            .filter(|&i| matches!(self.states[i], StepState::Pending | StepState::Ready))
            .collect()
    }

    /// Stop the run: in-flight steps become cancelled, unstarted ones skipped
    pub fn abort(&mut self) {
        for state in &mut self.states {
            *state = match *state {
                StepState::Running => StepState::Cancelled,
                StepState::Pending | StepState::Ready => StepState::Skipped,
                other => other,
            };
        }
        self.ready.clear();
    }
}
