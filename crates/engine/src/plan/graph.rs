//! Dependency graph construction and structural validation
//!
//! Plans are never repaired: anything other than a single-rooted DAG whose
//! every step feeds the final step is rejected.

use super::{DataSource, Plan, Step, StepAction, StepKind};
use crate::combinator::Operation;
use crate::error::PlanValidationError;
use std::collections::{HashMap, HashSet, VecDeque};

/// Adjacency derived from a validated plan, indexed by declaration position
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Producer step index for each input of each step, in input order
    pub producers: Vec<Vec<usize>>,
    /// Steps consuming each step's output
    pub dependents: Vec<Vec<usize>>,
    /// Topological order, ties broken by declaration order
    pub order: Vec<usize>,
    pub final_step: usize,
}

impl DependencyGraph {
    /// Number of distinct producers a step waits on
    pub fn in_degree(&self, step: usize) -> usize {
        let unique: HashSet<&usize> = self.producers[step].iter().collect();
        unique.len()
    }
}

/// Check plan structure and derive its dependency graph
pub fn validate(plan: &Plan) -> Result<DependencyGraph, PlanValidationError> {
    if plan.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    for step in &plan.steps {
        check_step(step)?;
    }

    let mut ids = HashSet::new();
    for step in &plan.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(PlanValidationError::DuplicateStepId { step_id: step.id.clone() });
        }
    }

    let mut producer_of: HashMap<&str, usize> = HashMap::new();
    for (index, step) in plan.steps.iter().enumerate() {
        if let Some(first) = producer_of.insert(step.output_var.as_str(), index) {
            return Err(PlanValidationError::DuplicateOutputVar {
                output_var: step.output_var.clone(),
                first: plan.steps[first].id.clone(),
                second: step.id.clone(),
            });
        }
    }

    let n = plan.len();
    let mut producers = vec![Vec::new(); n];
    let mut dependents = vec![Vec::new(); n];
    for (index, step) in plan.steps.iter().enumerate() {
        for input in &step.inputs {
            let producer = *producer_of.get(input.as_str()).ok_or_else(|| {
                PlanValidationError::DanglingInput {
                    step_id: step.id.clone(),
                    input: input.clone(),
                }
            })?;
            producers[index].push(producer);
            if !dependents[producer].contains(&index) {
                dependents[producer].push(index);
            }
        }
    }

    let finals: Vec<usize> = (0..n).filter(|&i| plan.steps[i].kind == StepKind::Final).collect();
    let final_step = match finals.as_slice() {
        [] => return Err(PlanValidationError::MissingFinal),
        [only] => *only,
        many => {
            return Err(PlanValidationError::MultipleFinal {
                steps: many.iter().map(|&i| plan.steps[i].id.clone()).collect(),
            })
        }
    };

    let order = topological_order(&producers, &dependents).map_err(|stuck| {
        PlanValidationError::Cycle {
            steps: stuck.into_iter().map(|i| plan.steps[i].id.clone()).collect(),
        }
    })?;

    if let Some(&consumer) = dependents[final_step].first() {
        return Err(PlanValidationError::FinalNotTerminal {
            step_id: plan.steps[final_step].id.clone(),
            consumer: plan.steps[consumer].id.clone(),
        });
    }

    // Walk back from the final step; anything not reached is an orphan branch
    let mut reached = vec![false; n];
    let mut queue = VecDeque::from([final_step]);
    reached[final_step] = true;
    while let Some(current) = queue.pop_front() {
        for &producer in &producers[current] {
            if !reached[producer] {
                reached[producer] = true;
                queue.push_back(producer);
            }
        }
    }
    let orphans: Vec<String> = (0..n)
        .filter(|&i| !reached[i])
        .map(|i| plan.steps[i].id.clone())
        .collect();
    if !orphans.is_empty() {
        return Err(PlanValidationError::OrphanStep { steps: orphans });
    }

    Ok(DependencyGraph {
        producers,
        dependents,
        order,
        final_step,
    })
}

/// Check that a step's kind, backend, action and inputs agree with each other
pub(crate) fn check_step(step: &Step) -> Result<(), PlanValidationError> {
    let invalid = |reason: String| PlanValidationError::InvalidStep {
        step_id: step.id.clone(),
        reason,
    };

    match &step.action {
        StepAction::Query(payload) => {
            if step.kind != StepKind::Query {
                return Err(invalid(format!("{} steps run in memory, not on {}", step.kind, step.source)));
            }
            if step.source != payload.source() {
                return Err(invalid(format!(
                    "step targets {} but carries a {} query",
                    step.source,
                    payload.source()
                )));
            }
            if !step.inputs.is_empty() {
                return Err(invalid("query steps take no inputs".to_string()));
            }
        }
        StepAction::Memory(operation) => {
            if step.source != DataSource::Memory {
                return Err(invalid(format!("{} steps run in memory, not on {}", step.kind, step.source)));
            }
            check_kind(step.kind, operation).map_err(invalid)?;
            operation
                .check_arity(step.inputs.len())
                .map_err(|e| invalid(e.to_string()))?;
            for name in operation.referenced_inputs() {
                if !step.inputs.iter().any(|input| input == name) {
                    return Err(invalid(format!("predicate reads '{}', which is not a step input", name)));
                }
            }
        }
    }
    Ok(())
}

fn check_kind(kind: StepKind, operation: &Operation) -> Result<(), String> {
    let fits = match kind {
        StepKind::Filter => matches!(operation, Operation::Filter(_)),
        StepKind::Join => matches!(operation, Operation::Join(_)),
        StepKind::Transform => matches!(
            operation,
            Operation::Union | Operation::Sort(_) | Operation::Limit(_) | Operation::Transform(_)
        ),
        StepKind::Final => true,
        StepKind::Query => false,
    };
    if fits {
        Ok(())
    } else {
        Err(format!("operation '{}' does not fit a {} step", operation.name(), kind))
    }
}

/// Kahn's algorithm; on a cycle returns the steps that never became ready
fn topological_order(producers: &[Vec<usize>], dependents: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = producers.len();
    let mut remaining: Vec<usize> = producers
        .iter()
        .map(|p| p.iter().collect::<HashSet<_>>().len())
        .collect();
    let mut ready: std::collections::BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| remaining[i] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::{FilterSpec, JoinSpec};
    use crate::plan::{AnalyticalQuery, DocumentQuery, QueryPayload, Step};
    use serde_json::json;

    fn mongo(id: &str, out: &str) -> Step {
        Step::query(id, QueryPayload::Document(DocumentQuery::find(out, json!({}))), out)
    }

    fn sql(id: &str, out: &str) -> Step {
        Step::query(id, QueryPayload::Analytical(AnalyticalQuery::sql("SELECT 1")), out)
    }

    fn join(id: &str, inputs: &[&str], out: &str) -> Step {
        Step::memory(id, StepKind::Join, Operation::Join(JoinSpec::on("id")), inputs, out)
    }

    #[test]
    fn test_diamond_orders_by_level_then_declaration() {
        let plan = Plan::new(vec![
            mongo("a", "a_out"),
            sql("b", "b_out"),
            join("c", &["a_out", "b_out"], "c_out"),
            Step::final_step("d", "c_out"),
        ]);
        let graph = validate(&plan).unwrap();

        assert_eq!(graph.order, vec![0, 1, 2, 3]);
        assert_eq!(graph.final_step, 3);
        assert_eq!(graph.producers[2], vec![0, 1]);
        assert_eq!(graph.dependents[0], vec![2]);
        assert_eq!(graph.in_degree(2), 2);
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let plan = Plan::new(vec![
            Step::final_step("d", "c_out"),
            join("c", &["a_out", "b_out"], "c_out"),
            sql("b", "b_out"),
            mongo("a", "a_out"),
        ]);
        let graph = validate(&plan).unwrap();
        assert_eq!(graph.order, vec![2, 3, 1, 0]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let plan = Plan::new(vec![
            join("x", &["y_out", "z_out"], "x_out"),
            join("y", &["x_out", "z_out"], "y_out"),
            mongo("z", "z_out"),
            Step::final_step("f", "x_out"),
        ]);
        match validate(&plan) {
            Err(PlanValidationError::Cycle { steps }) => {
                assert_eq!(steps, vec!["x", "y", "f"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let plan = Plan::new(vec![
            Step::memory("s", StepKind::Transform, Operation::Union, &["s_out"], "s_out"),
            Step::final_step("f", "s_out"),
        ]);
        assert!(matches!(validate(&plan), Err(PlanValidationError::Cycle { .. })));
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(validate(&Plan::new(vec![])).unwrap_err(), PlanValidationError::Empty);

        let dup_id = Plan::new(vec![mongo("a", "x"), mongo("a", "y")]);
        assert!(matches!(validate(&dup_id), Err(PlanValidationError::DuplicateStepId { .. })));

        let dup_out = Plan::new(vec![mongo("a", "x"), sql("b", "x")]);
        assert_eq!(
            validate(&dup_out).unwrap_err(),
            PlanValidationError::DuplicateOutputVar {
                output_var: "x".into(),
                first: "a".into(),
                second: "b".into()
            }
        );

        let dangling = Plan::new(vec![Step::final_step("f", "nowhere")]);
        assert!(matches!(validate(&dangling), Err(PlanValidationError::DanglingInput { input, .. }) if input == "nowhere"));

        let no_final = Plan::new(vec![mongo("a", "x")]);
        assert_eq!(validate(&no_final).unwrap_err(), PlanValidationError::MissingFinal);

        let two_finals = Plan::new(vec![
            mongo("a", "x"),
            Step::final_step("f1", "x"),
            Step::final_step("f2", "x"),
        ]);
        assert!(matches!(validate(&two_finals), Err(PlanValidationError::MultipleFinal { .. })));
    }

    #[test]
    fn test_orphan_branch_is_rejected() {
        let plan = Plan::new(vec![mongo("a", "x"), sql("b", "unused"), Step::final_step("f", "x")]);
        assert_eq!(
            validate(&plan).unwrap_err(),
            PlanValidationError::OrphanStep { steps: vec!["b".into()] }
        );
    }

    #[test]
    fn test_final_must_be_terminal() {
        let plan = Plan::new(vec![
            mongo("a", "x"),
            Step::final_step("f", "x"),
            Step::memory("after", StepKind::Transform, Operation::Union, &["f_output"], "y"),
        ]);
        assert!(matches!(validate(&plan), Err(PlanValidationError::FinalNotTerminal { .. })));
    }

    #[test]
    fn test_step_shapes_are_checked_for_built_plans() {
        let one_sided_join = Plan::new(vec![
            mongo("a", "a_out"),
            join("j", &["a_out"], "j_out"),
            Step::final_step("f", "j_out"),
        ]);
        assert!(matches!(
            validate(&one_sided_join),
            Err(PlanValidationError::InvalidStep { step_id, .. }) if step_id == "j"
        ));

        let ghost: FilterSpec = serde_json::from_value(json!({
            "condition": {"op": "not_in", "field": "id", "input": "ghost"}
        }))
        .unwrap();
        let undeclared = Plan::new(vec![
            mongo("a", "a_out"),
            Step::memory("f1", StepKind::Filter, Operation::Filter(ghost), &["a_out"], "f1_out"),
            Step::final_step("f", "f1_out"),
        ]);
        assert!(matches!(
            validate(&undeclared),
            Err(PlanValidationError::InvalidStep { reason, .. }) if reason.contains("'ghost'")
        ));

        let mut misrouted = sql("b", "b_out");
        misrouted.source = DataSource::Document;
        let plan = Plan::new(vec![misrouted, Step::final_step("f", "b_out")]);
        assert!(matches!(validate(&plan), Err(PlanValidationError::InvalidStep { .. })));
    }
}
