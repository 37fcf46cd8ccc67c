//! Wire format of incoming plans and its conversion into typed steps

use super::{graph, AnalyticalQuery, DataSource, DocumentQuery, Plan, QueryPayload, Step, StepAction, StepKind};
use crate::combinator::Operation;
use crate::error::PlanValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Plan as submitted by the planner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub id: Option<String>,

    /// Position assigned by the planner; used for default names when present
    #[serde(default)]
    pub step_index: Option<usize>,

    pub step_type: StepKind,

    pub data_source: DataSource,

    #[serde(default, alias = "mongodb_query", alias = "clickhouse_query")]
    pub query: Option<Value>,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub operation: Option<String>,

    #[serde(default)]
    pub parameters: Value,

    #[serde(default)]
    pub output_var: Option<String>,
}

impl PlanSpec {
    /// Build typed steps. Graph-level checks happen in [`super::graph::validate`].
    pub fn into_plan(self) -> Result<Plan, PlanValidationError> {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, spec)| spec.into_step(index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match self.plan_id {
            Some(id) => Plan::with_id(id, steps),
            None => Plan::new(steps),
        })
    }
}

impl StepSpec {
    fn into_step(self, position: usize) -> Result<Step, PlanValidationError> {
        let index = self.step_index.unwrap_or(position);
        let id = self.id.unwrap_or_else(|| format!("step_{}", index));
        let invalid = |reason: String| PlanValidationError::InvalidStep {
            step_id: id.clone(),
            reason,
        };

        let action = match (self.step_type, self.data_source) {
            (StepKind::Query, DataSource::Memory) => {
                return Err(invalid("query steps must target mongodb or clickhouse".to_string()));
            }
            (StepKind::Query, source) => {
                let query = self
                    .query
                    .ok_or_else(|| invalid("query step is missing its query".to_string()))?;
                StepAction::Query(parse_payload(source, query).map_err(invalid)?)
            }
            (_, DataSource::Memory) => {
                let operation = self
                    .operation
                    .or_else(|| default_operation(self.step_type).map(str::to_string))
                    .ok_or_else(|| invalid(format!("{} step is missing its operation", self.step_type)))?;
                StepAction::Memory(Operation::parse(&operation, self.parameters).map_err(invalid)?)
            }
            (kind, source) => {
                return Err(invalid(format!("{} steps run in memory, not on {}", kind, source)));
            }
        };

        let output_var = self.output_var.unwrap_or_else(|| format!("step_{}_output", index));
        let step = Step {
            id,
            kind: self.step_type,
            source: self.data_source,
            action,
            inputs: self.inputs,
            output_var,
        };
        graph::check_step(&step)?;
        Ok(step)
    }
}

fn default_operation(kind: StepKind) -> Option<&'static str> {
    match kind {
        StepKind::Filter => Some("filter"),
        StepKind::Join => Some("join"),
        StepKind::Final => Some("identity"),
        StepKind::Query | StepKind::Transform => None,
    }
}

fn parse_payload(source: DataSource, query: Value) -> Result<QueryPayload, String> {
    match source {
        DataSource::Document => serde_json::from_value::<DocumentQuery>(query)
            .map(QueryPayload::Document)
            .map_err(|e| format!("invalid mongodb query: {}", e)),
        DataSource::Analytical => match query {
            Value::String(sql) => Ok(QueryPayload::Analytical(AnalyticalQuery::sql(&sql))),
            other => serde_json::from_value::<AnalyticalQuery>(other)
                .map(QueryPayload::Analytical)
                .map_err(|e| format!("invalid clickhouse query: {}", e)),
        },
        DataSource::Memory => Err("memory steps carry no backend query".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<Plan, PlanValidationError> {
        serde_json::from_value::<PlanSpec>(value).unwrap().into_plan()
    }

    #[test]
    fn test_viewed_not_purchased_plan_parses() {
        let plan = parse(json!({
            "steps": [
                {"id": "viewed", "step_type": "query", "data_source": "mongodb",
                 "mongodb_query": {"collection": "events", "filter": {"type": "view"}},
                 "output_var": "viewed"},
                {"id": "purchased", "step_type": "query", "data_source": "clickhouse",
                 "clickhouse_query": {"query": "SELECT user_id FROM purchases"},
                 "output_var": "purchased"},
                {"id": "diff", "step_type": "filter", "data_source": "memory",
                 "inputs": ["viewed", "purchased"],
                 "parameters": {"condition": {"op": "not_in", "field": "user_id", "input": "purchased"}},
                 "output_var": "diff"},
                {"id": "answer", "step_type": "final", "data_source": "memory", "inputs": ["diff"]}
            ]
        }))
        .unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.steps[0].source, DataSource::Document);
        assert!(matches!(
            &plan.steps[1].action,
            StepAction::Query(QueryPayload::Analytical(q)) if q.query.starts_with("SELECT")
        ));
        assert!(matches!(plan.steps[2].action, StepAction::Memory(Operation::Filter(_))));
        assert_eq!(plan.steps[3].output_var, "step_3_output");
    }

    #[test]
    fn test_defaults_for_ids_and_plain_sql() {
        let id = Uuid::now_v7();
        let plan = parse(json!({
            "plan_id": id,
            "steps": [
                {"step_type": "query", "data_source": "clickhouse", "query": "SELECT 1"},
                {"step_type": "final", "data_source": "memory", "inputs": ["step_0_output"]}
            ]
        }))
        .unwrap();

        assert_eq!(plan.id, id);
        assert_eq!(plan.steps[0].id, "step_0");
        assert_eq!(plan.steps[0].output_var, "step_0_output");
    }

    #[test]
    fn test_planner_step_index_names_defaults() {
        let plan = parse(json!({"steps": [
            {"step_index": 1, "step_type": "query", "data_source": "mongodb",
             "mongodb_query": {"collection": "events"}},
            {"step_index": 2, "step_type": "final", "data_source": "memory", "inputs": ["step_1_output"]}
        ]}))
        .unwrap();

        assert_eq!(plan.steps[0].id, "step_1");
        assert_eq!(plan.steps[1].output_var, "step_2_output");
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let memory_query = parse(json!({"steps": [
            {"id": "a", "step_type": "query", "data_source": "memory"}
        ]}));
        assert!(matches!(memory_query, Err(PlanValidationError::InvalidStep { step_id, .. }) if step_id == "a"));

        let join_arity = parse(json!({"steps": [
            {"id": "j", "step_type": "join", "data_source": "memory", "inputs": ["x"],
             "parameters": {"left_on": "id"}}
        ]}));
        assert!(matches!(join_arity, Err(PlanValidationError::InvalidStep { .. })));

        let wrong_op = parse(json!({"steps": [
            {"id": "t", "step_type": "filter", "data_source": "memory", "inputs": ["x"],
             "operation": "sort", "parameters": {"by": "a"}}
        ]}));
        assert!(matches!(wrong_op, Err(PlanValidationError::InvalidStep { reason, .. }) if reason.contains("sort")));
    }

    #[test]
    fn test_predicate_inputs_must_be_declared() {
        let result = parse(json!({"steps": [
            {"id": "f", "step_type": "filter", "data_source": "memory", "inputs": ["a"],
             "parameters": {"condition": {"op": "in", "field": "id", "input": "b"}}}
        ]}));
        assert!(matches!(result, Err(PlanValidationError::InvalidStep { reason, .. }) if reason.contains("'b'")));
    }

    #[test]
    fn test_missing_query_payload() {
        let result = parse(json!({"steps": [
            {"id": "q", "step_type": "query", "data_source": "mongodb"}
        ]}));
        assert!(matches!(result, Err(PlanValidationError::InvalidStep { .. })));
    }
}
