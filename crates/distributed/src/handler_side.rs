//! In-process execution of collect units assigned to the handler pseudo-node.

use std::collections::BTreeMap;
use std::sync::Arc;

use fanout_common::{CircuitBreaker, FanoutError, JobId, NodeId, Result};
use fanout_execution::{LocalExecutor, run_collect};
use fanout_planner::{DeliveryMode, ExecutionGraph, ExecutionUnit};
use tracing::{error, trace};

use crate::grouper::AssignedUnit;
use crate::merge::MergeStage;

/// A collect unit the handler runs itself, with its merge position.
#[derive(Debug, Clone)]
pub(crate) struct HandlerUnit {
    pub group: usize,
    pub producer: usize,
    pub unit: ExecutionUnit,
}

/// Check the handler pseudo-node assignment and resolve producer indices.
///
/// The handler may only run, per group, exactly one collect unit that is
/// the group's final producer, and only in direct response mode.
pub(crate) fn plan_handler_units(
    graph: &ExecutionGraph,
    mode: DeliveryMode,
    assigned: Vec<AssignedUnit>,
) -> Result<Vec<HandlerUnit>> {
    if mode != DeliveryMode::DirectResponse {
        return Err(FanoutError::Unsupported(format!(
            "units assigned to the handler node require direct responses, job uses {}",
            mode.as_str()
        )));
    }
    let mut by_group: BTreeMap<usize, Vec<ExecutionUnit>> = BTreeMap::new();
    for a in assigned {
        by_group.entry(a.group).or_default().push(a.unit);
    }
    let handler = NodeId::handler();
    let mut out = Vec::with_capacity(by_group.len());
    for (group, mut units) in by_group {
        if units.len() != 1 {
            return Err(FanoutError::Unsupported(format!(
                "handler node runs {} units of group {group}, expected exactly one",
                units.len()
            )));
        }
        let unit = units.remove(0);
        if !unit.is_data_producer() {
            return Err(FanoutError::Unsupported(format!(
                "handler node can only run collect units, unit {} is a {}",
                unit.id,
                unit.kind_name()
            )));
        }
        let final_id = graph.groups()[group].final_producer().map(|u| u.id);
        let producer = graph.groups()[group]
            .producer_index(&handler)
            .filter(|_| final_id == Some(unit.id))
            .ok_or_else(|| {
                FanoutError::Unsupported(format!(
                    "handler unit {} is not the final producer of group {group}",
                    unit.id
                ))
            })?;
        out.push(HandlerUnit {
            group,
            producer,
            unit,
        });
    }
    Ok(out)
}

/// Run one handler unit and feed its bucket into the group's merge stage.
pub(crate) async fn run_handler_unit(
    job_id: JobId,
    executor: Arc<dyn LocalExecutor>,
    breaker: Arc<CircuitBreaker>,
    handler_unit: HandlerUnit,
    stage: Arc<MergeStage>,
) {
    let HandlerUnit {
        group,
        producer,
        unit,
    } = handler_unit;
    let Some(collect) = unit.as_collect() else {
        return;
    };
    let accounting = breaker.context_for(unit.id, "collect");
    match run_collect(executor.as_ref(), job_id, unit.id, collect, &accounting).await {
        Ok(bucket) => {
            trace!(job_id = %job_id, group, unit = %unit.id, rows = bucket.num_rows(), "handler collect done");
            // a rejected bucket already failed its group
            let _ = stage.supply(producer, bucket, true);
        }
        Err(err) => {
            error!(job_id = %job_id, group, unit = %unit.id, error = %err, "handler collect failed");
            stage.fail(producer, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};
    use fanout_common::UnitId;
    use fanout_planner::{Downstream, ExecutionGroup, MergeSpec};

    use crate::grouper::NodeOperations;

    fn graph(units: Vec<Vec<ExecutionUnit>>) -> ExecutionGraph {
        let schema = Schema::new(vec![Field::new("v", DataType::Int64, true)]);
        let specs = (0..units.len())
            .map(|i| MergeSpec::new(100 + i as u32, schema.clone()))
            .collect();
        ExecutionGraph::new(units.into_iter().map(ExecutionGroup::new).collect(), specs).unwrap()
    }

    fn handler_units(graph: &ExecutionGraph) -> Vec<AssignedUnit> {
        NodeOperations::group_by_node(graph)
            .remove(&NodeId::handler())
            .unwrap()
    }

    #[test]
    fn single_collect_per_group_is_planned() {
        let g = graph(vec![vec![ExecutionUnit::collect(1, vec![NodeId::handler()], "t")
            .with_downstream(Downstream::DirectResponse)]]);
        let planned =
            plan_handler_units(&g, DeliveryMode::DirectResponse, handler_units(&g)).unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].producer, 0);
    }

    #[test]
    fn push_mode_is_unsupported() {
        let g = graph(vec![vec![ExecutionUnit::collect(1, vec![NodeId::handler()], "t")]]);
        let err = plan_handler_units(&g, DeliveryMode::Push, handler_units(&g)).unwrap_err();
        assert!(matches!(err, FanoutError::Unsupported(_)));
    }

    #[test]
    fn two_units_in_one_group_are_unsupported() {
        let g = graph(vec![vec![
            ExecutionUnit::collect(1, vec![NodeId::handler()], "t"),
            ExecutionUnit::collect(2, vec![NodeId::handler()], "t")
                .with_downstream(Downstream::DirectResponse),
        ]]);
        let err =
            plan_handler_units(&g, DeliveryMode::DirectResponse, handler_units(&g)).unwrap_err();
        assert!(matches!(err, FanoutError::Unsupported(_)));
    }

    #[test]
    fn merge_unit_is_unsupported() {
        let schema = Schema::new(vec![Field::new("v", DataType::Int64, true)]);
        let g = graph(vec![vec![
            ExecutionUnit::collect(1, vec![NodeId::new("a")], "t")
                .with_downstream(Downstream::Push { target: UnitId(5) }),
            ExecutionUnit::merge(5, vec![NodeId::handler()], schema)
                .with_downstream(Downstream::Push { target: UnitId(100) }),
        ]]);
        let err =
            plan_handler_units(&g, DeliveryMode::DirectResponse, handler_units(&g)).unwrap_err();
        assert!(matches!(err, FanoutError::Unsupported(_)));
        assert!(err.to_string().contains("only run collect units"));
    }
}
