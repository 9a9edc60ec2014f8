use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arrow_schema::{Schema, SchemaRef};
use fanout_common::{FanoutError, NodeId, Result, UnitId};
use serde::{Deserialize, Serialize};

use crate::unit::{Downstream, ExecutionUnit, Projection, UnitKind};

/// One ordering key of a final merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Column index in the merge input schema.
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            descending: true,
            nulls_first: true,
        }
    }
}

/// Final local merge of one execution group, run on the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Id of the handler merge unit; push deliveries address it.
    pub unit_id: UnitId,
    /// Row-stream type descriptor of the incoming buckets.
    pub schema: Schema,
    /// Ordering of the merged rows; empty keeps producer order.
    #[serde(default)]
    pub order_by: Vec<SortKey>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Projections applied after ordering and limit.
    #[serde(default)]
    pub projections: Vec<Projection>,
}

impl MergeSpec {
    pub fn new(unit_id: u32, schema: Schema) -> Self {
        Self {
            unit_id: UnitId(unit_id),
            schema,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            projections: Vec::new(),
        }
    }

    pub fn with_order_by(mut self, order_by: Vec<SortKey>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn with_projections(mut self, projections: Vec<Projection>) -> Self {
        self.projections = projections;
        self
    }

    pub fn schema_ref(&self) -> SchemaRef {
        Arc::new(self.schema.clone())
    }
}

/// Units that together produce exactly one final result.
///
/// The last unit is the group's final producer: every node it runs on
/// contributes one bucket stream to the handler merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub units: Vec<ExecutionUnit>,
}

impl ExecutionGroup {
    pub fn new(units: Vec<ExecutionUnit>) -> Self {
        Self { units }
    }

    pub fn final_producer(&self) -> Option<&ExecutionUnit> {
        self.units.last()
    }

    /// Number of producers the handler merge waits for.
    pub fn producer_count(&self) -> usize {
        self.final_producer().map_or(0, |u| u.nodes.len())
    }

    /// Producer index of `node` in this group's handler merge.
    pub fn producer_index(&self, node: &NodeId) -> Option<usize> {
        self.final_producer()?.nodes.iter().position(|n| n == node)
    }
}

/// How final buckets reach the coordinator; fixed for the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Inline in the job response.
    DirectResponse,
    /// Pushed page by page into the coordinator's merge stages.
    Push,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::DirectResponse => "direct_response",
            DeliveryMode::Push => "push",
        }
    }
}

/// Shape of each group's final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultKind {
    /// Merged rows.
    #[default]
    Rows,
    /// Sum of the first `Int64` column of the merged rows (DML counts).
    RowCount,
}

/// Planned, already partitioned job handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    groups: Vec<ExecutionGroup>,
    merge_specs: Vec<MergeSpec>,
    result_kind: ResultKind,
}

impl ExecutionGraph {
    /// Validate and build a graph.
    ///
    /// Groups and merge specs must be aligned 1:1 and every group needs at
    /// least one unit. A unit lists each node at most once. A final
    /// producer that pushes must push into its own group's merge unit;
    /// any other pushing unit must target a merge unit of its group.
    /// Merge units run on exactly one node, push their rows on and are fed
    /// by exactly one upstream unit, whose node count becomes the merge
    /// unit's producer count.
    pub fn new(mut groups: Vec<ExecutionGroup>, merge_specs: Vec<MergeSpec>) -> Result<Self> {
        if groups.len() != merge_specs.len() {
            return Err(FanoutError::InvalidConfig(format!(
                "{} execution groups but {} merge specs",
                groups.len(),
                merge_specs.len()
            )));
        }
        let spec_ids = merge_specs.iter().map(|s| s.unit_id).collect::<HashSet<_>>();
        for (idx, (group, spec)) in groups.iter_mut().zip(&merge_specs).enumerate() {
            let producer = group.final_producer().ok_or_else(|| {
                FanoutError::InvalidConfig(format!("execution group {idx} has no units"))
            })?;
            if let Downstream::Push { target } = producer.downstream {
                if target != spec.unit_id {
                    return Err(FanoutError::InvalidConfig(format!(
                        "final producer {} of group {idx} pushes to unit {target}, \
                         but the group merges into unit {}",
                        producer.id, spec.unit_id
                    )));
                }
            }
            check_distinct_nodes(idx, group)?;
            resolve_merge_units(idx, group, &spec_ids)?;
        }
        Ok(Self {
            groups,
            merge_specs,
            result_kind: ResultKind::Rows,
        })
    }

    pub fn with_result_kind(mut self, result_kind: ResultKind) -> Self {
        self.result_kind = result_kind;
        self
    }

    pub fn groups(&self) -> &[ExecutionGroup] {
        &self.groups
    }

    pub fn merge_specs(&self) -> &[MergeSpec] {
        &self.merge_specs
    }

    pub fn result_kind(&self) -> ResultKind {
        self.result_kind
    }

    /// All units with the index of their group, in declaration order.
    pub fn units(&self) -> impl Iterator<Item = (usize, &ExecutionUnit)> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(idx, g)| g.units.iter().map(move |u| (idx, u)))
    }

    /// Node hosting each merge unit of the graph.
    pub fn merge_hosts(&self) -> BTreeMap<UnitId, NodeId> {
        self.units()
            .filter(|(_, u)| u.as_merge().is_some())
            .filter_map(|(_, u)| u.nodes.first().map(|n| (u.id, n.clone())))
            .collect()
    }

    /// Direct response iff any unit anywhere declares it.
    ///
    /// A graph that also contains push units is refused: the per-node
    /// requests mix groups, so one job has to use one protocol. In direct
    /// mode exactly the final producers respond directly, so a node's
    /// reply carries one bucket per group it is a final producer of.
    pub fn delivery_mode(&self) -> Result<DeliveryMode> {
        let direct = self.units().any(|(_, u)| u.has_direct_response());
        if !direct {
            return Ok(DeliveryMode::Push);
        }
        if let Some((group, unit)) = self.units().find(|(_, u)| u.push_target().is_some()) {
            return Err(FanoutError::Unsupported(format!(
                "unit {} of group {group} pushes its rows while other units use direct \
                 responses; a job must use a single delivery protocol",
                unit.id
            )));
        }
        for (idx, group) in self.groups.iter().enumerate() {
            let last = group.units.len().saturating_sub(1);
            for (pos, unit) in group.units.iter().enumerate() {
                if (pos == last) != unit.has_direct_response() {
                    let role = if pos == last { "final producer" } else { "upstream unit" };
                    return Err(FanoutError::Unsupported(format!(
                        "{role} {} of group {idx} {} a direct response; only final \
                         producers answer directly",
                        unit.id,
                        if pos == last { "lacks" } else { "declares" }
                    )));
                }
            }
        }
        Ok(DeliveryMode::DirectResponse)
    }
}

fn check_distinct_nodes(idx: usize, group: &ExecutionGroup) -> Result<()> {
    for unit in &group.units {
        let mut seen = HashSet::with_capacity(unit.nodes.len());
        if let Some(node) = unit.nodes.iter().find(|n| !seen.insert(*n)) {
            return Err(FanoutError::InvalidConfig(format!(
                "unit {} of group {idx} lists node {node} more than once",
                unit.id
            )));
        }
    }
    Ok(())
}

fn resolve_merge_units(
    idx: usize,
    group: &mut ExecutionGroup,
    spec_ids: &HashSet<UnitId>,
) -> Result<()> {
    let final_id = group.final_producer().map(|u| u.id);
    let merge_ids = group
        .units
        .iter()
        .filter(|u| u.as_merge().is_some())
        .map(|u| u.id)
        .collect::<HashSet<_>>();
    let mut upstreams: HashMap<UnitId, Vec<usize>> = HashMap::new();
    for unit in &group.units {
        let Some(target) = unit.push_target() else {
            continue;
        };
        if merge_ids.contains(&target) {
            upstreams.entry(target).or_default().push(unit.nodes.len());
        } else if Some(unit.id) != final_id {
            return Err(FanoutError::InvalidConfig(format!(
                "unit {} of group {idx} pushes to unit {target}, which is not a merge unit \
                 of the group",
                unit.id
            )));
        }
    }
    for unit in &mut group.units {
        let id = unit.id;
        let node_count = unit.nodes.len();
        let pushes = unit.push_target().is_some();
        let UnitKind::Merge(merge) = &mut unit.kind else {
            continue;
        };
        if spec_ids.contains(&id) {
            return Err(FanoutError::InvalidConfig(format!(
                "merge unit {id} of group {idx} reuses the id of a group merge"
            )));
        }
        if node_count != 1 {
            return Err(FanoutError::InvalidConfig(format!(
                "merge unit {id} of group {idx} runs on {node_count} nodes, expected one"
            )));
        }
        if !pushes {
            return Err(FanoutError::InvalidConfig(format!(
                "merge unit {id} of group {idx} must push its rows downstream"
            )));
        }
        merge.upstream_producers = match upstreams.get(&id).map(Vec::as_slice) {
            Some([producers]) => *producers,
            Some(_) => {
                return Err(FanoutError::InvalidConfig(format!(
                    "merge unit {id} of group {idx} has several upstream units"
                )));
            }
            None => {
                return Err(FanoutError::InvalidConfig(format!(
                    "merge unit {id} of group {idx} has no upstream unit"
                )));
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![Field::new("v", DataType::Int64, true)])
    }

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    #[test]
    fn rejects_misaligned_specs() {
        let group = ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["n1"]), "t")]);
        let err = ExecutionGraph::new(vec![group], vec![]).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_empty_group() {
        let err = ExecutionGraph::new(
            vec![ExecutionGroup::new(vec![])],
            vec![MergeSpec::new(10, schema())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no units"));
    }

    #[test]
    fn rejects_push_into_foreign_merge() {
        let group = ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["n1"]), "t")
            .with_downstream(Downstream::Push { target: UnitId(99) })]);
        let err = ExecutionGraph::new(vec![group], vec![MergeSpec::new(10, schema())]).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfig(_)));
    }

    #[test]
    fn any_direct_response_unit_selects_direct_mode() {
        let groups = vec![
            ExecutionGroup::new(vec![
                ExecutionUnit::collect(1, nodes(&["n1"]), "t"),
                ExecutionUnit::collect(2, nodes(&["n1"]), "t")
                    .with_downstream(Downstream::DirectResponse),
            ]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(3, nodes(&["n2"]), "t")
                .with_downstream(Downstream::DirectResponse)]),
        ];
        let graph = ExecutionGraph::new(
            groups,
            vec![MergeSpec::new(10, schema()), MergeSpec::new(11, schema())],
        )
        .expect("graph");
        assert_eq!(graph.delivery_mode().expect("mode"), DeliveryMode::DirectResponse);
    }

    #[test]
    fn direct_mode_needs_every_final_producer_to_respond() {
        // a's reply would carry one bucket while it is final producer of two groups
        let groups = vec![
            ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["a"]), "t")]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(2, nodes(&["a"]), "other")
                .with_downstream(Downstream::DirectResponse)]),
        ];
        let graph = ExecutionGraph::new(
            groups,
            vec![MergeSpec::new(10, schema()), MergeSpec::new(11, schema())],
        )
        .expect("graph");
        let err = graph.delivery_mode().unwrap_err();
        assert!(matches!(err, FanoutError::Unsupported(_)));
        assert!(err.to_string().contains("final producer 1"));
    }

    #[test]
    fn direct_mode_rejects_responding_upstream_unit() {
        let groups = vec![ExecutionGroup::new(vec![
            ExecutionUnit::collect(1, nodes(&["a"]), "t").with_downstream(Downstream::DirectResponse),
            ExecutionUnit::collect(2, nodes(&["a"]), "t").with_downstream(Downstream::DirectResponse),
        ])];
        let graph = ExecutionGraph::new(groups, vec![MergeSpec::new(10, schema())]).expect("graph");
        assert!(matches!(graph.delivery_mode(), Err(FanoutError::Unsupported(_))));
    }

    #[test]
    fn rejects_node_listed_twice() {
        let group = ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["a", "a"]), "t")
            .with_downstream(Downstream::DirectResponse)]);
        let err = ExecutionGraph::new(vec![group], vec![MergeSpec::new(10, schema())]).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfig(_)));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn merge_unit_takes_producer_count_from_its_upstream() {
        let group = ExecutionGroup::new(vec![
            ExecutionUnit::collect(1, nodes(&["a", "b", "c"]), "t")
                .with_downstream(Downstream::Push { target: UnitId(5) }),
            ExecutionUnit::merge(5, nodes(&["m"]), schema())
                .with_downstream(Downstream::Push { target: UnitId(10) }),
        ]);
        let graph = ExecutionGraph::new(vec![group], vec![MergeSpec::new(10, schema())])
            .expect("graph");
        let merge = graph.groups()[0].units[1].as_merge().expect("merge unit");
        assert_eq!(merge.upstream_producers, 3);
        assert_eq!(graph.groups()[0].producer_count(), 1);
        assert_eq!(graph.merge_hosts().get(&UnitId(5)), Some(&NodeId::new("m")));
        assert_eq!(graph.delivery_mode().expect("mode"), DeliveryMode::Push);
    }

    #[test]
    fn rejects_malformed_merge_units() {
        let upstream = |target: u32| {
            ExecutionUnit::collect(1, nodes(&["a"]), "t")
                .with_downstream(Downstream::Push { target: UnitId(target) })
        };
        let merge = |on: &[&str]| {
            ExecutionUnit::merge(5, nodes(on), schema())
                .with_downstream(Downstream::Push { target: UnitId(10) })
        };
        let cases = vec![
            // two hosting nodes
            vec![upstream(5), merge(&["m", "n"])],
            // nothing feeds the merge
            vec![ExecutionUnit::collect(1, nodes(&["a"]), "t"), merge(&["m"])],
            // upstream pushes past the merge
            vec![upstream(9), merge(&["m"])],
            // merge keeps its rows
            vec![
                upstream(5),
                ExecutionUnit::merge(5, nodes(&["m"]), schema()),
                ExecutionUnit::collect(2, nodes(&["a"]), "t")
                    .with_downstream(Downstream::Push { target: UnitId(10) }),
            ],
        ];
        for units in cases {
            let err = ExecutionGraph::new(
                vec![ExecutionGroup::new(units)],
                vec![MergeSpec::new(10, schema())],
            )
            .unwrap_err();
            assert!(matches!(err, FanoutError::InvalidConfig(_)), "{err}");
        }
    }

    #[test]
    fn mixing_protocols_is_unsupported() {
        let groups = vec![
            ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["n1"]), "t")
                .with_downstream(Downstream::Push { target: UnitId(10) })]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(2, nodes(&["n2"]), "t")
                .with_downstream(Downstream::DirectResponse)]),
        ];
        let graph = ExecutionGraph::new(
            groups,
            vec![MergeSpec::new(10, schema()), MergeSpec::new(11, schema())],
        )
        .expect("graph");
        assert!(matches!(graph.delivery_mode(), Err(FanoutError::Unsupported(_))));
    }

    #[test]
    fn producer_index_follows_final_unit_node_order() {
        let group = ExecutionGroup::new(vec![
            ExecutionUnit::collect(1, nodes(&["n3"]), "t"),
            ExecutionUnit::collect(2, nodes(&["n2", "n1"]), "t"),
        ]);
        assert_eq!(group.producer_count(), 2);
        assert_eq!(group.producer_index(&NodeId::new("n1")), Some(1));
        assert_eq!(group.producer_index(&NodeId::new("n3")), None);
    }
}
