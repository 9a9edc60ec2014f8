use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fanout_common::{
    AccountingContext, CoordinatorConfig, FanoutError, JobId, NodeConfig, NodeId, Result, UnitId,
};
use fanout_distributed::{InProcessTransport, JobCoordinator, NodeService, TaskResult};
use fanout_execution::{Bucket, InMemoryExecutor, LocalExecutor};
use fanout_planner::{
    CollectUnit, Downstream, ExecutionGraph, ExecutionGroup, ExecutionUnit, MergeSpec, Projection,
    SortKey,
};
use futures::future::BoxFuture;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
}

fn executor(tables: &[(&str, Vec<i64>)]) -> InMemoryExecutor {
    let exec = InMemoryExecutor::new();
    for (name, values) in tables {
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from(values.clone()))],
        )
        .expect("batch");
        exec.register_table(*name, schema(), vec![batch]);
    }
    exec
}

/// Scans after a fixed delay.
struct SlowExecutor {
    inner: InMemoryExecutor,
    delay: Duration,
}

impl LocalExecutor for SlowExecutor {
    fn scan<'a>(
        &'a self,
        job_id: JobId,
        unit: &'a CollectUnit,
        accounting: &'a AccountingContext,
    ) -> BoxFuture<'a, Result<Bucket>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.scan(job_id, unit, accounting).await
        })
    }
}

fn node_with(
    transport: &Arc<InProcessTransport>,
    id: &str,
    executor: Arc<dyn LocalExecutor>,
) -> Arc<NodeService> {
    let config = NodeConfig {
        node_id: NodeId::new(id),
        page_size_rows: 2,
        ..NodeConfig::default()
    };
    let node = NodeService::new(config, executor, transport.clone());
    transport.register(&node);
    node
}

fn node(
    transport: &Arc<InProcessTransport>,
    id: &str,
    tables: &[(&str, Vec<i64>)],
) -> Arc<NodeService> {
    node_with(transport, id, Arc::new(executor(tables)))
}

struct Cluster {
    coordinator: JobCoordinator,
    coord: Arc<NodeService>,
    a: Arc<NodeService>,
    b: Arc<NodeService>,
}

fn cluster() -> Cluster {
    let transport = InProcessTransport::new();
    let coord = node(&transport, "coord", &[("t", vec![100])]);
    let a = node(&transport, "a", &[("t", vec![1, 2, 3])]);
    let b = node(&transport, "b", &[("t", vec![4, 5, 6, 7, 8])]);
    let coordinator = JobCoordinator::new(
        CoordinatorConfig {
            local_node_id: NodeId::new("coord"),
            ..CoordinatorConfig::default()
        },
        transport,
        Arc::clone(&coord),
    );
    Cluster {
        coordinator,
        coord,
        a,
        b,
    }
}

fn nodes(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::new(*id)).collect()
}

fn values(result: &TaskResult) -> Vec<i64> {
    result
        .batches()
        .iter()
        .flat_map(|b| {
            let col = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
            (0..col.len()).map(|i| col.value(i)).collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn direct_response_job_merges_ordered_rows_from_two_nodes() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![ExecutionGroup::new(vec![ExecutionUnit::collect(
            1,
            nodes(&["a", "b"]),
            "t",
        )
        .with_downstream(Downstream::DirectResponse)])],
        vec![MergeSpec::new(10, schema().as_ref().clone())
            .with_order_by(vec![SortKey::desc(0)])
            .with_limit(4, 0)],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let results = handle.results().await;
    assert_eq!(values(results[0].as_ref().unwrap()), vec![8, 7, 6, 5]);
}

#[tokio::test]
async fn push_job_pages_into_coordinator_merges() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![
            ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["a", "b"]), "t")
                .with_downstream(Downstream::Push { target: UnitId(10) })]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(2, nodes(&["coord", "b"]), "t")
                .with_projections(vec![Projection::CountRows])
                .with_downstream(Downstream::Push { target: UnitId(11) })]),
        ],
        vec![
            MergeSpec::new(10, schema().as_ref().clone()).with_order_by(vec![SortKey::asc(0)]),
            MergeSpec::new(
                11,
                Schema::new(vec![Field::new("count", DataType::Int64, false)]),
            ),
        ],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    let results = handle.results().await;
    assert_eq!(
        values(results[0].as_ref().unwrap()),
        vec![1, 2, 3, 4, 5, 6, 7, 8]
    );
    // coord counts 1 row, b counts 5
    assert_eq!(values(results[1].as_ref().unwrap()), vec![1, 5]);
    handle.finished().await.unwrap();
    assert!(c.coord.contexts().get(&job_id).is_none());
}

#[tokio::test]
async fn failed_job_closes_retained_contexts_on_nodes() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![
            ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["b"]), "t")
                .keep_context_for_fetcher()
                .with_downstream(Downstream::DirectResponse)]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(2, nodes(&["b"]), "missing")
                .with_downstream(Downstream::DirectResponse)]),
        ],
        vec![
            MergeSpec::new(10, schema().as_ref().clone()),
            MergeSpec::new(11, schema().as_ref().clone()),
        ],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    let results = handle.results().await;
    // b fails its whole request, so both of its groups fail
    assert!(matches!(results[0], Err(FanoutError::LocalExecution(_))));
    assert!(matches!(results[1], Err(FanoutError::LocalExecution(_))));
    handle.finished().await.unwrap();
    assert!(c.b.contexts().get(&job_id).is_none());
}

#[tokio::test]
async fn successful_job_keeps_retained_contexts_for_fetch() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["a"]), "t")
            .keep_context_for_fetcher()
            .with_downstream(Downstream::DirectResponse)])],
        vec![MergeSpec::new(10, schema().as_ref().clone())],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    assert!(handle.results().await[0].is_ok());
    handle.finished().await.unwrap();

    let retained = c
        .a
        .contexts()
        .take_retained(&job_id, UnitId(1))
        .expect("retained rows");
    assert_eq!(retained.num_rows(), 3);
    assert!(c.a.contexts().get(&job_id).is_none());
    assert!(c.b.contexts().is_empty());
}

#[tokio::test]
async fn close_during_slow_collect_leaves_no_retained_context() {
    let transport = InProcessTransport::new();
    let coord = node(&transport, "coord", &[]);
    let slow = node_with(
        &transport,
        "slow",
        Arc::new(SlowExecutor {
            inner: executor(&[("t", vec![1, 2])]),
            delay: Duration::from_millis(300),
        }),
    );
    let _b = node(&transport, "b", &[("t", vec![3])]);
    let coordinator = JobCoordinator::new(
        CoordinatorConfig {
            local_node_id: NodeId::new("coord"),
            ..CoordinatorConfig::default()
        },
        transport,
        coord,
    );
    let graph = ExecutionGraph::new(
        vec![
            ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["slow"]), "t")
                .keep_context_for_fetcher()
                .with_downstream(Downstream::DirectResponse)]),
            ExecutionGroup::new(vec![ExecutionUnit::collect(2, nodes(&["b"]), "missing")
                .with_downstream(Downstream::DirectResponse)]),
        ],
        vec![
            MergeSpec::new(10, schema().as_ref().clone()),
            MergeSpec::new(11, schema().as_ref().clone()),
        ],
    )
    .unwrap();

    let handle = coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    let results = handle.results().await;
    // the close reached slow while it was still collecting
    assert_eq!(values(results[0].as_ref().unwrap()), vec![1, 2]);
    assert!(matches!(results[1], Err(FanoutError::LocalExecution(_))));
    handle.finished().await.unwrap();
    assert!(slow.contexts().get(&job_id).is_none());
}

#[tokio::test]
async fn push_job_keeps_coordinator_retained_output() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![ExecutionGroup::new(vec![ExecutionUnit::collect(1, nodes(&["coord", "a"]), "t")
            .keep_context_for_fetcher()
            .with_downstream(Downstream::Push { target: UnitId(10) })])],
        vec![MergeSpec::new(10, schema().as_ref().clone())],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    assert_eq!(values(handle.results().await[0].as_ref().unwrap()), vec![100, 1, 2, 3]);
    handle.finished().await.unwrap();

    let ctx = c.coord.contexts().get(&job_id).expect("retained context");
    assert!(ctx.merge_stage(UnitId(10)).is_none());
    assert_eq!(
        c.coord
            .contexts()
            .take_retained(&job_id, UnitId(1))
            .expect("retained rows")
            .num_rows(),
        1
    );
    assert!(c.coord.contexts().get(&job_id).is_none());
    assert_eq!(
        c.a.contexts().take_retained(&job_id, UnitId(1)).map(|b| b.num_rows()),
        Some(3)
    );
}

#[tokio::test]
async fn node_hosted_merge_feeds_the_group_merge() {
    let c = cluster();
    let graph = ExecutionGraph::new(
        vec![ExecutionGroup::new(vec![
            ExecutionUnit::collect(1, nodes(&["a", "b"]), "t")
                .with_downstream(Downstream::Push { target: UnitId(5) }),
            ExecutionUnit::merge(5, nodes(&["b"]), schema().as_ref().clone())
                .with_order_by(vec![SortKey::desc(0)])
                .with_projections(vec![Projection::Limit {
                    limit: 4,
                    offset: 0,
                }])
                .with_downstream(Downstream::Push { target: UnitId(10) }),
        ])],
        vec![MergeSpec::new(10, schema().as_ref().clone()).with_limit(3, 0)],
    )
    .unwrap();

    let handle = c.coordinator.start(graph).expect("start");
    let job_id = handle.job_id();
    assert_eq!(values(handle.results().await[0].as_ref().unwrap()), vec![8, 7, 6]);
    handle.finished().await.unwrap();
    assert!(c.b.contexts().get(&job_id).is_none());
    assert!(c.coord.contexts().get(&job_id).is_none());
}
