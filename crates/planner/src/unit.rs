use arrow_schema::Schema;
use fanout_common::{NodeId, UnitId};
use serde::{Deserialize, Serialize};

use crate::graph::{MergeSpec, SortKey};

/// Where a unit's output rows go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Downstream {
    /// Rows travel back inline in the job response of the node that ran the unit.
    DirectResponse,
    /// Rows are pushed page by page into the merge unit `target`.
    Push {
        /// Merge unit receiving the pages.
        target: UnitId,
    },
    /// Output is not consumed by this job (e.g. kept for a later fetch phase).
    None,
}

/// Row-level transformation applied by a flat projector chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// Keep the given input columns, in order.
    Columns(Vec<usize>),
    /// Skip `offset` rows, then keep at most `limit`.
    Limit {
        /// Max rows kept.
        limit: usize,
        /// Rows skipped first.
        offset: usize,
    },
    /// Replace the input with a single `count` row (`Int64`).
    CountRows,
}

/// Data-producing unit: reads a source and runs its projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectUnit {
    /// Source table name, resolved by the local executor.
    pub table: String,
    /// Projections applied to the collected rows, in order.
    pub projections: Vec<Projection>,
    /// Keep the node-side context alive after collecting so that a later
    /// fetch phase can read from it. Such contexts must be closed
    /// explicitly if the job fails.
    #[serde(default)]
    pub keep_context_for_fetcher: bool,
}

/// Merge unit: combines the pages of its upstream producers on the node
/// hosting it, then pushes the merged rows to its own downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeUnit {
    /// Row type pushed in by the upstream producers.
    pub schema: Schema,
    /// Ordering of the merged rows; empty keeps producer order.
    #[serde(default)]
    pub order_by: Vec<SortKey>,
    /// Projections applied to the merged rows.
    pub projections: Vec<Projection>,
    /// Number of upstream producers, resolved by `ExecutionGraph::new`.
    #[serde(default)]
    pub upstream_producers: usize,
}

/// Unit variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    Collect(CollectUnit),
    Merge(MergeUnit),
}

/// One schedulable piece of the distributed plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    /// Job-scoped id.
    pub id: UnitId,
    /// Nodes that run this unit. A node's position in this list is its
    /// producer index in the downstream merge.
    pub nodes: Vec<NodeId>,
    /// Downstream target of the produced rows.
    pub downstream: Downstream,
    /// Variant payload.
    pub kind: UnitKind,
}

impl ExecutionUnit {
    /// Collect unit reading `table` on `nodes`, with no downstream yet.
    pub fn collect(id: u32, nodes: Vec<NodeId>, table: impl Into<String>) -> Self {
        Self {
            id: UnitId(id),
            nodes,
            downstream: Downstream::None,
            kind: UnitKind::Collect(CollectUnit {
                table: table.into(),
                projections: Vec::new(),
                keep_context_for_fetcher: false,
            }),
        }
    }

    /// Merge unit on `nodes` consuming rows of type `schema`, with no
    /// downstream yet.
    pub fn merge(id: u32, nodes: Vec<NodeId>, schema: Schema) -> Self {
        Self {
            id: UnitId(id),
            nodes,
            downstream: Downstream::None,
            kind: UnitKind::Merge(MergeUnit {
                schema,
                order_by: Vec::new(),
                projections: Vec::new(),
                upstream_producers: 0,
            }),
        }
    }

    pub fn with_downstream(mut self, downstream: Downstream) -> Self {
        self.downstream = downstream;
        self
    }

    pub fn with_projections(mut self, projections: Vec<Projection>) -> Self {
        match &mut self.kind {
            UnitKind::Collect(c) => c.projections = projections,
            UnitKind::Merge(m) => m.projections = projections,
        }
        self
    }

    /// Order the rows of a merge unit. No-op for collects.
    pub fn with_order_by(mut self, order_by: Vec<SortKey>) -> Self {
        if let UnitKind::Merge(m) = &mut self.kind {
            m.order_by = order_by;
        }
        self
    }

    /// Mark a collect unit as feeding a later fetch phase. No-op for merges.
    pub fn keep_context_for_fetcher(mut self) -> Self {
        if let UnitKind::Collect(c) = &mut self.kind {
            c.keep_context_for_fetcher = true;
        }
        self
    }

    /// Whether the unit produces rows from a source rather than merging.
    pub fn is_data_producer(&self) -> bool {
        matches!(self.kind, UnitKind::Collect(_))
    }

    pub fn as_collect(&self) -> Option<&CollectUnit> {
        match &self.kind {
            UnitKind::Collect(c) => Some(c),
            UnitKind::Merge(_) => None,
        }
    }

    pub fn as_merge(&self) -> Option<&MergeUnit> {
        match &self.kind {
            UnitKind::Merge(m) => Some(m),
            UnitKind::Collect(_) => None,
        }
    }

    /// Merge spec of a node-hosted merge unit, keyed by the unit's own id.
    pub fn hosted_merge_spec(&self) -> Option<MergeSpec> {
        let merge = self.as_merge()?;
        Some(MergeSpec {
            unit_id: self.id,
            schema: merge.schema.clone(),
            order_by: merge.order_by.clone(),
            limit: None,
            offset: 0,
            projections: merge.projections.clone(),
        })
    }

    pub fn has_direct_response(&self) -> bool {
        self.downstream == Downstream::DirectResponse
    }

    pub fn push_target(&self) -> Option<UnitId> {
        match self.downstream {
            Downstream::Push { target } => Some(target),
            _ => None,
        }
    }

    /// Whether the node-side context outlives the job request and has to
    /// be closed explicitly when the job fails. Hosted merges wait for
    /// pushes that may never come once the job failed.
    pub fn requires_explicit_close(&self) -> bool {
        match &self.kind {
            UnitKind::Collect(c) => c.keep_context_for_fetcher,
            UnitKind::Merge(_) => true,
        }
    }

    pub fn projections(&self) -> &[Projection] {
        match &self.kind {
            UnitKind::Collect(c) => &c.projections,
            UnitKind::Merge(m) => &m.projections,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            UnitKind::Collect(_) => "Collect",
            UnitKind::Merge(_) => "Merge",
        }
    }
}
