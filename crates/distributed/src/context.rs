//! Per-process registry of live job contexts.
//!
//! On the coordinating node a job context owns the merge stages that push
//! deliveries are routed to. Any node may also host merge units of a job
//! and keep collect outputs for a later fetch phase, until they are taken
//! or closed.
//!
//! A retained output is reserved before its collect starts, so a close
//! racing with the collect finds the reservation and the late output is
//! dropped. A close that arrives before the reservation is remembered and
//! turns the reservation down.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use fanout_common::{FanoutError, JobId, Result, UnitId, global_metrics};
use fanout_execution::Bucket;
use tracing::debug;

use crate::merge::{MergeStage, Paging};
use crate::transport::{PushAck, PushDelivery, PushPayload};

/// Closes remembered for units that had no context yet.
const MAX_EARLY_CLOSES: usize = 1024;

/// State of one job on this node.
#[derive(Debug)]
pub struct JobContext {
    job_id: JobId,
    merges: Mutex<HashMap<UnitId, Arc<MergeStage>>>,
    /// `None` while the collect is still running.
    retained: Mutex<HashMap<UnitId, Option<Bucket>>>,
}

impl JobContext {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            merges: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn merge_stage(&self, unit: UnitId) -> Option<Arc<MergeStage>> {
        self.lock_merges().get(&unit).cloned()
    }

    /// Units whose output is retained and ready to be taken.
    pub fn retained_units(&self) -> Vec<UnitId> {
        let mut units = self
            .lock_retained()
            .iter()
            .filter(|(_, bucket)| bucket.is_some())
            .map(|(unit, _)| *unit)
            .collect::<Vec<_>>();
        units.sort();
        units
    }

    fn lock_merges(&self) -> MutexGuard<'_, HashMap<UnitId, Arc<MergeStage>>> {
        self.merges.lock().expect("job context lock poisoned")
    }

    fn lock_retained(&self) -> MutexGuard<'_, HashMap<UnitId, Option<Bucket>>> {
        self.retained.lock().expect("job context lock poisoned")
    }

    fn is_idle(&self) -> bool {
        self.lock_merges().is_empty() && self.lock_retained().is_empty()
    }
}

type ContextMap = HashMap<JobId, Arc<JobContext>>;

/// Lock order: the context map first, then a context's own locks.
#[derive(Debug, Default)]
pub struct JobContextService {
    contexts: Mutex<ContextMap>,
    closed_early: Mutex<VecDeque<(JobId, UnitId)>>,
}

impl JobContextService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the coordinator-side context of `job_id`, routing pushes
    /// by each stage's merge unit id.
    pub fn create_job(
        &self,
        job_id: JobId,
        stages: &[Arc<MergeStage>],
    ) -> Result<Arc<JobContext>> {
        let mut contexts = self.lock_contexts();
        if contexts.contains_key(&job_id) {
            return Err(FanoutError::InvalidConfig(format!(
                "job context {job_id} already exists"
            )));
        }
        let merges = stages
            .iter()
            .map(|s| (s.spec().unit_id, Arc::clone(s)))
            .collect::<HashMap<_, _>>();
        if merges.len() != stages.len() {
            return Err(FanoutError::InvalidConfig(format!(
                "job {job_id} declares the same merge unit id for several groups"
            )));
        }
        let ctx = Arc::new(JobContext::new(job_id));
        *ctx.lock_merges() = merges;
        contexts.insert(job_id, Arc::clone(&ctx));
        Ok(ctx)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Arc<JobContext>> {
        self.lock_contexts().get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host the merge stage of a merge unit, keyed by `stage.spec().unit_id`.
    pub fn register_merge(&self, job_id: JobId, stage: Arc<MergeStage>) -> Result<()> {
        let unit = stage.spec().unit_id;
        let mut contexts = self.lock_contexts();
        if self.take_early_close(job_id, unit) {
            return Err(FanoutError::Execution(format!(
                "merge unit {unit} of job {job_id} was closed before it started"
            )));
        }
        let ctx = context_entry(&mut contexts, job_id);
        let mut merges = ctx.lock_merges();
        if merges.contains_key(&unit) {
            return Err(FanoutError::InvalidConfig(format!(
                "job {job_id} already hosts merge unit {unit}"
            )));
        }
        merges.insert(unit, stage);
        Ok(())
    }

    /// Stop routing pushes to a hosted merge unit.
    pub fn release_merge(&self, job_id: &JobId, unit: UnitId) {
        let mut contexts = self.lock_contexts();
        if let Some(ctx) = contexts.get(job_id) {
            ctx.lock_merges().remove(&unit);
        }
        remove_if_idle(&mut contexts, job_id);
    }

    /// Stop routing pushes to the given merge units, leaving retained
    /// outputs and other hosted merges of the job alone.
    pub fn release_merges(&self, job_id: &JobId, units: impl IntoIterator<Item = UnitId>) {
        let mut contexts = self.lock_contexts();
        if let Some(ctx) = contexts.get(job_id) {
            let mut merges = ctx.lock_merges();
            for unit in units {
                merges.remove(&unit);
            }
        }
        remove_if_idle(&mut contexts, job_id);
    }

    /// Reserve the retained output of `unit` before its collect starts.
    ///
    /// Returns `false` if the unit was closed already; its output must
    /// then not be retained.
    pub fn reserve(&self, job_id: JobId, unit: UnitId) -> bool {
        let mut contexts = self.lock_contexts();
        if self.take_early_close(job_id, unit) {
            debug!(job_id = %job_id, unit = %unit, "context closed before collect started");
            return false;
        }
        context_entry(&mut contexts, job_id)
            .lock_retained()
            .insert(unit, None);
        true
    }

    /// Fill a reservation. Returns `false` and drops `bucket` if the
    /// reservation was closed meanwhile.
    pub fn retain(&self, job_id: JobId, unit: UnitId, bucket: Bucket) -> bool {
        let contexts = self.lock_contexts();
        let stored = contexts.get(&job_id).is_some_and(|ctx| {
            let mut retained = ctx.lock_retained();
            match retained.get_mut(&unit) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(bucket);
                    true
                }
                _ => false,
            }
        });
        if !stored {
            debug!(job_id = %job_id, unit = %unit, "retained output dropped, context closed");
        }
        stored
    }

    /// Give up a reservation whose collect failed.
    pub fn discard_pending(&self, job_id: &JobId, unit: UnitId) {
        let mut contexts = self.lock_contexts();
        if let Some(ctx) = contexts.get(job_id) {
            let mut retained = ctx.lock_retained();
            if retained.get(&unit).is_some_and(Option::is_none) {
                retained.remove(&unit);
            }
        }
        remove_if_idle(&mut contexts, job_id);
    }

    /// Hand a retained output to the fetch phase, closing its context.
    pub fn take_retained(&self, job_id: &JobId, unit: UnitId) -> Option<Bucket> {
        let mut contexts = self.lock_contexts();
        let bucket = contexts.get(job_id).and_then(|ctx| {
            let mut retained = ctx.lock_retained();
            if retained.get(&unit).is_some_and(Option::is_some) {
                retained.remove(&unit).flatten()
            } else {
                None
            }
        });
        remove_if_idle(&mut contexts, job_id);
        bucket
    }

    /// Close the retained output or hosted merge of `unit`.
    ///
    /// Unknown units answer `false` and are remembered, so that a collect
    /// or merge of that unit starting later is turned down.
    pub fn close_context(&self, job_id: &JobId, unit: UnitId) -> bool {
        let mut contexts = self.lock_contexts();
        let (retained, merge) = match contexts.get(job_id) {
            Some(ctx) => (
                ctx.lock_retained().remove(&unit).is_some(),
                ctx.lock_merges().remove(&unit),
            ),
            None => (false, None),
        };
        remove_if_idle(&mut contexts, job_id);
        let closed = retained || merge.is_some();
        if !closed {
            self.remember_early_close(*job_id, unit);
        }
        drop(contexts);
        if let Some(stage) = merge {
            stage.abort(FanoutError::Execution(format!(
                "merge unit {unit} of job {job_id} was closed"
            )));
        }
        debug!(job_id = %job_id, unit = %unit, closed, "close context");
        closed
    }

    /// Route a pushed page into the addressed merge stage.
    ///
    /// Pages for a job that is already gone are answered with
    /// `need_more = false`; an unknown merge unit of a live job is a
    /// protocol violation.
    pub fn route_push(&self, delivery: PushDelivery) -> Result<PushAck> {
        let Some(ctx) = self.get(&delivery.job_id) else {
            debug!(
                job_id = %delivery.job_id,
                target = %delivery.target,
                "push for unknown job ignored"
            );
            return Ok(PushAck { need_more: false });
        };
        let stage = ctx.merge_stage(delivery.target).ok_or_else(|| {
            FanoutError::ProtocolViolation(format!(
                "job {} has no merge unit {}",
                delivery.job_id, delivery.target
            ))
        })?;
        match delivery.payload {
            PushPayload::Page { bucket, is_last } => {
                global_metrics().inc_buckets_received("push");
                let bucket = match stage.streamers().decode(&bucket) {
                    Ok(bucket) => bucket,
                    Err(err) => {
                        stage.fail(delivery.producer_index, err.clone());
                        return Err(err);
                    }
                };
                let paging = stage.supply(delivery.producer_index, bucket, is_last)?;
                Ok(PushAck {
                    need_more: paging == Paging::NeedMore,
                })
            }
            PushPayload::Failure { message } => {
                stage.fail(
                    delivery.producer_index,
                    FanoutError::LocalExecution(message),
                );
                Ok(PushAck { need_more: false })
            }
        }
    }

    fn lock_contexts(&self) -> MutexGuard<'_, ContextMap> {
        self.contexts.lock().expect("job contexts lock poisoned")
    }

    fn remember_early_close(&self, job_id: JobId, unit: UnitId) {
        let mut closed = self.closed_early.lock().expect("early closes lock poisoned");
        if closed.len() == MAX_EARLY_CLOSES {
            closed.pop_front();
        }
        closed.push_back((job_id, unit));
    }

    fn take_early_close(&self, job_id: JobId, unit: UnitId) -> bool {
        let mut closed = self.closed_early.lock().expect("early closes lock poisoned");
        match closed.iter().position(|entry| *entry == (job_id, unit)) {
            Some(pos) => closed.remove(pos).is_some(),
            None => false,
        }
    }
}

fn context_entry(contexts: &mut ContextMap, job_id: JobId) -> &Arc<JobContext> {
    contexts
        .entry(job_id)
        .or_insert_with(|| Arc::new(JobContext::new(job_id)))
}

fn remove_if_idle(contexts: &mut ContextMap, job_id: &JobId) {
    if contexts.get(job_id).is_some_and(|ctx| ctx.is_idle()) {
        contexts.remove(job_id);
    }
}
