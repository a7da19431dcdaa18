//! Group membership recomputation.
//!
//! A run clears every membership row, then rebuilds each group from the
//! rolls completed inside its window. Runs are serialized: in process by a
//! mutex, across processes by the store's rebuild lock. Groups are processed
//! as independent tasks and a failing group never aborts its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::RecomputeOptions;
use crate::error::{Error, ErrorKind, Result};
use crate::filter::{apply_threshold, time_window};
use crate::models::{GroupRecord, RollStateSet};
use crate::store::{RollStateStore, Store};

#[derive(Debug, Clone, Serialize)]
pub struct GroupOutcome {
    pub group_id: Uuid,
    pub name: String,
    pub student_count: usize,
    pub roll_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupFailure {
    pub group_id: Uuid,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_groups: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<GroupOutcome>,
    pub failures: Vec<GroupFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

pub struct Recomputer<S> {
    store: Arc<S>,
    options: RecomputeOptions,
    running: Mutex<()>,
}

impl<S: Store + 'static> Recomputer<S> {
    pub fn new(store: Arc<S>, options: RecomputeOptions) -> Self {
        Self {
            store,
            options,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Recomputes every group against the reference instant `now`.
    ///
    /// Only run-level failures (taking the lock, clearing, listing groups)
    /// are returned as `Err`; per-group failures land in the summary.
    /// Dropping the returned future aborts the group tasks and releases
    /// the rebuild lock.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let _running = self.running.lock().await;
        self.store.lock_rebuild().await?;
        let lock = RebuildLock {
            store: Some(Arc::clone(&self.store)),
        };

        let rebuilt = self.rebuild(now).await;
        let unlocked = lock.release().await;

        let summary = rebuilt?;
        unlocked?;
        Ok(summary)
    }

    async fn rebuild(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let cleared = self.store.clear_all().await?;
        let groups = self.store.list_groups().await?;
        tracing::info!(groups = groups.len(), cleared, "Recomputing group membership");

        let permits = Arc::new(Semaphore::new(self.options.max_parallel_groups));
        let group_timeout = self.options.group_timeout;
        let total_groups = groups.len();
        let positions: HashMap<Uuid, usize> = groups
            .iter()
            .enumerate()
            .map(|(position, group)| (group.id, position))
            .collect();

        let mut tasks = JoinSet::new();
        let mut task_groups = HashMap::with_capacity(total_groups);
        for group in groups {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let group_id = group.id;

            let handle = tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    let closed = Error::Task("group permits closed before the group ran".into());
                    return (group_id, Err(closed), Duration::ZERO);
                };
                let started = Instant::now();
                let result =
                    tokio::time::timeout(group_timeout, recompute_group(store.as_ref(), &group, now))
                        .await
                        .unwrap_or(Err(Error::Timeout(group_timeout)));
                (group_id, result, started.elapsed())
            });
            task_groups.insert(handle.id(), group_id);
        }

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let (group_id, result) = match joined {
                Ok((group_id, Ok(outcome), elapsed)) => {
                    tracing::info!(
                        %group_id,
                        students = outcome.student_count,
                        rolls = outcome.roll_count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Group recomputed"
                    );
                    outcomes.push(outcome);
                    continue;
                }
                Ok((group_id, Err(e), _)) => (group_id, e),
                Err(join_err) => match task_groups.get(&join_err.id()) {
                    Some(group_id) => (*group_id, Error::Task(join_err.to_string())),
                    None => return Err(Error::Task(join_err.to_string())),
                },
            };

            tracing::warn!(%group_id, kind = %result.kind(), error = %result, "Group recomputation failed");
            failures.push(GroupFailure {
                group_id,
                error_kind: result.kind(),
                message: result.to_string(),
            });
        }

        outcomes.sort_by_key(|outcome| positions.get(&outcome.group_id).copied());
        failures.sort_by_key(|failure| positions.get(&failure.group_id).copied());

        let summary = RunSummary {
            started_at: now,
            finished_at: Utc::now(),
            total_groups,
            succeeded: outcomes.len(),
            failed: failures.len(),
            outcomes,
            failures,
        };
        tracing::info!(
            total = summary.total_groups,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Recomputation finished"
        );
        Ok(summary)
    }
}

/// Held while a rebuild owns the store lock. If the run is dropped before
/// `release`, the unlock is handed to a background task.
struct RebuildLock<S: Store + 'static> {
    store: Option<Arc<S>>,
}

impl<S: Store + 'static> RebuildLock<S> {
    async fn release(mut self) -> Result<()> {
        match self.store.take() {
            Some(store) => store.unlock_rebuild().await,
            None => Ok(()),
        }
    }
}

impl<S: Store + 'static> Drop for RebuildLock<S> {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.unlock_rebuild().await {
                        tracing::error!(error = %e, "Failed to release abandoned rebuild lock");
                    }
                });
            }
            Err(_) => tracing::error!("Rebuild abandoned outside a runtime; lock not released"),
        }
    }
}

/// Runs one group's pipeline: window, roll selection, aggregation,
/// threshold, then materialization.
async fn recompute_group<S: Store + ?Sized>(
    store: &S,
    group: &GroupRecord,
    now: DateTime<Utc>,
) -> Result<GroupOutcome> {
    let rule = group.rule()?;
    let window = time_window(now, rule.number_of_weeks)?;
    let roll_ids = store.find_completed_between(window).await?;
    let counts = incident_counts(store, &roll_ids, &rule.states).await?;
    let members = apply_threshold(counts, rule.comparison, rule.incidents);

    store.materialize(group.id, &members, now).await?;

    Ok(GroupOutcome {
        group_id: group.id,
        name: group.name.clone(),
        student_count: members.len(),
        roll_count: roll_ids.len(),
    })
}

/// Counts qualifying records per student; no rolls means no query.
async fn incident_counts<S: RollStateStore + ?Sized>(
    store: &S,
    roll_ids: &[Uuid],
    states: &RollStateSet,
) -> Result<HashMap<Uuid, i64>> {
    if roll_ids.is_empty() {
        return Ok(HashMap::new());
    }
    store.aggregate_by_student(roll_ids, states).await
}
