//! Retry and early-termination decisions for one in-flight call.
//!
//! # Responsibilities
//! - Stop waiting once the caller has what it needs
//! - Terminate early when enough partitions answered and stragglers are late
//! - Retry late partitions on a backup provider of the same replica
//! - Keep retries inside the per-biz rate budget
//!
//! # Design Decisions
//! - Never performs I/O; dispatch goes back through `CallContext`
//! - A partition is retried at most once per call
//! - A degraded replica refuses retries, so retries never amplify a storm

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::{FlowControlPolicy, MiscConfig};
use crate::load_balancer::{CallPlan, MatchTags, Provider, ProviderSelector};
use crate::observability::metrics;
use crate::resilience::rate_limit::RetryRateLimiter;
use crate::topology::{NodeId, TopologySnapshot};

/// Where the call stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Waiting,
    Retrying,
    EarlyTerminated,
    Done,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::EarlyTerminated | Self::Done)
    }
}

/// Replies received so far.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReplySummary {
    pub total: usize,
    pub answered: usize,
    /// Mean latency of the answered partitions.
    pub avg_latency: Duration,
    /// Time since the call started.
    pub elapsed: Duration,
}

impl ReplySummary {
    pub fn answered_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.answered as f64 / self.total as f64
    }
}

/// A partition still waiting for its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPartition {
    pub partition_id: u32,
    /// Provider the request went to.
    pub provider_id: NodeId,
    /// Hash source used to spread backup choices.
    pub source: u64,
    pub elapsed: Duration,
}

/// The in-flight call, as seen by the coordinator.
pub trait CallContext: Send + Sync {
    /// The caller already has every reply it needs.
    fn can_terminate(&self) -> bool;

    /// Caller-side approval to stop waiting for stragglers.
    fn accept_early_termination(&self) -> bool {
        true
    }

    fn reply_summary(&self) -> ReplySummary;

    fn pending_partitions(&self) -> Vec<PendingPartition>;

    /// Send the request of `partition_id` again, to `provider`.
    fn dispatch_retry(&self, partition_id: u32, provider: Arc<Provider>);
}

/// Drives one call's wait, retry and early-termination decisions.
#[derive(Debug)]
pub struct RetryCoordinator {
    biz_name: String,
    snapshot: Arc<TopologySnapshot>,
    policy: Arc<FlowControlPolicy>,
    misc: Arc<MiscConfig>,
    limiter: Arc<RetryRateLimiter>,
    tags: Option<MatchTags>,
    retried: Mutex<HashSet<u32>>,
    state: Mutex<CoordinatorState>,
}

impl RetryCoordinator {
    pub fn new(
        biz_name: &str,
        snapshot: Arc<TopologySnapshot>,
        policy: Arc<FlowControlPolicy>,
        misc: Arc<MiscConfig>,
        limiter: Arc<RetryRateLimiter>,
    ) -> Self {
        Self {
            biz_name: biz_name.to_string(),
            snapshot,
            policy,
            misc,
            limiter,
            tags: None,
            retried: Mutex::new(HashSet::new()),
            state: Mutex::new(CoordinatorState::Waiting),
        }
    }

    /// Coordinator for a plan produced by `selector`; `None` without a topology.
    pub fn for_plan(selector: &ProviderSelector, plan: &CallPlan, limiter: Arc<RetryRateLimiter>) -> Option<Self> {
        let snapshot = selector.topology().current()?;
        Some(Self::new(
            &plan.biz_name,
            snapshot,
            selector.policies().get(&plan.biz_name),
            selector.topology().misc(),
            limiter,
        ))
    }

    /// Backups must carry these tags.
    pub fn with_tags(mut self, tags: MatchTags) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Partitions retried so far.
    pub fn retried_partitions(&self) -> Vec<u32> {
        let mut retried: Vec<u32> = self.retried.lock().iter().copied().collect();
        retried.sort_unstable();
        retried
    }

    /// Inspect the call once and act on it.
    pub fn poll(&self, ctx: &dyn CallContext) -> CoordinatorState {
        let current = self.state();
        if current.is_terminal() {
            return current;
        }
        let next = self.decide(ctx, current);
        if next != current {
            tracing::debug!(biz = %self.biz_name, from = ?current, to = ?next, "Call state changed");
        }
        *self.state.lock() = next;
        next
    }

    fn decide(&self, ctx: &dyn CallContext, current: CoordinatorState) -> CoordinatorState {
        if ctx.can_terminate() {
            return CoordinatorState::Done;
        }

        let summary = ctx.reply_summary();
        if summary.total == 0 || summary.answered >= summary.total {
            return CoordinatorState::Done;
        }
        let fraction = summary.answered_fraction();
        let policy = &self.policy;

        if policy.early_termination_enabled() && summary.answered > 0 && fraction >= policy.et_trigger_percent {
            let wait = wait_threshold(summary.avg_latency, policy.et_wait_time_factor, policy.et_min_wait_ms);
            if summary.elapsed >= wait && ctx.accept_early_termination() {
                tracing::debug!(
                    biz = %self.biz_name,
                    answered = summary.answered,
                    total = summary.total,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "Early terminating call"
                );
                return CoordinatorState::EarlyTerminated;
            }
        }

        let dispatched = match retry_wait(&summary, fraction, policy) {
            Some(wait) => self.retry_late(ctx, wait),
            None => 0,
        };

        if dispatched > 0 || current == CoordinatorState::Retrying {
            CoordinatorState::Retrying
        } else {
            CoordinatorState::Waiting
        }
    }

    fn retry_late(&self, ctx: &dyn CallContext, wait: Duration) -> usize {
        let mut dispatched = 0;
        for pending in ctx.pending_partitions() {
            if pending.elapsed < wait || self.retried.lock().contains(&pending.partition_id) {
                continue;
            }
            let Some(replica) = self.snapshot.replica_of(pending.provider_id) else {
                tracing::warn!(
                    biz = %self.biz_name,
                    partition = pending.partition_id,
                    provider = pending.provider_id,
                    "Pending partition's provider is not in the snapshot"
                );
                continue;
            };
            let Some(backup) = replica.backup_provider(
                pending.source,
                pending.provider_id,
                self.tags.as_ref(),
                &self.policy,
                &self.misc,
            ) else {
                continue;
            };
            if !self.limiter.try_acquire(&self.biz_name, self.policy.retry_rate_limit) {
                tracing::debug!(biz = %self.biz_name, partition = pending.partition_id, "Retry rate limited");
                continue;
            }
            self.retried.lock().insert(pending.partition_id);
            backup.counters().record_retry();
            tracing::debug!(
                biz = %self.biz_name,
                partition = pending.partition_id,
                backup = %backup.spec(),
                "Retrying late partition"
            );
            ctx.dispatch_retry(pending.partition_id, backup);
            dispatched += 1;
        }
        dispatched
    }

    /// Poll every `interval` until a terminal state or shutdown.
    pub async fn run(
        &self,
        ctx: Arc<dyn CallContext>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> CoordinatorState {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = self.poll(ctx.as_ref());
                    if state.is_terminal() {
                        metrics::record_call_finished(&self.biz_name, state);
                        return state;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(biz = %self.biz_name, "Retry coordinator received shutdown signal");
                    let state = self.state();
                    metrics::record_call_finished(&self.biz_name, state);
                    return state;
                }
            }
        }
    }
}

/// How long a pending partition waits before it is retried; `None` when no retry may fire.
///
/// With replies in hand the wait scales with their mean latency. With none,
/// there is no latency to scale, so only `retry_min_wait_ms` can trigger.
fn retry_wait(summary: &ReplySummary, fraction: f64, policy: &FlowControlPolicy) -> Option<Duration> {
    if !policy.retry_enabled() {
        return None;
    }
    if summary.answered == 0 {
        return (policy.retry_min_wait_ms > 0).then(|| Duration::from_millis(policy.retry_min_wait_ms));
    }
    (fraction >= policy.retry_trigger_percent).then(|| {
        wait_threshold(summary.avg_latency, policy.retry_wait_time_factor, policy.retry_min_wait_ms)
    })
}

fn wait_threshold(avg_latency: Duration, factor: f64, min_wait_ms: u64) -> Duration {
    avg_latency
        .mul_f64(factor.max(0.0))
        .max(Duration::from_millis(min_wait_ms))
}
