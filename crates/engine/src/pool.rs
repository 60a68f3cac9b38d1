//! Bounded worker pool.
//!
//! Uses a tokio Semaphore to limit how many actions run at once. Each action
//! runs in its own task and applies its store mutation the moment it
//! succeeds, so a periodic flush always captures completed work.

use crate::concurrency::ConcurrencyPlan;
use crate::interrupt::InterruptController;
use crate::resolve::{Action, Interruption, PlannedAction};
use crate::store::FingerprintStore;
use crate::summary::{Outcome, RunSummary};
use crate::worker::{self, ActionError, WorkerContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(plan: ConcurrencyPlan) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(plan.workers.max(1))),
        }
    }

    /// Run every action, recording each outcome in `summary`.
    ///
    /// Admission stops at the first interrupt; actions never admitted are
    /// counted as interrupted. Returns once every admitted action has ended.
    pub async fn execute(
        &self,
        actions: Vec<PlannedAction>,
        ctx: Arc<WorkerContext>,
        controller: &InterruptController,
        summary: &mut RunSummary,
    ) {
        let token = controller.token();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<String, Action> = HashMap::new();

        let mut queue = actions.into_iter();
        while let Some(planned) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.record(&planned.key, planned.action, Outcome::Interrupted);
                break;
            };

            in_flight.insert(planned.key.clone(), planned.action);
            let ctx = ctx.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let outcome = run_one(&ctx, &planned, &token).await;
                drop(permit);
                (planned.key, planned.action, outcome)
            });
        }

        let not_admitted: Vec<PlannedAction> = queue.collect();
        if !not_admitted.is_empty() {
            info!(count = not_admitted.len(), "Interrupted before starting remaining actions");
        }
        for planned in not_admitted {
            summary.record(&planned.key, planned.action, Outcome::Interrupted);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, action, outcome)) => {
                    in_flight.remove(&key);
                    summary.record(&key, action, outcome);
                }
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
        // Whatever is left belongs to a task that panicked
        for (key, action) in in_flight {
            summary.record(&key, action, Outcome::Failed("worker task panicked".to_string()));
        }
    }
}

/// Execute one action and apply its mutation.
async fn run_one(ctx: &WorkerContext, planned: &PlannedAction, token: &CancellationToken) -> Outcome {
    let result = match planned.action.interruption() {
        Interruption::MustTerminate => {
            tokio::select! {
                biased;
                result = worker::execute(ctx, planned) => result,
                _ = token.cancelled() => Err(ActionError::Interrupted),
            }
        }
        Interruption::Cooperative => worker::execute(ctx, planned).await,
    };

    match result {
        Ok(effect) => {
            if let Err(e) = ctx.store.apply([effect.mutation]) {
                warn!(key = %planned.key, error = %e, "Result not recorded");
                return Outcome::Failed(e.to_string());
            }
            match effect.problem {
                None => {
                    debug!(key = %planned.key, action = planned.action.as_str(), "Done");
                    Outcome::Succeeded
                }
                Some(problem) => {
                    warn!(key = %planned.key, action = planned.action.as_str(), problem = %problem, "Completed with a problem");
                    Outcome::Failed(problem)
                }
            }
        }
        Err(ActionError::Interrupted) => {
            info!(key = %planned.key, action = planned.action.as_str(), "Interrupted");
            Outcome::Interrupted
        }
        Err(e) => {
            warn!(key = %planned.key, action = planned.action.as_str(), error = %e, "Action failed");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Flush `store` every `period` while it has unsaved changes, until `stop`
/// is cancelled.
pub fn spawn_periodic_flush(
    store: Arc<FingerprintStore>,
    period: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !store.is_dirty() {
                continue;
            }
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.flush()).await {
                Ok(Ok(())) => debug!("Periodic flush"),
                Ok(Err(e)) => warn!(error = %e, "Periodic flush failed"),
                Err(e) => warn!(error = %e, "Periodic flush task failed"),
            }
        }
    })
}
