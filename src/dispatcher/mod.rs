//! Worker pool
//!
//! The dispatcher polls the shared store, claims as many READY entries as it
//! has free workers, and runs each claim on its own task. A worker handles
//! exactly one entry: mark RUNNING, resolve params, call the executor under
//! the node's timeout, then record the outcome. Store failures fail closed:
//! a failed tick pauses all claiming behind backoff, and a failed worker
//! write halts dispatch for that run.

mod executor;
mod params;
mod shell;

pub use executor::{ExecutionRequest, Executor, ExecutorError};
pub use params::{ParamError, ParamResolver, TemplateParamResolver};
pub use shell::{EX_TEMPFAIL, ShellExecutor};

use crate::config::FlowschedConfig;
use crate::error::{Result, SchedulerError};
use crate::lifecycle::LifecycleManager;
use crate::retry::{BackoffPolicy, NodeFailure, RetryController};
use crate::scheduler::Scheduler;
use crate::signals::CancellationToken;
use crate::store::{ExecutionRecord, ScheduleEntry, SqliteStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub pool_size: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &FlowschedConfig) -> Self {
        Self {
            worker_id: config.scheduler.resolved_worker_id(),
            pool_size: config.workers.pool_size,
            batch_size: config.scheduler.batch_size,
            poll_interval: config.scheduler.poll_interval(),
            shutdown_grace: config.workers.shutdown_grace(),
        }
    }
}

/// State shared by the dispatch loop and its workers
struct WorkerContext {
    store: Arc<SqliteStore>,
    lifecycle: Arc<LifecycleManager>,
    retry: RetryController,
    executor: Arc<dyn Executor>,
    params: Arc<dyn ParamResolver>,
    worker_id: String,
    /// Runs this process stopped dispatching after a store failure
    halted: Mutex<HashSet<i64>>,
    /// entry id -> execution id
    in_flight: Mutex<HashMap<i64, i64>>,
    /// Fired when the shutdown grace period runs out
    abort: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerContext {
    fn halt(&self, execution_id: i64, err: &SchedulerError) {
        error!(execution_id, error = %err, "store failure; halting dispatch for execution");
        lock(&self.halted).insert(execution_id);
    }

    fn is_halted(&self, execution_id: i64) -> bool {
        lock(&self.halted).contains(&execution_id)
    }

    fn in_flight_runs(&self) -> Vec<i64> {
        let mut runs: Vec<i64> = lock(&self.in_flight).values().copied().collect();
        runs.sort_unstable();
        runs.dedup();
        runs
    }
}

pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    scheduler: Scheduler,
    pool: Arc<Semaphore>,
    config: DispatcherConfig,
    store_backoff: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        retry: RetryController,
        executor: Arc<dyn Executor>,
        params: Arc<dyn ParamResolver>,
        config: DispatcherConfig,
    ) -> Self {
        let store = lifecycle.store().clone();
        let pool_size = config.pool_size.max(1);
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            lifecycle,
            retry,
            executor,
            params,
            worker_id: config.worker_id.clone(),
            halted: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            abort: CancellationToken::new(),
        });
        let store_backoff = BackoffPolicy {
            initial_delay: config.poll_interval,
            max_delay: Duration::from_secs(30).max(config.poll_interval),
            backoff_multiplier: 2.0,
            jitter: true,
        };
        Self {
            scheduler: Scheduler::new(store, config.worker_id.clone(), config.batch_size),
            ctx,
            pool: Arc::new(Semaphore::new(pool_size)),
            config,
            store_backoff,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Number of entries currently being worked on by this process
    pub fn in_flight(&self) -> usize {
        lock(&self.ctx.in_flight).len()
    }

    /// One scheduling pass; returns the number of entries dispatched
    pub fn tick(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        let now = Utc::now();
        for execution_id in self.ctx.lifecycle.expire_overdue(now)? {
            warn!(execution_id, "execution timed out");
        }
        let recovered = self.ctx.retry.requeue_abandoned(now)?;
        if recovered > 0 {
            info!(recovered, "recovered abandoned claims");
        }

        let in_flight_runs = self.ctx.in_flight_runs();
        if !in_flight_runs.is_empty() {
            for execution_id in self.ctx.lifecycle.sync_signals(&in_flight_runs)? {
                debug!(execution_id, "execution terminated elsewhere; cancelling local work");
            }
        }

        let capacity = self.pool.available_permits();
        if capacity == 0 {
            return Ok(0);
        }
        let halted = lock(&self.ctx.halted).clone();
        let claimed = self.scheduler.claim_batch(capacity, &halted)?;

        let mut dispatched = 0;
        for entry in claimed {
            let Ok(permit) = self.pool.clone().try_acquire_owned() else {
                // Pool filled between counting and claiming
                self.ctx.store.release_claim(entry.id, &self.ctx.worker_id)?;
                continue;
            };
            lock(&self.ctx.in_flight).insert(entry.id, entry.execution_id);
            tasks.spawn(run_worker(self.ctx.clone(), entry, permit));
            dispatched += 1;
        }
        if dispatched > 0 {
            debug!(dispatched, worker_id = %self.ctx.worker_id, "dispatched entries");
        }
        Ok(dispatched)
    }

    /// Work until `shutdown` fires, then drain
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            pool_size = self.config.pool_size,
            "dispatcher started"
        );
        let mut tasks = JoinSet::new();
        self.drive(&mut tasks, &shutdown, None).await?;
        self.drain(tasks).await;
        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
        Ok(())
    }

    /// Work until `execution_id` reaches a terminal status and its workers finish
    pub async fn run_until_terminal(
        &self,
        execution_id: i64,
        shutdown: CancellationToken,
    ) -> Result<ExecutionRecord> {
        let mut tasks = JoinSet::new();
        let outcome = self.drive(&mut tasks, &shutdown, Some(execution_id)).await;
        self.drain(tasks).await;
        outcome?;
        if self.ctx.is_halted(execution_id) {
            return Err(SchedulerError::DispatchHalted(execution_id));
        }
        self.ctx.store.get_execution(execution_id)
    }

    async fn drive(
        &self,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
        until: Option<i64>,
    ) -> Result<()> {
        let mut store_failures = 0u32;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let delay = match self.tick(tasks) {
                Ok(_) => {
                    store_failures = 0;
                    self.config.poll_interval
                }
                Err(e) if e.is_store_failure() => {
                    let delay = self.store_backoff.delay_for_attempt(store_failures);
                    store_failures = store_failures.saturating_add(1);
                    error!(error = %e, retry_in = ?delay, "store failure; claiming paused");
                    delay
                }
                Err(e) => {
                    error!(error = %e, "scheduling pass failed");
                    self.config.poll_interval
                }
            };

            if let Some(execution_id) = until {
                if self.ctx.is_halted(execution_id) {
                    return Ok(());
                }
                if tasks.is_empty() && store_failures == 0 {
                    let record = self.ctx.store.get_execution(execution_id)?;
                    if record.status.is_terminal() {
                        return Ok(());
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() && store_failures == 0 => {
                    log_join(joined);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Let in-flight workers finish within the grace period, then abort them
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            in_flight = tasks.len(),
            grace = ?self.config.shutdown_grace,
            "draining in-flight work"
        );

        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => return,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(in_flight = tasks.len(), "shutdown grace elapsed; cancelling in-flight work");
        self.ctx.abort.cancel();
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "worker task failed");
    }
}

async fn run_worker(ctx: Arc<WorkerContext>, entry: ScheduleEntry, _permit: OwnedSemaphorePermit) {
    if let Err(e) = process_entry(&ctx, &entry).await {
        if e.is_store_failure() {
            ctx.halt(entry.execution_id, &e);
        } else {
            error!(
                execution_id = entry.execution_id,
                node_id = %entry.node_id,
                error = %e,
                "worker failed"
            );
        }
    }
    lock(&ctx.in_flight).remove(&entry.id);
}

/// Run store work on the blocking pool
///
/// Each call holds the connection for at most one `busy_timeout` wait per
/// statement; keeping it off the runtime lets timers and cancellation
/// watchers of other workers run meanwhile.
async fn on_store<T, F>(ctx: &Arc<WorkerContext>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&WorkerContext) -> Result<T> + Send + 'static,
{
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || call(&ctx))
        .await
        .map_err(|_| SchedulerError::StorePoisoned)?
}

async fn charge_failure(
    ctx: &Arc<WorkerContext>,
    entry: &ScheduleEntry,
    failure: NodeFailure,
) -> Result<()> {
    let entry = entry.clone();
    on_store(ctx, move |ctx| {
        ctx.retry
            .handle_failure(&entry, Some(&ctx.worker_id), failure)
            .map(|_| ())
    })
    .await
}

async fn process_entry(ctx: &Arc<WorkerContext>, entry: &ScheduleEntry) -> Result<()> {
    let execution_id = entry.execution_id;
    let entry_id = entry.id;
    let worker_id = ctx.worker_id.as_str();

    let started = on_store(ctx, move |ctx| {
        if !ctx.store.mark_running(entry_id, &ctx.worker_id)? {
            return Ok(None);
        }
        ctx.store.get_execution(execution_id).map(Some)
    })
    .await?;
    let Some(execution) = started else {
        debug!(entry_id, node_id = %entry.node_id, "claim gone before start");
        return Ok(());
    };
    let run_signal = ctx.lifecycle.signal_for(execution_id);

    let params = match ctx.params.resolve(&entry.snapshot.params, &execution.trigger_data) {
        Ok(params) => params,
        Err(e) => {
            let failure = NodeFailure::Failed {
                message: e.to_string(),
                output: None,
            };
            return charge_failure(ctx, entry, failure).await;
        }
    };

    let request = ExecutionRequest::for_entry(entry, params);
    info!(
        execution_id,
        node_id = %entry.node_id,
        entry_id,
        worker_id,
        attempt = entry.attempt,
        "node started"
    );

    // Fired by run termination or pool abort; the executor is expected to stop
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        let run_signal = run_signal.clone();
        let abort = ctx.abort.clone();
        async move {
            tokio::select! {
                _ = run_signal.cancelled() => {}
                _ = abort.cancelled() => {}
            }
            cancel.cancel();
        }
    };
    let call = tokio::time::timeout(request.timeout, ctx.executor.execute(&request, cancel.clone()));
    tokio::pin!(call);
    let result = tokio::select! {
        result = &mut call => result,
        _ = watcher => (&mut call).await,
    };

    match result {
        Ok(Ok(output)) => {
            let completed = on_store(ctx, move |ctx| {
                let Some(outcome) = ctx.store.complete_success(entry_id, &ctx.worker_id, &output)?
                else {
                    return Ok(None);
                };
                ctx.lifecycle.finalize(execution_id)?;
                Ok(Some(outcome))
            })
            .await?;
            match completed {
                Some(outcome) => {
                    info!(
                        execution_id,
                        node_id = %entry.node_id,
                        newly_ready = ?outcome.newly_ready,
                        "node succeeded"
                    );
                }
                None => {
                    debug!(execution_id, node_id = %entry.node_id, "completion discarded; claim no longer held");
                }
            }
        }
        Ok(Err(ExecutorError::Cancelled)) if run_signal.is_cancelled() => {
            debug!(execution_id, node_id = %entry.node_id, "node cancelled with its execution");
        }
        Ok(Err(ExecutorError::Cancelled)) if ctx.abort.is_cancelled() => {
            let released =
                on_store(ctx, move |ctx| ctx.store.release_claim(entry_id, &ctx.worker_id)).await?;
            if released {
                info!(execution_id, node_id = %entry.node_id, "claim released on shutdown");
            }
        }
        Ok(Err(e)) => {
            let failure = NodeFailure::from_executor_error(e, entry.timeout_seconds);
            charge_failure(ctx, entry, failure).await?;
        }
        Err(_elapsed) => {
            let failure = NodeFailure::TimedOut {
                timeout_seconds: entry.timeout_seconds,
            };
            charge_failure(ctx, entry, failure).await?;
        }
    }
    Ok(())
}
