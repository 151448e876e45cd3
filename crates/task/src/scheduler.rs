//! Compile task scheduler
//!
//! Tasks are admitted through [`Scheduler::add_task`], wait in a
//! [`TaskQueue`], and are launched by a single dispatch loop (see
//! [`crate::dispatch`]) up to `max_concurrent` at a time. Results of
//! successful compiles land in the cache, and duplicate work for a key that
//! is already running waits for that run instead of starting another.

use crate::config::SchedulerConfig;
use crate::dispatch;
use crate::inflight::{Claim, InFlight};
use crate::queue::TaskQueue;
use crate::running::{self, DrainingTask, RunOutcome, RunningTask};
use crate::state::{SchedulerState, StateCell};
use dashmap::DashMap;
use futures::FutureExt;
use kiln_cache::{CacheStore, CachedCompile, HashKeyGenerator};
use kiln_core::{
    stop_pair, CommandBridge, CompileRequest, CompileResult, CompileTask, Error, EventBus,
    EventStats, EventSubscriber, HistorySink, PublishedEvent, Result, SchedulerEvent, TaskId,
    TaskStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};

/// Reason recorded on tasks cancelled by [`Scheduler::cancel_task`]
pub const CANCEL_REASON: &str = "cancelled by request";

/// Reason recorded on tasks cancelled by [`Scheduler::shutdown`]
pub const SHUTDOWN_REASON: &str = "scheduler shutdown";

/// Handle to a scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    bridge: Arc<dyn CommandBridge>,
    cache: Option<CacheStore>,
    history: Arc<dyn HistorySink>,
    keys: HashKeyGenerator,
    queue: TaskQueue,
    tasks: DashMap<TaskId, CompileTask>,
    running: DashMap<TaskId, RunningTask>,
    draining: DashMap<TaskId, DrainingTask>,
    inflight: InFlight,
    pub(crate) bus: EventBus,
    state: StateCell,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("bridge", &self.inner.bridge.name())
            .field("running", &self.running_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

impl Scheduler {
    /// Build a scheduler. Nothing runs until [`Scheduler::start`].
    ///
    /// Pass `None` for `cache` to compile every task.
    pub fn new(
        config: SchedulerConfig,
        bridge: Arc<dyn CommandBridge>,
        cache: Option<CacheStore>,
        history: Arc<dyn HistorySink>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = cache.filter(|cache| cache.config().enabled);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                bus: EventBus::new(config.event_capacity),
                config,
                bridge,
                cache,
                history,
                keys: HashKeyGenerator::new(),
                queue: TaskQueue::new(),
                tasks: DashMap::new(),
                running: DashMap::new(),
                draining: DashMap::new(),
                inflight: InFlight::new(),
                state: StateCell::new(SchedulerState::Idle),
                shutdown_tx,
                loop_handle: Mutex::new(None),
            }),
        })
    }

    /// Spawn the dispatch loop. Must be called inside a tokio runtime.
    ///
    /// Starting a scheduler that is already running or paused is a no-op.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner
            .state
            .transition(SchedulerState::Idle, SchedulerState::Running)
        {
            return match inner.state.get() {
                SchedulerState::Running | SchedulerState::Paused => Ok(()),
                state => Err(Error::configuration(format!(
                    "scheduler cannot start while {state}"
                ))),
            };
        }

        let handle = tokio::spawn(dispatch::run(
            Arc::downgrade(inner),
            inner.shutdown_tx.subscribe(),
        ));
        *inner.loop_handle.lock() = Some(handle);

        tracing::info!(
            max_concurrent = inner.config.max_concurrent,
            bridge = inner.bridge.name(),
            cache = inner.cache.is_some(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Cancel everything and halt the dispatch loop.
    ///
    /// Running tasks are signalled to stop, queued and parked tasks are
    /// cancelled. Safe to call repeatedly and with tasks mid-flight.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        loop {
            let current = inner.state.get();
            if matches!(current, SchedulerState::Stopping | SchedulerState::Stopped) {
                return;
            }
            if inner.state.transition(current, SchedulerState::Stopping) {
                break;
            }
        }
        tracing::info!("Scheduler stopping");

        inner.shutdown_tx.send_replace(true);
        let handle = inner.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        let running: Vec<TaskId> = inner.running.iter().map(|entry| *entry.key()).collect();
        for id in running {
            inner.cancel_with_reason(id, SHUTDOWN_REASON);
        }
        for task in inner.inflight.drain_followers() {
            inner.cancel_with_reason(task.id, SHUTDOWN_REASON);
        }
        for task in inner.queue.drain() {
            inner.cancel_with_reason(task.id, SHUTDOWN_REASON);
        }

        inner.state.set(SchedulerState::Stopped);
        tracing::info!("Scheduler stopped");
    }

    /// Alias for [`Scheduler::shutdown`]
    pub async fn stop(&self) {
        self.shutdown().await;
    }

    /// Admit a compile request.
    ///
    /// A cache hit completes the task immediately; otherwise it is queued.
    /// Only malformed requests (or a stopped scheduler) are rejected.
    pub fn add_task(&self, request: CompileRequest) -> Result<TaskId> {
        self.inner.add_task(request)
    }

    /// Alias for [`Scheduler::add_task`]
    pub fn submit(&self, request: CompileRequest) -> Result<TaskId> {
        self.add_task(request)
    }

    /// Cancel a queued or running task. Unknown and finished ids return false.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.inner.cancel_with_reason(id, CANCEL_REASON)
    }

    /// Stop launching new tasks. Running tasks are left alone.
    pub fn pause(&self) -> bool {
        let paused = self
            .inner
            .state
            .transition(SchedulerState::Running, SchedulerState::Paused);
        if paused {
            tracing::info!("Scheduler paused");
            self.inner.bus.publish(SchedulerEvent::ManagerPaused);
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self
            .inner
            .state
            .transition(SchedulerState::Paused, SchedulerState::Running);
        if resumed {
            tracing::info!("Scheduler resumed");
            self.inner.bus.publish(SchedulerEvent::ManagerResumed);
        }
        resumed
    }

    /// Every task this scheduler has seen, oldest first
    pub fn get_all_tasks(&self) -> Vec<CompileTask> {
        let mut tasks: Vec<CompileTask> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub fn get_task(&self, id: TaskId) -> Option<CompileTask> {
        self.inner.tasks.get(&id).map(|entry| entry.value().clone())
    }

    pub fn get_task_state(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.tasks.get(&id).map(|entry| entry.status)
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state.get()
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Queued tasks, including ones parked behind a running duplicate
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len() + self.inner.inflight.parked_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.inner.bus.subscribe()
    }

    pub fn register_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.inner.bus.register_subscriber(subscriber);
    }

    pub fn event_stats(&self) -> EventStats {
        self.inner.bus.stats()
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.inner.cache.as_ref()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Resolve once `id` reaches a terminal state
    pub async fn wait_for(&self, id: TaskId, timeout: Duration) -> Result<CompileTask> {
        let mut events = self.subscribe();
        let poll = self.inner.config.tick_interval;

        let wait = async {
            loop {
                match self.get_task(id) {
                    None => return Err(Error::task_not_found(id)),
                    Some(task) if task.is_terminal() => return Ok(task),
                    Some(_) => {}
                }
                tokio::select! {
                    received = events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = received {
                            tokio::time::sleep(poll).await;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("waiting for task {id}"), timeout))?
    }

    /// Resolve once every known task is terminal
    pub async fn wait_all(&self, timeout: Duration) -> Result<Vec<CompileTask>> {
        let ids: Vec<TaskId> = self.get_all_tasks().iter().map(|t| t.id).collect();
        let deadline = Instant::now() + timeout;
        let mut finished = Vec::with_capacity(ids.len());
        for id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            finished.push(self.wait_for(id, remaining).await?);
        }
        Ok(finished)
    }
}

impl SchedulerInner {
    fn add_task(&self, request: CompileRequest) -> Result<TaskId> {
        request.validate()?;
        let state = self.state.get();
        if !state.accepts_tasks() {
            return Err(Error::validation(format!(
                "scheduler is {state} and no longer accepts tasks"
            )));
        }

        let mut task = CompileTask::admit(request);
        let key = self.keys.generate(&task);
        task.cache_key = Some(key.clone());
        let id = task.id;

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
            task.succeed_from_cache(hit.result)?;
            tracing::info!(task_id = %id, key = %key, "Compile satisfied from cache");
            self.tasks.insert(id, task.clone());
            self.publish_terminal(&task);
            return Ok(id);
        }

        let priority = task.priority;
        self.tasks.insert(id, task.clone());
        // announced before it becomes visible to the dispatch loop
        self.bus
            .publish(SchedulerEvent::TaskAdded { task_id: id, priority });
        if let Err(e) = self.queue.push(task) {
            self.tasks.remove(&id);
            return Err(e);
        }
        tracing::debug!(task_id = %id, %priority, key = %key, "Task queued");
        Ok(id)
    }

    /// One dispatch cycle: finalize finished runs, enforce the timeout, then
    /// fill free slots unless paused
    pub(crate) fn tick(&self) -> Result<()> {
        self.reap_finished();
        self.cancel_overdue();
        if self.state.get().launches_tasks() {
            self.launch_ready()?;
        }
        Ok(())
    }

    fn launch_ready(&self) -> Result<()> {
        while self.running.len() < self.config.max_concurrent {
            let Some(task) = self.queue.pop() else {
                break;
            };
            if self.tasks.get(&task.id).map(|t| t.status) != Some(TaskStatus::Queued) {
                continue;
            }

            if let Some(hit) = task.cache_key.as_deref().and_then(|key| self.late_cache_hit(key)) {
                self.complete_from_shared(task.id, &hit.result);
                continue;
            }

            match self.inflight.claim(task) {
                Claim::Lead(task) => self.launch(task)?,
                Claim::Parked { leader } => {
                    tracing::debug!(%leader, "Duplicate compile parked behind running task");
                }
            }
        }
        Ok(())
    }

    fn launch(&self, task: CompileTask) -> Result<()> {
        let id = task.id;
        let (stop, signal) = stop_pair();

        {
            let Some(mut record) = self.tasks.get_mut(&id) else {
                self.release_followers(task.cache_key.as_deref(), id, None);
                return Err(Error::task_not_found(id));
            };
            if let Err(e) = record.mark_running() {
                drop(record);
                tracing::debug!(task_id = %id, error = %e, "Task left the queue before launch");
                self.release_followers(task.cache_key.as_deref(), id, None);
                return Ok(());
            }
            let snapshot = record.clone();
            self.bus.publish(SchedulerEvent::TaskStarted { task_id: id });
            let handle = tokio::spawn(running::invoke(
                Arc::clone(&self.bridge),
                snapshot,
                signal,
                self.bus.clone(),
            ));
            self.running.insert(
                id,
                RunningTask {
                    handle,
                    stop,
                    started: Instant::now(),
                    cache_key: task.cache_key.clone(),
                },
            );
        }

        tracing::info!(task_id = %id, priority = %task.priority, command = %task.compiler.command, "Compile started");
        Ok(())
    }

    fn reap_finished(&self) {
        let finished: Vec<TaskId> = self
            .running
            .iter()
            .filter(|entry| entry.is_finished())
            .map(|entry| *entry.key())
            .collect();

        for id in finished {
            // unconstrained: the coop budget would otherwise report finished
            // handles as pending once enough have been polled in one tick
            let joined = match self.running.get_mut(&id) {
                Some(mut run) => tokio::task::unconstrained(&mut run.handle).now_or_never(),
                None => continue,
            };
            let Some(joined) = joined else {
                continue;
            };
            let Some((_, run)) = self.running.remove(&id) else {
                continue;
            };
            self.finalize(id, run.cache_key.as_deref(), joined);
        }

        self.reap_draining();
    }

    /// Release the keys of cancelled runs whose bridge has returned, or that
    /// have ignored the stop request for longer than `task_timeout`
    fn reap_draining(&self) {
        let grace = self.config.task_timeout;
        let settled: Vec<(TaskId, bool)> = self
            .draining
            .iter()
            .filter_map(|entry| {
                if entry.handle.is_finished() {
                    Some((*entry.key(), true))
                } else if entry.since.elapsed() > grace {
                    Some((*entry.key(), false))
                } else {
                    None
                }
            })
            .collect();

        for (id, returned) in settled {
            let Some((_, drained)) = self.draining.remove(&id) else {
                continue;
            };
            if returned {
                tracing::debug!(task_id = %id, "Cancelled compile has returned");
            } else {
                tracing::warn!(
                    task_id = %id,
                    grace_ms = grace.as_millis() as u64,
                    "Cancelled compile ignored the stop request, releasing its key"
                );
            }
            self.release_followers(drained.cache_key.as_deref(), id, None);
        }
    }

    fn cancel_overdue(&self) {
        let timeout = self.config.task_timeout;
        let overdue: Vec<TaskId> = self
            .running
            .iter()
            .filter(|entry| !entry.is_finished() && entry.is_overdue(timeout))
            .map(|entry| *entry.key())
            .collect();

        for id in overdue {
            tracing::warn!(task_id = %id, timeout_ms = timeout.as_millis() as u64, "Compile timed out");
            self.cancel_with_reason(id, &format!("timeout after {timeout:?}"));
        }
    }

    /// Apply a finished run to its task and hand the outcome to followers
    fn finalize(
        &self,
        id: TaskId,
        key: Option<&str>,
        joined: std::result::Result<RunOutcome, JoinError>,
    ) {
        let (snapshot, shared) = {
            let Some(mut record) = self.tasks.get_mut(&id) else {
                self.release_followers(key, id, None);
                return;
            };
            if record.status != TaskStatus::Running {
                // cancelled while the bridge was finishing
                drop(record);
                self.release_followers(key, id, None);
                return;
            }

            let applied = match joined {
                Ok(outcome) => apply_outcome(&mut record, outcome),
                Err(e) => record
                    .fail(join_failure_message(e), None, None)
                    .map(|()| None),
            };
            let shared = match applied {
                Ok(shared) => shared,
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Failed to record compile outcome");
                    self.bus.publish(SchedulerEvent::Error {
                        task_id: Some(id),
                        message: e.to_string(),
                    });
                    None
                }
            };
            // stored before the success becomes visible
            if let (Some(result), Some(key), Some(cache)) = (&shared, key, &self.cache) {
                if let Err(e) = cache.put(key, Arc::clone(result), record.compiler.outputs.clone())
                {
                    tracing::warn!(task_id = %id, key, error = %e, "Failed to cache compile result");
                }
            }
            (record.clone(), shared)
        };

        match snapshot.status {
            TaskStatus::Succeeded => tracing::info!(
                task_id = %id,
                duration_ms = snapshot.duration().map(|d| d.as_millis() as u64).unwrap_or(0),
                "Compile succeeded"
            ),
            TaskStatus::Failed => tracing::warn!(
                task_id = %id,
                exit_code = ?snapshot.exit_code,
                "Compile failed"
            ),
            _ => tracing::info!(task_id = %id, reason = ?snapshot.cancel_reason, "Compile cancelled"),
        }

        self.publish_terminal(&snapshot);
        self.release_followers(key, id, shared.as_ref());
    }

    pub(crate) fn cancel_with_reason(&self, id: TaskId, reason: &str) -> bool {
        let (task, was_running) = {
            let Some(mut record) = self.tasks.get_mut(&id) else {
                return false;
            };
            let was_running = match record.status {
                TaskStatus::Queued => false,
                TaskStatus::Running => true,
                _ => return false,
            };
            if record.cancel(reason).is_err() {
                return false;
            }
            (record.clone(), was_running)
        };

        if was_running {
            if let Some((_, run)) = self.running.remove(&id) {
                run.stop.stop(reason);
                if run.is_finished() {
                    self.release_followers(run.cache_key.as_deref(), id, None);
                } else {
                    // the key stays claimed until the bridge actually returns
                    self.draining.insert(id, run.into_draining());
                }
            }
        } else {
            self.queue.remove(id);
            self.inflight.remove_follower(id);
        }

        tracing::info!(task_id = %id, reason, "Task cancelled");
        self.publish_terminal(&task);
        true
    }

    /// Settle the tasks parked behind `leader`: share its result when it
    /// succeeded, otherwise put them back in the queue
    fn release_followers(
        &self,
        key: Option<&str>,
        leader: TaskId,
        shared: Option<&Arc<CompileResult>>,
    ) {
        let Some(key) = key else {
            return;
        };
        let followers = self.inflight.release(key, leader);
        if followers.is_empty() {
            return;
        }
        tracing::debug!(%leader, count = followers.len(), shared = shared.is_some(), "Releasing parked duplicates");

        for follower in followers {
            match shared {
                Some(result) => self.complete_from_shared(follower.id, result),
                None => {
                    let still_queued = self
                        .tasks
                        .get(&follower.id)
                        .is_some_and(|t| t.status == TaskStatus::Queued);
                    if still_queued {
                        if let Err(e) = self.queue.push(follower) {
                            tracing::warn!(error = %e, "Failed to requeue parked task");
                        }
                    }
                }
            }
        }
    }

    fn complete_from_shared(&self, id: TaskId, result: &Arc<CompileResult>) {
        let snapshot = {
            let Some(mut record) = self.tasks.get_mut(&id) else {
                return;
            };
            if record.succeed_from_cache(Arc::clone(result)).is_err() {
                return;
            }
            record.clone()
        };
        tracing::info!(task_id = %id, "Compile satisfied by shared result");
        self.publish_terminal(&snapshot);
    }

    fn late_cache_hit(&self, key: &str) -> Option<CachedCompile> {
        let cache = self.cache.as_ref()?;
        if cache.is_valid(key) {
            cache.get(key)
        } else {
            None
        }
    }

    /// Record history, then announce the terminal state
    fn publish_terminal(&self, task: &CompileTask) {
        self.history.record(task, task.result.as_deref());

        let event = match task.status {
            TaskStatus::Succeeded => SchedulerEvent::TaskSucceeded {
                task_id: task.id,
                duration_ms: task.duration().map(|d| d.as_millis() as u64).unwrap_or(0),
                from_cache: task.from_cache,
            },
            TaskStatus::Failed => SchedulerEvent::TaskFailed {
                task_id: task.id,
                error: task.error_output.clone(),
                exit_code: task.exit_code,
            },
            TaskStatus::Cancelled => SchedulerEvent::TaskCancelled {
                task_id: task.id,
                reason: task.cancel_reason.clone().unwrap_or_default(),
            },
            TaskStatus::Queued | TaskStatus::Running => return,
        };
        self.bus.publish(event);
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for entry in self.running.iter() {
            entry.stop.stop(SHUTDOWN_REASON);
        }
    }
}

/// Turn a bridge outcome into the task's terminal state. Returns the result
/// to share when the compile succeeded.
fn apply_outcome(task: &mut CompileTask, outcome: RunOutcome) -> Result<Option<Arc<CompileResult>>> {
    let RunOutcome {
        result,
        stdout,
        stderr,
        progress_events,
        cancelled,
        elapsed,
    } = outcome;

    if let Some(reason) = cancelled {
        task.cancel(reason)?;
        return Ok(None);
    }

    match result {
        Ok(process) => {
            let compiled = Arc::new(CompileResult::from_process(
                &process,
                elapsed,
                progress_events,
                task.compiler.outputs.clone(),
            ));
            if process.success {
                let output = if process.output.is_empty() {
                    stdout
                } else {
                    process.output
                };
                task.succeed(Arc::clone(&compiled), output, process.exit_code)?;
                Ok(Some(compiled))
            } else {
                let error_output = if process.error_output.is_empty() {
                    stderr
                } else {
                    process.error_output
                };
                task.output = if process.output.is_empty() {
                    stdout
                } else {
                    process.output
                };
                task.fail(error_output, process.exit_code, Some(compiled))?;
                Ok(None)
            }
        }
        Err(Error::Cancelled { reason, .. }) => {
            task.cancel(reason)?;
            Ok(None)
        }
        Err(e) => {
            let exit_code = match &e {
                Error::Bridge { exit_code, .. } => *exit_code,
                _ => None,
            };
            let message = if stderr.is_empty() {
                e.to_string()
            } else {
                format!("{e}\n{stderr}")
            };
            task.fail(message, exit_code, None)?;
            Ok(None)
        }
    }
}

fn join_failure_message(error: JoinError) -> String {
    if error.is_panic() {
        format!(
            "bridge invocation panicked: {}",
            dispatch::panic_message(error.into_panic().as_ref())
        )
    } else {
        "bridge invocation was aborted".to_string()
    }
}
