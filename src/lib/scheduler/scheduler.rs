use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cron::CronExpression;
use super::executor::{ExecutionHooks, TaskExecutor};
use super::types::{
    RunningTaskInfo, SchedulerError, SchedulerEvent, SchedulerEventKind, SchedulerResult,
    TaskEventListener, TaskStatus, store_err,
};
use crate::lib::config::SchedulerConfig;
use crate::lib::store::{ExecutionStore, TaskStore};
use crate::lib::tasks::types::{
    ExecutionStatus, ScheduledTask, TaskError, TaskExecution, TriggerSource,
};

/// How long cancelled executions get to unwind after the grace period.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SchedulerStores {
    pub tasks: Arc<dyn TaskStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

type Listeners = Arc<RwLock<Vec<Arc<dyn TaskEventListener>>>>;

fn emit(listeners: &Listeners, event: SchedulerEvent) {
    let listeners = listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
    for listener in listeners {
        listener.on_event(&event);
    }
}

/// Forwards executor retries to scheduler listeners.
struct RetryEvents {
    listeners: Listeners,
}

impl ExecutionHooks for RetryEvents {
    fn on_retry(
        &self,
        task: &ScheduledTask,
        execution: &TaskExecution,
        error: &TaskError,
        delay: Duration,
    ) {
        let event = SchedulerEvent::new(SchedulerEventKind::TaskRetried, task, execution.id)
            .with_detail(format!("{} (retry in {:?})", error, delay));
        emit(&self.listeners, event);
    }
}

struct RunningEntry {
    info: RunningTaskInfo,
    cancel: CancellationToken,
}

struct Lifecycle {
    /// Stops the dispatch loop only.
    stop_loop: CancellationToken,
    /// Parent of every execution token.
    root: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, ScheduledTask>,
    /// Keyed by task id; a task has at most one execution in flight.
    running: HashMap<Uuid, RunningEntry>,
    triggers: VecDeque<Uuid>,
    lifecycle: Option<Lifecycle>,
}

struct Inner {
    config: SchedulerConfig,
    executor: TaskExecutor,
    stores: SchedulerStores,
    state: Mutex<State>,
    listeners: Listeners,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    wake: Notify,
}

/// Cron-driven dispatcher. Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, mut executor: TaskExecutor, stores: SchedulerStores) -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        executor.add_hooks(Arc::new(RetryEvents {
            listeners: listeners.clone(),
        }));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        TaskScheduler {
            inner: Arc::new(Inner {
                config,
                executor,
                stores,
                state: Mutex::new(State::default()),
                listeners,
                permits,
                tracker: TaskTracker::new(),
                wake: Notify::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskEventListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn add_task(&self, mut task: ScheduledTask) -> SchedulerResult<ScheduledTask> {
        validate_name(&task)?;
        let now = Utc::now();
        task.next_run_at = self.inner.next_run(&task.cron_expression, now)?;
        task.created_at = now;
        task.updated_at = now;

        let mut state = self.inner.lock();
        if state.tasks.contains_key(&task.id) {
            return Err(SchedulerError::InvalidTask(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.inner.stores.tasks.save_task(&task).map_err(store_err)?;
        state.tasks.insert(task.id, task.clone());
        drop(state);

        info!(
            "Added task {} ({}) '{}', next run {:?}",
            task.name, task.task_type, task.cron_expression, task.next_run_at
        );
        Ok(task)
    }

    /// Replaces the operator-editable fields of an existing task.
    pub fn update_task(&self, task: ScheduledTask) -> SchedulerResult<ScheduledTask> {
        validate_name(&task)?;
        let now = Utc::now();
        let next_run_at = self.inner.next_run(&task.cron_expression, now)?;

        let mut state = self.inner.lock();
        let existing = state
            .tasks
            .get_mut(&task.id)
            .ok_or(SchedulerError::TaskNotFound(task.id))?;
        let mut updated = existing.clone();
        updated.name = task.name;
        updated.task_type = task.task_type;
        updated.cron_expression = task.cron_expression;
        updated.target_containers = task.target_containers;
        updated.parameters = task.parameters;
        updated.is_active = task.is_active;
        updated.next_run_at = next_run_at;
        updated.updated_at = now;

        self.inner.stores.tasks.save_task(&updated).map_err(store_err)?;
        *existing = updated.clone();
        drop(state);

        info!("Updated task {} ({})", updated.name, updated.id);
        Ok(updated)
    }

    /// Removes a task. An execution already in flight runs to completion.
    pub fn remove_task(&self, id: Uuid) -> SchedulerResult<ScheduledTask> {
        let mut state = self.inner.lock();
        if !state.tasks.contains_key(&id) {
            return Err(SchedulerError::TaskNotFound(id));
        }
        self.inner.stores.tasks.delete_task(id).map_err(store_err)?;
        state.triggers.retain(|queued| *queued != id);
        let task = state.tasks.remove(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        drop(state);

        info!("Removed task {} ({})", task.name, id);
        Ok(task)
    }

    pub fn pause_task(&self, id: Uuid) -> SchedulerResult<ScheduledTask> {
        let task = self.inner.modify_task(id, |task, _| {
            task.is_active = false;
            Ok(())
        })?;
        info!("Paused task {}", task.name);
        Ok(task)
    }

    /// Reactivates a task. Occurrences missed while paused are not replayed.
    pub fn resume_task(&self, id: Uuid) -> SchedulerResult<ScheduledTask> {
        let inner = self.inner.clone();
        let task = self.inner.modify_task(id, move |task, now| {
            task.is_active = true;
            task.next_run_at = inner.next_run(&task.cron_expression, now)?;
            Ok(())
        })?;
        info!("Resumed task {}, next run {:?}", task.name, task.next_run_at);
        Ok(task)
    }

    /// Queues an out-of-band run, picked up on the next dispatch pass.
    pub fn trigger_task(&self, id: Uuid) -> SchedulerResult<()> {
        let mut state = self.inner.lock();
        let task = state.tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        if !task.is_active {
            return Err(SchedulerError::TaskPaused(id));
        }
        if state.running.contains_key(&id) {
            return Err(SchedulerError::AlreadyRunning(id));
        }
        if !state.triggers.contains(&id) {
            state.triggers.push_back(id);
        }
        drop(state);

        debug!("Queued manual trigger for task {}", id);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn cancel_execution(&self, execution_id: Uuid) -> SchedulerResult<()> {
        let state = self.inner.lock();
        let entry = state
            .running
            .values()
            .find(|entry| entry.info.execution_id == execution_id)
            .ok_or(SchedulerError::ExecutionNotFound(execution_id))?;
        info!(
            "Cancelling execution {} of task {}",
            execution_id, entry.info.task_name
        );
        entry.cancel.cancel();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().lifecycle.is_some()
    }

    /// Loads tasks from the store and spawns the dispatch loop.
    pub fn start(&self) -> SchedulerResult<()> {
        let mut state = self.inner.lock();
        if state.lifecycle.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let now = Utc::now();
        let stored = self.inner.stores.tasks.list_tasks().map_err(store_err)?;
        state.tasks.clear();
        for mut task in stored {
            if task.next_run_at.is_none_or(|next| next <= now) {
                match self.inner.next_run(&task.cron_expression, now) {
                    Ok(next) => task.next_run_at = next,
                    Err(e) => {
                        error!("Skipping stored task {}: {}", task.name, e);
                        continue;
                    }
                }
                if let Err(e) = self.inner.stores.tasks.save_task(&task) {
                    warn!("Failed to persist next run of {}: {:#}", task.name, e);
                }
            }
            state.tasks.insert(task.id, task);
        }

        let stop_loop = CancellationToken::new();
        let root = CancellationToken::new();
        let handle = tokio::spawn(Inner::run_loop(
            self.inner.clone(),
            stop_loop.clone(),
            root.clone(),
        ));
        info!(
            "Scheduler started with {} tasks, max {} concurrent",
            state.tasks.len(),
            self.inner.config.max_concurrent_tasks
        );
        state.lifecycle = Some(Lifecycle {
            stop_loop,
            root,
            handle,
        });
        Ok(())
    }

    /// Stops dispatching, waits up to `grace` for executions in flight, then
    /// cancels whatever is left.
    pub async fn stop(&self, grace: Duration) -> SchedulerResult<()> {
        let lifecycle = self
            .inner
            .lock()
            .lifecycle
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        info!("Stopping scheduler");
        lifecycle.stop_loop.cancel();
        if let Err(e) = lifecycle.handle.await {
            error!("Dispatch loop ended abnormally: {}", e);
        }

        let tracker = &self.inner.tracker;
        tracker.close();
        if timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                "{} executions still running after {:?}, cancelling",
                tracker.len(),
                grace
            );
            lifecycle.root.cancel();
            if timeout(SETTLE_TIMEOUT, tracker.wait()).await.is_err() {
                error!("{} executions did not settle after cancellation", tracker.len());
            }
        }
        lifecycle.root.cancel();
        tracker.reopen();

        info!("Scheduler stopped");
        Ok(())
    }

    pub fn get_task_status(&self, id: Uuid) -> SchedulerResult<TaskStatus> {
        let (task, running) = {
            let state = self.inner.lock();
            let task = state.tasks.get(&id).cloned().ok_or(SchedulerError::TaskNotFound(id))?;
            let running = state.running.get(&id).map(|entry| entry.info.clone());
            (task, running)
        };
        let last_execution = self
            .inner
            .stores
            .executions
            .last_execution(id)
            .map_err(store_err)?;
        Ok(TaskStatus {
            task,
            running,
            last_execution,
        })
    }

    pub fn get_running_tasks(&self) -> Vec<RunningTaskInfo> {
        let mut running: Vec<_> = self
            .inner
            .lock()
            .running
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        running.sort_by_key(|info| info.started_at);
        running
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.inner.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        tasks
    }

    #[cfg(test)]
    fn make_due(&self, id: Uuid) {
        if let Some(task) = self.inner.lock().tasks.get_mut(&id) {
            task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        self.inner.wake.notify_one();
    }
}

fn validate_name(task: &ScheduledTask) -> SchedulerResult<()> {
    if task.name.trim().is_empty() {
        return Err(SchedulerError::InvalidTask("task name is empty".to_string()));
    }
    Ok(())
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_run(&self, cron: &str, after: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        let expr = CronExpression::parse(cron)
            .map_err(|e| SchedulerError::InvalidCronExpression(format!("{}: {}", cron, e)))?;
        match expr.next_after(&after, &self.config.time_zone) {
            Some(next) => Ok(Some(next)),
            None => Err(SchedulerError::InvalidCronExpression(format!(
                "{}: never fires",
                cron
            ))),
        }
    }

    fn modify_task<F>(&self, id: Uuid, change: F) -> SchedulerResult<ScheduledTask>
    where
        F: FnOnce(&mut ScheduledTask, DateTime<Utc>) -> SchedulerResult<()>,
    {
        let now = Utc::now();
        let mut state = self.lock();
        let existing = state.tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        let mut updated = existing.clone();
        change(&mut updated, now)?;
        updated.updated_at = now;
        self.stores.tasks.save_task(&updated).map_err(store_err)?;
        *existing = updated.clone();
        Ok(updated)
    }

    async fn run_loop(self: Arc<Self>, stop: CancellationToken, root: CancellationToken) {
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
            }

            self.dispatch_due(&root);

            if last_cleanup.elapsed() >= self.config.cleanup_interval {
                self.prune_history();
                last_cleanup = Instant::now();
            }
        }
        debug!("Dispatch loop exited");
    }

    /// One dispatch pass: manual triggers first, then due tasks by due time.
    fn dispatch_due(self: &Arc<Self>, root: &CancellationToken) {
        let now = Utc::now();
        let mut state = self.lock();

        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .tasks
            .values()
            .filter(|task| task.is_active)
            .filter_map(|task| task.next_run_at.filter(|next| *next <= now).map(|next| (next, task.id)))
            .collect();
        due.sort();
        let candidates: Vec<(Uuid, TriggerSource)> = state
            .triggers
            .iter()
            .map(|id| (*id, TriggerSource::Manual))
            .chain(due.into_iter().map(|(_, id)| (id, TriggerSource::Schedule)))
            .collect();
        if !candidates.is_empty() {
            debug!("Dispatch pass with {} candidates", candidates.len());
        }

        for (id, source) in candidates {
            let Some(task) = state.tasks.get(&id) else {
                state.triggers.retain(|queued| *queued != id);
                continue;
            };
            if !task.is_active {
                state.triggers.retain(|queued| *queued != id);
                continue;
            }
            // An earlier candidate in this pass may have moved next_run_at.
            if source == TriggerSource::Schedule && task.next_run_at.is_none_or(|next| next > now) {
                continue;
            }

            if state.running.contains_key(&id) {
                if source == TriggerSource::Schedule {
                    self.skip_occurrence(&mut state, id, now);
                }
                continue;
            }

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("No free execution slot, leaving remaining tasks due");
                break;
            };
            if source == TriggerSource::Manual {
                state.triggers.retain(|queued| *queued != id);
            }
            self.dispatch(&mut state, id, source, now, root, permit);
        }
    }

    fn skip_occurrence(&self, state: &mut State, id: Uuid, now: DateTime<Utc>) {
        let Some(task) = state.tasks.get_mut(&id) else {
            return;
        };
        match self.next_run(&task.cron_expression, now) {
            Ok(next) => task.next_run_at = next,
            Err(e) => {
                error!("Cannot reschedule {}: {}", task.name, e);
                task.next_run_at = None;
            }
        }
        warn!(
            "Task {} still running, skipping occurrence; next run {:?}",
            task.name, task.next_run_at
        );
        if let Err(e) = self.stores.tasks.save_task(task) {
            warn!("Failed to persist task {}: {:#}", task.name, e);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        state: &mut State,
        id: Uuid,
        source: TriggerSource,
        now: DateTime<Utc>,
        root: &CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let Some(task) = state.tasks.get_mut(&id) else {
            return;
        };
        task.last_run_at = Some(now);
        task.run_count += 1;
        task.updated_at = now;
        let reschedule = match source {
            TriggerSource::Schedule => true,
            TriggerSource::Manual => task.next_run_at.is_none_or(|next| next <= now),
        };
        if reschedule {
            match self.next_run(&task.cron_expression, now) {
                Ok(next) => task.next_run_at = next,
                Err(e) => {
                    error!("Cannot reschedule {}: {}", task.name, e);
                    task.next_run_at = None;
                }
            }
        }
        let task = task.clone();
        if let Err(e) = self.stores.tasks.save_task(&task) {
            warn!("Failed to persist task {}: {:#}", task.name, e);
        }

        let execution = TaskExecution::new(task.id, source);
        if let Err(e) = self.stores.executions.save_execution(&execution) {
            warn!("Failed to record execution of {}: {:#}", task.name, e);
        }

        let cancel = root.child_token();
        state.running.insert(
            task.id,
            RunningEntry {
                info: RunningTaskInfo {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    task_type: task.task_type,
                    execution_id: execution.id,
                    triggered_by: source,
                    started_at: now,
                },
                cancel: cancel.clone(),
            },
        );

        info!(
            "Dispatching {} ({}) via {}, execution {}",
            task.name, task.task_type, source, execution.id
        );
        self.tracker
            .spawn(self.clone().run_execution(task, execution, cancel, permit));
    }

    async fn run_execution(
        self: Arc<Self>,
        task: ScheduledTask,
        mut execution: TaskExecution,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        emit(
            &self.listeners,
            SchedulerEvent::new(SchedulerEventKind::TaskStarted, &task, execution.id),
        );

        let result = self.executor.execute(&cancel, &task, &mut execution).await;

        {
            // Readers see the stored outcome together with the counters.
            let mut state = self.lock();
            if let Err(e) = self.stores.executions.save_execution(&execution) {
                error!("Failed to store execution {}: {:#}", execution.id, e);
            }
            if state
                .running
                .get(&task.id)
                .is_some_and(|entry| entry.info.execution_id == execution.id)
            {
                state.running.remove(&task.id);
            }
            let failed = matches!(result.status, ExecutionStatus::Failed | ExecutionStatus::TimedOut);
            if let Some(stored) = state.tasks.get_mut(&task.id).filter(|_| failed) {
                stored.failure_count += 1;
                stored.updated_at = Utc::now();
                if let Err(e) = self.stores.tasks.save_task(stored) {
                    warn!("Failed to persist task {}: {:#}", stored.name, e);
                }
            }
        }
        drop(permit);

        let kind = match result.status {
            ExecutionStatus::Succeeded => SchedulerEventKind::TaskCompleted,
            ExecutionStatus::TimedOut => SchedulerEventKind::TaskTimeout,
            ExecutionStatus::Cancelled => SchedulerEventKind::TaskCancelled,
            _ => SchedulerEventKind::TaskFailed,
        };
        let mut event = SchedulerEvent::new(kind, &task, execution.id);
        if let Some(error) = result.error {
            event = event.with_detail(error);
        }
        emit(&self.listeners, event);

        // A freed slot may unblock tasks left due.
        self.wake.notify_one();
    }

    fn prune_history(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.config.history_retention) else {
            return;
        };
        match self.stores.executions.prune_executions(Utc::now() - retention) {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} executions older than {:?}", n, self.config.history_retention),
            Err(e) => warn!("Execution history pruning failed: {:#}", e),
        }
    }
}
