//! Auto-task scheduler: drains the pending queue one task at a time while
//! the arm is in auto mode.
//!
//! Event driven: `kick()` wakes the worker, which keeps running tasks until
//! the queue is empty or the mode leaves auto. Tasks go straight to the
//! device gateway (no operation record, no entity side effects).

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::arm::{ArmContext, GateGuard, InFlight, Mode};
use crate::broadcast::{Broadcaster, WarehouseEvent};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::device::{DeviceCommand, DeviceGateway};
use crate::error::{Error, Result};
use crate::store::Database;
use crate::warehouse::model::{AutoTask, NewAutoTask, TaskStatus, TaskType};

/// How a single task ended, which also decides the pause before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Device acknowledged the command.
    Dispatched,
    /// Device failed; task is `FAILED`.
    Failed,
    /// Nothing to send; task completed without touching the device.
    NoOp,
    /// Task was no longer pending when claimed.
    Skipped,
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    gateway: Arc<DeviceGateway>,
    arm: Arc<ArmContext>,
    events: Broadcaster,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Database>,
        gateway: Arc<DeviceGateway>,
        arm: Arc<ArmContext>,
        events: Broadcaster,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            arm,
            events,
            clock,
            config,
            wake: Notify::new(),
        }
    }

    /// Queue a task. Wakes the worker when already in auto mode.
    pub async fn enqueue(&self, task: NewAutoTask) -> Result<AutoTask> {
        task.validate()?;
        if let Some(cell_id) = task.cell_id {
            if self.store.get_cell(cell_id).await?.is_none() {
                return Err(Error::not_found("cell", cell_id));
            }
        }
        if let Some(product_id) = task.product_id {
            if self.store.get_product(product_id).await?.is_none() {
                return Err(Error::not_found("product", product_id));
            }
        }

        let task = self.store.insert_auto_task(&task, self.clock.now()).await?;
        info!(
            task_id = task.id,
            task_type = task.task_type.as_str(),
            priority = task.priority.as_str(),
            "Auto task queued"
        );
        self.publish(task.clone());

        if self.arm.mode() == Mode::Auto {
            self.kick();
        }
        Ok(task)
    }

    /// Cancel a task that has not started yet.
    pub async fn cancel(&self, id: i64) -> Result<AutoTask> {
        if let Some(task) = self.store.cancel_auto_task(id, self.clock.now()).await? {
            info!(task_id = id, "Auto task cancelled");
            self.publish(task.clone());
            return Ok(task);
        }
        match self.store.get_auto_task(id).await? {
            None => Err(Error::not_found("auto task", id)),
            Some(task) => Err(Error::Validation(format!(
                "auto task {id} is {} and can no longer be cancelled",
                task.status.as_str()
            ))),
        }
    }

    /// Tasks in the order the scheduler would run them.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<AutoTask>> {
        Ok(self.store.list_auto_tasks(status).await?)
    }

    /// Wake the worker. Coalesces: many kicks before a drain mean one drain.
    pub fn kick(&self) {
        self.wake.notify_one();
    }

    /// Spawn the worker loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Auto-task scheduler started");
            loop {
                self.wake.notified().await;
                match self.drain().await {
                    Ok(0) => debug!("Scheduler woke with nothing to run"),
                    Ok(ran) => info!(ran, "Auto-task queue drained"),
                    Err(e) => error!(error = %e, "Scheduler drain aborted"),
                }
            }
        })
    }

    /// Run pending tasks until the queue is empty or the mode leaves auto.
    /// Returns the number of tasks run.
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        loop {
            if self.arm.mode() != Mode::Auto {
                debug!("Mode is manual, scheduler idle");
                break;
            }
            let Some(next) = self.store.next_pending_task().await? else {
                break;
            };

            let mut guard = match self.arm.try_acquire() {
                Ok(guard) => guard,
                Err(Error::Busy { current }) => {
                    debug!(task_id = next.id, ?current, "Gate held, waiting");
                    self.clock.sleep(self.config.busy_retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = self.run_task(next.id, &mut guard).await?;
            drop(guard);

            let delay = match outcome {
                TaskOutcome::Skipped => continue,
                TaskOutcome::NoOp => self.config.noop_delay,
                TaskOutcome::Dispatched | TaskOutcome::Failed => self.config.dispatch_delay,
            };
            ran += 1;
            self.clock.sleep(delay).await;
        }
        Ok(ran)
    }

    /// Claim and run one task while holding the gate.
    async fn run_task(&self, id: i64, guard: &mut GateGuard) -> Result<TaskOutcome> {
        let Some(task) = self.store.claim_auto_task(id, self.clock.now()).await? else {
            debug!(task_id = id, "Task no longer pending, skipping");
            return Ok(TaskOutcome::Skipped);
        };
        guard.set_current(InFlight::Task(task.id));
        info!(
            task_id = task.id,
            task_type = task.task_type.as_str(),
            priority = task.priority.as_str(),
            "Auto task started"
        );
        self.publish(task.clone());

        let (error, outcome) = match self.resolve_command(&task).await {
            Ok(None) => {
                warn!(
                    task_id = task.id,
                    task_type = task.task_type.as_str(),
                    "Auto task resolved to no command, completing without dispatch"
                );
                (None, TaskOutcome::NoOp)
            }
            Ok(Some(command)) => {
                match self
                    .config
                    .retry
                    .send(&self.gateway, self.clock.as_ref(), &command)
                    .await
                {
                    Ok(_) => (None, TaskOutcome::Dispatched),
                    Err(e) => {
                        warn!(task_id = task.id, command = %command, error = %e, "Auto task failed");
                        (Some(e.to_string()), TaskOutcome::Failed)
                    }
                }
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "Could not resolve auto task");
                (Some(e.to_string()), TaskOutcome::Failed)
            }
        };

        match self
            .store
            .finish_auto_task(task.id, error.as_deref(), self.clock.now())
            .await
        {
            Ok(task) => {
                info!(task_id = task.id, status = task.status.as_str(), "Auto task finished");
                self.publish(task);
                Ok(outcome)
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "Auto task ran but its state update failed");
                let reason = match outcome {
                    TaskOutcome::Dispatched => {
                        format!("device acknowledged but state update failed: {e}")
                    }
                    _ => format!("state update failed: {e}"),
                };
                self.record_failure(task.id, &reason).await;
                Ok(TaskOutcome::Failed)
            }
        }
    }

    /// Best-effort `FAILED` write so a task never stays `PROCESSING`.
    async fn record_failure(&self, id: i64, reason: &str) {
        match self
            .store
            .finish_auto_task(id, Some(reason), self.clock.now())
            .await
        {
            Ok(task) => self.publish(task),
            Err(e) => error!(task_id = id, error = %e, "Failed to record auto task failure"),
        }
    }

    /// STOCK → `AUTO_STOCK:<rfid>` (task tag, else the product's tag);
    /// RETRIEVE → `TAKE <col> <row>` of the task's cell. Anything else, or
    /// missing data, resolves to no command.
    async fn resolve_command(&self, task: &AutoTask) -> Result<Option<DeviceCommand>> {
        match task.task_type {
            TaskType::Stock => {
                let tag = task
                    .product_rfid
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                let tag = match (tag, task.product_id) {
                    (Some(tag), _) => Some(tag),
                    (None, Some(product_id)) => self
                        .store
                        .get_product(product_id)
                        .await?
                        .and_then(|p| p.rfid_tag),
                    (None, None) => None,
                };
                Ok(tag.map(|rfid| DeviceCommand::AutoStock { rfid }))
            }
            TaskType::Retrieve => match task.cell_id {
                Some(cell_id) => Ok(self
                    .store
                    .get_cell(cell_id)
                    .await?
                    .map(|cell| DeviceCommand::Take {
                        col: cell.col,
                        row: cell.row,
                    })),
                None => Ok(None),
            },
            TaskType::Move | TaskType::Organize | TaskType::InventoryCheck => Ok(None),
        }
    }

    fn publish(&self, task: AutoTask) {
        self.events.publish(WarehouseEvent::TaskUpdate { task });
    }
}
