//! Warehouse service: the single entry point for inbound intents.
//!
//! Owns the executor and scheduler, and wires the store, device gateway, arm
//! context and broadcaster together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::arm::{ArmContext, ArmSnapshot, Mode};
use crate::broadcast::{Broadcaster, WarehouseEvent, WarehouseSnapshot};
use crate::clock::Clock;
use crate::config::{GridConfig, SchedulerConfig};
use crate::device::{DeviceCommand, DeviceGateway, DeviceStatus};
use crate::error::{DatabaseError, Error, Result};
use crate::ops::{OperationExecutor, OperationOutcome, Scheduler};
use crate::store::{Database, Recovered};
use crate::warehouse::intent::{Intent, IntentResult};
use crate::warehouse::model::{
    AutoTask, Cell, ConveyorStatus, LoadingZone, NewAutoTask, NewProduct, Operation,
    OperationRequest, Product, SensorSnapshot, StockAssignment, TaskStatus,
};
use crate::warehouse::sensors::{SensorMonitor, SensorReading};

/// Reason stored on work found in flight at startup.
const INTERRUPTED: &str = "interrupted by restart";

const DEFAULT_OPERATION_LIMIT: u32 = 20;
const MAX_OPERATION_LIMIT: u32 = 500;

pub struct Warehouse {
    store: Arc<dyn Database>,
    gateway: Arc<DeviceGateway>,
    arm: Arc<ArmContext>,
    events: Broadcaster,
    clock: Arc<dyn Clock>,
    executor: OperationExecutor,
    scheduler: Arc<Scheduler>,
    sensors: SensorMonitor,
}

impl Warehouse {
    pub fn new(
        store: Arc<dyn Database>,
        gateway: Arc<DeviceGateway>,
        arm: Arc<ArmContext>,
        events: Broadcaster,
        clock: Arc<dyn Clock>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let executor = OperationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&arm),
            events.clone(),
            Arc::clone(&clock),
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&arm),
            events.clone(),
            Arc::clone(&clock),
            scheduler_config,
        ));
        Self {
            store,
            gateway,
            arm,
            events,
            clock,
            executor,
            scheduler,
            sensors: SensorMonitor::new(),
        }
    }

    pub fn events(&self) -> &Broadcaster {
        &self.events
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn arm_snapshot(&self) -> ArmSnapshot {
        self.arm.snapshot()
    }

    /// Seed the grid and fail whatever a previous run left in flight.
    pub async fn initialize(&self, grid: GridConfig) -> Result<Recovered> {
        self.store
            .seed_grid(grid.rows, grid.cols, self.clock.now())
            .await?;
        let recovered = self
            .store
            .recover_interrupted(INTERRUPTED, self.clock.now())
            .await?;
        if recovered != Recovered::default() {
            warn!(
                operations = recovered.operations,
                tasks = recovered.tasks,
                "Marked interrupted work as failed"
            );
        }
        if self.arm.mode() == Mode::Auto {
            self.scheduler.kick();
        }
        Ok(recovered)
    }

    /// Dispatch one intent.
    pub async fn handle(&self, intent: Intent) -> Result<IntentResult> {
        debug!(action = intent.name(), "Handling intent");
        Ok(match intent {
            Intent::CreateOperation(request) => {
                IntentResult::Operation(self.execute_operation(request).await?)
            }
            Intent::CreateAutoTask(task) => IntentResult::Task(self.create_auto_task(task).await?),
            Intent::CancelAutoTask { task_id } => {
                IntentResult::Task(self.cancel_auto_task(task_id).await?)
            }
            Intent::SetMode { mode } => IntentResult::Arm(self.set_mode(mode).0),
            Intent::AssignCell {
                cell_id,
                product_id,
                quantity,
            } => IntentResult::Cell(
                self.assign_cell(
                    cell_id,
                    StockAssignment {
                        product_id,
                        quantity,
                    },
                )
                .await?,
            ),
            Intent::SetLoadingZone {
                product_id,
                quantity,
            } => IntentResult::LoadingZone(
                self.set_loading_zone(StockAssignment {
                    product_id,
                    quantity,
                })
                .await?,
            ),
            Intent::SetConveyor {
                has_product,
                product_id,
            } => IntentResult::Conveyor(self.set_conveyor(has_product, product_id).await?),
            Intent::RegisterDevice { address } => {
                IntentResult::Device(self.register_device(&address)?)
            }
            Intent::IngestSensors(reading) => {
                IntentResult::Sensors(self.ingest_sensors(reading).await?)
            }
            Intent::CreateProduct(product) => {
                IntentResult::Product(self.create_product(product).await?)
            }
            Intent::ListProducts => IntentResult::Products(self.list_products().await?),
            Intent::ListOperations { limit } => {
                IntentResult::Operations(self.list_operations(limit).await?)
            }
            Intent::GetOperation { operation_id } => {
                IntentResult::OperationRecord(self.get_operation(operation_id).await?)
            }
            Intent::ListAutoTasks { status } => {
                IntentResult::Tasks(self.list_auto_tasks(status).await?)
            }
            Intent::Refresh => {
                self.publish_warehouse_data().await?;
                IntentResult::Refreshed
            }
            Intent::RequestStatus => IntentResult::Snapshot(Box::new(self.snapshot().await?)),
        })
    }

    // ── Device work ─────────────────────────────────────────────────

    pub async fn execute_operation(&self, request: OperationRequest) -> Result<OperationOutcome> {
        self.executor.execute(request).await
    }

    pub async fn create_auto_task(&self, task: NewAutoTask) -> Result<AutoTask> {
        self.scheduler.enqueue(task).await
    }

    pub async fn cancel_auto_task(&self, id: i64) -> Result<AutoTask> {
        self.scheduler.cancel(id).await
    }

    pub async fn list_auto_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<AutoTask>> {
        self.scheduler.list(status).await
    }

    /// Most recent operations first.
    pub async fn list_operations(&self, limit: Option<u32>) -> Result<Vec<Operation>> {
        let limit = limit
            .unwrap_or(DEFAULT_OPERATION_LIMIT)
            .clamp(1, MAX_OPERATION_LIMIT);
        Ok(self.store.list_operations(limit).await?)
    }

    pub async fn get_operation(&self, id: i64) -> Result<Operation> {
        self.store
            .get_operation(id)
            .await?
            .ok_or_else(|| Error::not_found("operation", id))
    }

    /// Switch mode and tell the device in the background.
    ///
    /// The notification waits for the gate rather than failing, and its
    /// failure is only logged. Once it holds the gate it re-reads the mode:
    /// if a later switch already replaced this one, that switch's own
    /// notification reports it and this one sends nothing. Entering auto
    /// kicks the scheduler once the notification is done.
    pub fn set_mode(&self, mode: Mode) -> (ArmSnapshot, JoinHandle<()>) {
        let previous = self.arm.set_mode(mode);
        let arm = self.arm.snapshot();
        info!(from = %previous, to = %mode, "Mode changed");
        self.events.publish(WarehouseEvent::ModeUpdate {
            mode,
            arm: arm.clone(),
        });

        let gateway = Arc::clone(&self.gateway);
        let context = Arc::clone(&self.arm);
        let scheduler = Arc::clone(&self.scheduler);
        let notifier = tokio::spawn(async move {
            match context.acquire().await {
                Ok(_guard) => {
                    let current = context.mode();
                    if current != mode {
                        debug!(requested = %mode, current = %current, "Mode switched again, skipping stale notification");
                    } else {
                        let commands = [
                            DeviceCommand::Mode(mode.device_keyword()),
                            DeviceCommand::AutoRun(mode == Mode::Auto),
                        ];
                        for command in commands {
                            if let Err(e) = gateway.send_command(&command).await {
                                warn!(mode = %mode, command = %command, error = %e, "Mode notification failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(mode = %mode, error = %e, "Could not take gate for mode notification"),
            }
            if mode == Mode::Auto && context.mode() == Mode::Auto {
                scheduler.kick();
            }
        });

        (arm, notifier)
    }

    // ── State without the device ────────────────────────────────────

    /// Overwrite a cell's contents directly. No occupancy check.
    pub async fn assign_cell(&self, cell_id: i64, assignment: StockAssignment) -> Result<Cell> {
        check_quantity(&assignment)?;
        let previous = self
            .store
            .get_cell(cell_id)
            .await?
            .ok_or_else(|| Error::not_found("cell", cell_id))?;
        if let Some(product_id) = assignment.product_id {
            if self.store.get_product(product_id).await?.is_none() {
                return Err(Error::not_found("product", product_id));
            }
            if previous.is_occupied() && previous.product_id != Some(product_id) {
                warn!(
                    cell_id,
                    previous = ?previous.product_id,
                    product_id,
                    "Overwriting occupied cell"
                );
            }
        }

        let (cell, operation) = self
            .store
            .assign_cell(cell_id, &assignment, self.clock.now())
            .await?;
        info!(cell_id, product_id = ?cell.product_id, quantity = cell.quantity, "Cell assigned");

        self.events.publish(WarehouseEvent::CellUpdate { cell: cell.clone() });
        self.events
            .publish(WarehouseEvent::OperationUpdate { operation });
        self.publish_warehouse_data().await?;
        Ok(cell)
    }

    /// Overwrite the loading zone's contents directly.
    pub async fn set_loading_zone(&self, assignment: StockAssignment) -> Result<LoadingZone> {
        check_quantity(&assignment)?;
        if let Some(product_id) = assignment.product_id {
            if self.store.get_product(product_id).await?.is_none() {
                return Err(Error::not_found("product", product_id));
            }
        }

        let loading_zone = self
            .store
            .set_loading_zone(&assignment, self.clock.now())
            .await?;
        info!(
            product_id = ?loading_zone.product_id,
            quantity = loading_zone.quantity,
            "Loading zone set"
        );
        self.events.publish(WarehouseEvent::LoadingZoneUpdate {
            loading_zone: loading_zone.clone(),
        });
        Ok(loading_zone)
    }

    /// Overwrite the conveyor record directly; the RFID tag comes from the
    /// product.
    pub async fn set_conveyor(
        &self,
        has_product: bool,
        product_id: Option<i64>,
    ) -> Result<ConveyorStatus> {
        let product = match product_id {
            Some(_) if !has_product => {
                return Err(Error::Validation(
                    "an empty conveyor cannot carry a product".into(),
                ));
            }
            Some(id) => Some(
                self.store
                    .get_product(id)
                    .await?
                    .ok_or_else(|| Error::not_found("product", id))?,
            ),
            None => None,
        };

        let conveyor = self
            .store
            .set_conveyor(has_product, product.as_ref(), self.clock.now())
            .await?;
        info!(has_product, product_id = ?conveyor.product_id, "Conveyor set");
        self.events.publish(WarehouseEvent::ConveyorUpdate {
            conveyor: conveyor.clone(),
        });
        Ok(conveyor)
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        Ok(self.store.list_products().await?)
    }

    pub async fn create_product(&self, product: NewProduct) -> Result<Product> {
        let product = product.normalized()?;
        let product = match self.store.insert_product(&product, self.clock.now()).await {
            Ok(p) => p,
            Err(DatabaseError::Constraint(_)) => {
                return Err(Error::Validation(format!(
                    "RFID tag {} is already assigned to another product",
                    product.rfid_tag.as_deref().unwrap_or_default()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        info!(product_id = product.id, name = %product.name, "Product created");
        self.events.publish(WarehouseEvent::ProductCreated {
            product: product.clone(),
        });
        Ok(product)
    }

    pub fn register_device(&self, address: &str) -> Result<DeviceStatus> {
        Ok(self.gateway.register(address)?)
    }

    /// Record a sensor reading and mirror it onto the conveyor.
    pub async fn ingest_sensors(&self, reading: SensorReading) -> Result<SensorSnapshot> {
        let now = self.clock.now();
        let snapshot = self.sensors.record(&reading, now).await;
        self.events.publish(WarehouseEvent::SensorUpdate {
            sensors: snapshot.clone(),
        });

        let conveyor = if snapshot.product_present() {
            let product = match reading.tag() {
                Some(tag) => self.store.find_product_by_rfid(tag).await?,
                None => None,
            };
            let conveyor = self
                .store
                .update_conveyor(true, product.as_ref(), now)
                .await?;
            if let (Some(tag), Some(product)) = (reading.tag(), product) {
                info!(tag, product_id = product.id, "RFID matched product on conveyor");
                self.events.publish(WarehouseEvent::RfidDetected {
                    tag: tag.to_string(),
                    product,
                });
            }
            conveyor
        } else {
            self.store.update_conveyor(false, None, now).await?
        };
        self.events.publish(WarehouseEvent::ConveyorUpdate { conveyor });
        Ok(snapshot)
    }

    // ── Observers ───────────────────────────────────────────────────

    pub async fn snapshot(&self) -> Result<WarehouseSnapshot> {
        let state = self.store.warehouse_state().await?;
        Ok(WarehouseSnapshot {
            cells: state.cells,
            loading_zone: state.loading_zone,
            conveyor: state.conveyor,
            arm: self.arm.snapshot(),
            sensors: self.sensors.latest().await,
            device: self.gateway.status(),
            summary: state.summary,
            timestamp: self.clock.now(),
        })
    }

    pub async fn publish_warehouse_data(&self) -> Result<()> {
        let state = self.store.warehouse_state().await?;
        self.events.publish(WarehouseEvent::WarehouseData {
            cells: state.cells,
            loading_zone: state.loading_zone,
            timestamp: self.clock.now(),
        });
        Ok(())
    }

    /// Publish `warehouse_data` every `period`.
    pub fn spawn_snapshot_ticker(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if self.events.receiver_count() == 0 {
                    continue;
                }
                if let Err(e) = self.publish_warehouse_data().await {
                    warn!(error = %e, "Periodic snapshot failed");
                }
            }
        })
    }

    /// Turn every connectivity change into a `device_status` event.
    pub fn spawn_device_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.gateway.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let device = rx.borrow_and_update().clone();
                if device.connected {
                    info!(address = ?device.address, "Device connected");
                } else {
                    warn!(address = ?device.address, "Device disconnected");
                }
                events.publish(WarehouseEvent::DeviceStatus { device });
            }
        })
    }
}

fn check_quantity(assignment: &StockAssignment) -> Result<()> {
    match assignment.quantity {
        Some(quantity) if quantity < 1 => Err(Error::Validation(format!(
            "quantity must be at least 1, got {quantity}"
        ))),
        _ => Ok(()),
    }
}
