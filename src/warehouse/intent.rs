//! Inbound intents and their replies.

use serde::{Deserialize, Serialize};

use crate::arm::{ArmSnapshot, Mode};
use crate::broadcast::WarehouseSnapshot;
use crate::device::DeviceStatus;
use crate::ops::OperationOutcome;
use crate::warehouse::model::{
    AutoTask, Cell, ConveyorStatus, LoadingZone, NewAutoTask, NewProduct, Operation,
    OperationRequest, Product, SensorSnapshot, TaskStatus,
};
use crate::warehouse::sensors::SensorReading;

/// Everything a client may ask of the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    /// Run one device command now.
    CreateOperation(OperationRequest),
    /// Queue a task for auto mode.
    CreateAutoTask(NewAutoTask),
    CancelAutoTask { task_id: i64 },
    SetMode { mode: Mode },
    /// Record a cell's contents without moving anything.
    AssignCell {
        cell_id: i64,
        #[serde(default)]
        product_id: Option<i64>,
        #[serde(default)]
        quantity: Option<i64>,
    },
    /// Record what sits in the loading zone; no `product_id` clears it.
    SetLoadingZone {
        #[serde(default)]
        product_id: Option<i64>,
        #[serde(default)]
        quantity: Option<i64>,
    },
    /// Overwrite the conveyor record without a sensor reading.
    SetConveyor {
        has_product: bool,
        #[serde(default)]
        product_id: Option<i64>,
    },
    RegisterDevice { address: String },
    IngestSensors(SensorReading),
    CreateProduct(NewProduct),
    ListProducts,
    /// Newest first; `limit` defaults to 20.
    ListOperations {
        #[serde(default)]
        limit: Option<u32>,
    },
    GetOperation { operation_id: i64 },
    /// Scheduler order; all statuses unless one is given.
    ListAutoTasks {
        #[serde(default)]
        status: Option<TaskStatus>,
    },
    /// Publish a fresh `warehouse_data` to everyone.
    Refresh,
    /// Reply with the full snapshot.
    RequestStatus,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateOperation(_) => "create_operation",
            Self::CreateAutoTask(_) => "create_auto_task",
            Self::CancelAutoTask { .. } => "cancel_auto_task",
            Self::SetMode { .. } => "set_mode",
            Self::AssignCell { .. } => "assign_cell",
            Self::SetLoadingZone { .. } => "set_loading_zone",
            Self::SetConveyor { .. } => "set_conveyor",
            Self::RegisterDevice { .. } => "register_device",
            Self::IngestSensors(_) => "ingest_sensors",
            Self::CreateProduct(_) => "create_product",
            Self::ListProducts => "list_products",
            Self::ListOperations { .. } => "list_operations",
            Self::GetOperation { .. } => "get_operation",
            Self::ListAutoTasks { .. } => "list_auto_tasks",
            Self::Refresh => "refresh",
            Self::RequestStatus => "request_status",
        }
    }
}

/// Successful result of an intent.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum IntentResult {
    Operation(OperationOutcome),
    OperationRecord(Operation),
    Operations(Vec<Operation>),
    Task(AutoTask),
    Tasks(Vec<AutoTask>),
    Arm(ArmSnapshot),
    Cell(Cell),
    LoadingZone(LoadingZone),
    Conveyor(ConveyorStatus),
    Device(DeviceStatus),
    Sensors(SensorSnapshot),
    Product(Product),
    Products(Vec<Product>),
    Snapshot(Box<WarehouseSnapshot>),
    Refreshed,
}

/// Direct answer to the client that sent an intent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentReply {
    IntentOk {
        action: &'static str,
        result: IntentResult,
    },
    IntentError {
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<&'static str>,
        kind: &'static str,
        message: String,
    },
}
