//! Warehouse data model: grid cells, products, zones, operations and auto tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Grid ────────────────────────────────────────────────────────────

/// Occupancy of a storage cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellStatus {
    Empty,
    Occupied,
}

/// One addressable slot in the storage grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: i64,
    pub row: i64,
    pub col: i64,
    /// Display label, `R{row}C{col}`.
    pub label: String,
    #[serde(default)]
    pub product_id: Option<i64>,
    pub quantity: i64,
    /// `Occupied` exactly when `product_id` is set.
    pub status: CellStatus,
    pub updated_at: DateTime<Utc>,
}

impl Cell {
    pub fn is_occupied(&self) -> bool {
        self.status == CellStatus::Occupied
    }
}

/// A registered product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// Unique across products when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for registering a product.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub rfid_tag: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl NewProduct {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: set RFID tag.
    pub fn with_rfid(mut self, tag: impl Into<String>) -> Self {
        self.rfid_tag = Some(tag.into());
        self
    }

    /// Trim fields, turn blanks into `None`, and require a name.
    pub fn normalized(self) -> Result<Self, Error> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("product name is required".into()));
        }
        Ok(Self {
            name,
            sku: non_blank(self.sku),
            rfid_tag: non_blank(self.rfid_tag),
            category: non_blank(self.category),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The single staging slot between the conveyor and the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingZone {
    #[serde(default)]
    pub product_id: Option<i64>,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}

/// What the conveyor sensors last reported, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyorStatus {
    pub has_product: bool,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_rfid: Option<String>,
    #[serde(default)]
    pub last_detected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Manual assignment of a cell's or the loading zone's contents (no device
/// involved).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StockAssignment {
    /// `None` empties the slot.
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i64>,
}

impl StockAssignment {
    /// Stored quantity: at least 1 while a product is present, 0 otherwise.
    pub fn stored_quantity(&self) -> i64 {
        match self.product_id {
            Some(_) => self.quantity.unwrap_or(1).max(1),
            None => 0,
        }
    }
}

// ── Priority ────────────────────────────────────────────────────────

/// Urgency shared by operations and auto tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Urgent => "URGENT",
        }
    }
}

// ── Operations ──────────────────────────────────────────────────────

/// Kind of directly issued device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Home,
    PickFromConveyor,
    PlaceInCell,
    TakeFromCell,
    GotoColumn,
    ManualCmd,
    MoveToLoading,
    ReturnToLoading,
    AutoStock,
    AutoRetrieve,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "HOME",
            Self::PickFromConveyor => "PICK_FROM_CONVEYOR",
            Self::PlaceInCell => "PLACE_IN_CELL",
            Self::TakeFromCell => "TAKE_FROM_CELL",
            Self::GotoColumn => "GOTO_COLUMN",
            Self::ManualCmd => "MANUAL_CMD",
            Self::MoveToLoading => "MOVE_TO_LOADING",
            Self::ReturnToLoading => "RETURN_TO_LOADING",
            Self::AutoStock => "AUTO_STOCK",
            Self::AutoRetrieve => "AUTO_RETRIEVE",
        }
    }

    fn requires_cell(&self) -> bool {
        matches!(
            self,
            Self::PlaceInCell | Self::TakeFromCell | Self::MoveToLoading
        )
    }

    fn requires_product(&self) -> bool {
        matches!(self, Self::PlaceInCell | Self::MoveToLoading)
    }
}

/// Lifecycle of an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Append-only record of one device command and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub kind: OperationKind,
    pub command: String,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub cell_id: Option<i64>,
    pub status: OperationStatus,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// An operator's request to run one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub command: String,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub cell_id: Option<i64>,
    #[serde(default)]
    pub priority: Priority,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            product_id: None,
            cell_id: None,
            priority: Priority::default(),
        }
    }

    /// Builder: target cell.
    pub fn with_cell(mut self, cell_id: i64) -> Self {
        self.cell_id = Some(cell_id);
        self
    }

    /// Builder: product involved.
    pub fn with_product(mut self, product_id: i64) -> Self {
        self.product_id = Some(product_id);
        self
    }

    /// Reject malformed requests before they reach the gate.
    pub fn validate(&self) -> Result<(), Error> {
        if self.command.trim().is_empty() {
            return Err(Error::Validation("command is required".into()));
        }
        if self.kind.requires_cell() && self.cell_id.is_none() {
            return Err(Error::Validation(format!(
                "{} requires a cell",
                self.kind.as_str()
            )));
        }
        if self.kind.requires_product() && self.product_id.is_none() {
            return Err(Error::Validation(format!(
                "{} requires a product",
                self.kind.as_str()
            )));
        }
        Ok(())
    }

    /// Store mutation applied once the device acknowledged the command.
    pub fn side_effect(&self) -> SideEffect {
        match (self.kind, self.cell_id, self.product_id) {
            (OperationKind::PlaceInCell, Some(cell_id), Some(product_id)) => {
                SideEffect::PlaceInCell { cell_id, product_id }
            }
            (OperationKind::TakeFromCell, Some(cell_id), _) => SideEffect::ClearCell { cell_id },
            (OperationKind::MoveToLoading, Some(cell_id), Some(product_id)) => {
                SideEffect::MoveToLoading { cell_id, product_id }
            }
            _ => SideEffect::None,
        }
    }
}

/// Entity mutation tied to a completed operation, applied atomically with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    None,
    PlaceInCell { cell_id: i64, product_id: i64 },
    ClearCell { cell_id: i64 },
    /// Clear the cell and stage the product in the loading zone.
    MoveToLoading { cell_id: i64, product_id: i64 },
}

// ── Auto tasks ──────────────────────────────────────────────────────

/// High-level intent executed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Stock,
    Retrieve,
    Move,
    Organize,
    InventoryCheck,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "STOCK",
            Self::Retrieve => "RETRIEVE",
            Self::Move => "MOVE",
            Self::Organize => "ORGANIZE",
            Self::InventoryCheck => "INVENTORY_CHECK",
        }
    }
}

/// Lifecycle of an auto task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// A queued auto task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTask {
    pub id: i64,
    pub task_type: TaskType,
    #[serde(default)]
    pub cell_id: Option<i64>,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_rfid: Option<String>,
    pub quantity: i64,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for queueing an auto task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutoTask {
    pub task_type: TaskType,
    #[serde(default)]
    pub cell_id: Option<i64>,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_rfid: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub priority: Priority,
}

impl NewAutoTask {
    pub fn new(task_type: TaskType, priority: Priority) -> Self {
        Self {
            task_type,
            cell_id: None,
            product_id: None,
            product_rfid: None,
            quantity: None,
            priority,
        }
    }

    /// Builder: cell.
    pub fn with_cell(mut self, cell_id: i64) -> Self {
        self.cell_id = Some(cell_id);
        self
    }

    /// Builder: product.
    pub fn with_product(mut self, product_id: i64) -> Self {
        self.product_id = Some(product_id);
        self
    }

    /// Builder: RFID tag read at intake.
    pub fn with_rfid(mut self, tag: impl Into<String>) -> Self {
        self.product_rfid = Some(tag.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(q) = self.quantity {
            if q < 1 {
                return Err(Error::Validation(format!(
                    "quantity must be at least 1, got {q}"
                )));
            }
        }
        Ok(())
    }
}

// ── Sensors & status ────────────────────────────────────────────────

/// Latest parsed sensor readings pushed by the conveyor controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub ldr1: bool,
    pub ldr2: bool,
    #[serde(default)]
    pub rfid: Option<String>,
    /// Opaque label from the device's own state machine.
    pub conveyor_state: String,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            ldr1: false,
            ldr2: false,
            rfid: None,
            conveyor_state: "IDLE".to_string(),
            last_update: None,
        }
    }
}

impl SensorSnapshot {
    /// Either light barrier sees an item.
    pub fn product_present(&self) -> bool {
        self.ldr1 || self.ldr2
    }
}

/// Aggregate counts for the dashboard header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub cells_total: i64,
    pub cells_occupied: i64,
    pub cells_available: i64,
    pub products: i64,
    pub pending_operations: i64,
    pub pending_tasks: i64,
}
