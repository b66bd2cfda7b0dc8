//! `Database` trait: single async interface for all warehouse persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::warehouse::model::{
    AutoTask, Cell, ConveyorStatus, LoadingZone, NewAutoTask, NewProduct, Operation,
    OperationRequest, Product, SideEffect, StatusSummary, StockAssignment, TaskStatus,
};

/// Result of completing an operation: the final record plus every entity the
/// side effect touched.
#[derive(Debug, Clone)]
pub struct Completion {
    pub operation: Operation,
    pub cells: Vec<Cell>,
    pub loading_zone: Option<LoadingZone>,
}

/// Cells, zones and counts read together, so no move between a cell and the
/// loading zone is seen half-applied.
#[derive(Debug, Clone)]
pub struct WarehouseState {
    pub cells: Vec<Cell>,
    pub loading_zone: LoadingZone,
    pub conveyor: ConveyorStatus,
    pub summary: StatusSummary,
}

/// Counts of records reset by startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovered {
    pub operations: u64,
    pub tasks: u64,
}

/// Backend-agnostic store. Every multi-row mutation is one transaction.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Create missing grid cells and the singleton zone rows. Idempotent.
    async fn seed_grid(&self, rows: u32, cols: u32, now: DateTime<Utc>)
    -> Result<u64, DatabaseError>;

    // ── Grid & products ─────────────────────────────────────────────

    async fn get_cell(&self, id: i64) -> Result<Option<Cell>, DatabaseError>;

    async fn insert_product(
        &self,
        product: &NewProduct,
        now: DateTime<Utc>,
    ) -> Result<Product, DatabaseError>;

    async fn get_product(&self, id: i64) -> Result<Option<Product>, DatabaseError>;

    async fn find_product_by_rfid(&self, tag: &str) -> Result<Option<Product>, DatabaseError>;

    async fn list_products(&self) -> Result<Vec<Product>, DatabaseError>;

    async fn get_loading_zone(&self) -> Result<LoadingZone, DatabaseError>;

    /// Consistent read of every displayed entity.
    async fn warehouse_state(&self) -> Result<WarehouseState, DatabaseError>;

    /// Overwrite the loading zone's contents.
    async fn set_loading_zone(
        &self,
        assignment: &StockAssignment,
        now: DateTime<Utc>,
    ) -> Result<LoadingZone, DatabaseError>;

    /// Overwrite the conveyor record, product reference included.
    async fn set_conveyor(
        &self,
        has_product: bool,
        product: Option<&Product>,
        now: DateTime<Utc>,
    ) -> Result<ConveyorStatus, DatabaseError>;

    /// Record a conveyor reading. When nothing is detected the last product
    /// reference is kept.
    async fn update_conveyor(
        &self,
        has_product: bool,
        product: Option<&Product>,
        now: DateTime<Utc>,
    ) -> Result<ConveyorStatus, DatabaseError>;

    /// Set a cell's contents and log a completed `ASSIGN_CELL` operation.
    async fn assign_cell(
        &self,
        cell_id: i64,
        assignment: &StockAssignment,
        now: DateTime<Utc>,
    ) -> Result<(Cell, Operation), DatabaseError>;

    // ── Operations ──────────────────────────────────────────────────

    /// Insert the record as `PENDING` and advance it to `PROCESSING` in one
    /// transaction, so a failure never leaves a `PENDING` row behind.
    async fn begin_operation(
        &self,
        request: &OperationRequest,
        now: DateTime<Utc>,
    ) -> Result<Operation, DatabaseError>;

    async fn get_operation(&self, id: i64) -> Result<Option<Operation>, DatabaseError>;

    /// Most recent first.
    async fn list_operations(&self, limit: u32) -> Result<Vec<Operation>, DatabaseError>;

    /// `PROCESSING` → `ERROR`.
    async fn fail_operation(
        &self,
        id: i64,
        error: &str,
        elapsed_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Operation, DatabaseError>;

    /// `PROCESSING` → `COMPLETED` together with the side effect, atomically.
    async fn complete_operation(
        &self,
        id: i64,
        elapsed_ms: i64,
        effect: &SideEffect,
        now: DateTime<Utc>,
    ) -> Result<Completion, DatabaseError>;

    // ── Auto tasks ──────────────────────────────────────────────────

    async fn insert_auto_task(
        &self,
        task: &NewAutoTask,
        now: DateTime<Utc>,
    ) -> Result<AutoTask, DatabaseError>;

    async fn get_auto_task(&self, id: i64) -> Result<Option<AutoTask>, DatabaseError>;

    /// Tasks in scheduler order, optionally filtered by status.
    async fn list_auto_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<AutoTask>, DatabaseError>;

    /// The pending task the scheduler runs next.
    async fn next_pending_task(&self) -> Result<Option<AutoTask>, DatabaseError>;

    /// Conditional `PENDING` → `PROCESSING`. `None` if the task is no longer pending.
    async fn claim_auto_task(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AutoTask>, DatabaseError>;

    /// `PROCESSING` → `COMPLETED` (`error` is `None`) or `FAILED`.
    async fn finish_auto_task(
        &self,
        id: i64,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AutoTask, DatabaseError>;

    /// Conditional `PENDING` → `CANCELLED`. `None` if the task is not pending.
    async fn cancel_auto_task(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AutoTask>, DatabaseError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Fail everything left `PROCESSING` by a previous run.
    async fn recover_interrupted(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Recovered, DatabaseError>;
}
