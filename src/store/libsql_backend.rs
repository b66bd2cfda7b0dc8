//! libSQL backend: async `Database` trait implementation.
//!
//! One connection behind an async mutex: a transaction holds the lock for its
//! whole lifetime, so no other statement can interleave with it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Completion, Database, Recovered, WarehouseState};
use crate::warehouse::model::{
    AutoTask, Cell, ConveyorStatus, LoadingZone, NewAutoTask, NewProduct, Operation,
    OperationKind, OperationRequest, OperationStatus, Product, SideEffect, StatusSummary,
    StockAssignment, TaskStatus,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    _db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    /// Run a raw statement. Tests use this to break invariants on purpose.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(sql, ()).await.map_err(|e| db_err("execute_raw", e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical fixed-width write format, so text order matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str, name: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "{name}: unparseable timestamp {s:?}"
    )))
}

fn time_col(row: &libsql::Row, idx: i32, name: &str) -> Result<DateTime<Utc>, DatabaseError> {
    parse_datetime(&text_col(row, idx, name)?, name)
}

fn opt_time_col(
    row: &libsql::Row,
    idx: i32,
    name: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    row.get::<String>(idx)
        .ok()
        .map(|s| parse_datetime(&s, name))
        .transpose()
}

fn db_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn not_found(entity: &str, id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn int_col(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn text_col(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

/// Enums are stored as their serde names (`PENDING`, `PLACE_IN_CELL`, ...).
fn enum_col<T: DeserializeOwned>(row: &libsql::Row, idx: i32, name: &str) -> Result<T, DatabaseError> {
    let raw = text_col(row, idx, name)?;
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| DatabaseError::Serialization(format!("{name}: {e}")))
}

async fn query_all<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(|e| db_err(op, e))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| db_err(op, e))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn query_opt<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(|e| db_err(op, e))?;
    match rows.next().await.map_err(|e| db_err(op, e))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const CELL_COLUMNS: &str = "id, row_num, col_num, label, product_id, quantity, status, updated_at";

const PRODUCT_COLUMNS: &str = "id, name, sku, rfid_tag, category, created_at";

const OPERATION_COLUMNS: &str = "id, kind, command, product_id, cell_id, status, priority, error_message, execution_time_ms, created_at, started_at, completed_at";

const TASK_COLUMNS: &str = "id, task_type, cell_id, product_id, product_rfid, quantity, priority, status, error_message, created_at, started_at, completed_at, updated_at";

/// Scheduler order: priority rank, then creation time, then id.
const TASK_ORDER: &str = "CASE priority WHEN 'URGENT' THEN 0 WHEN 'HIGH' THEN 1 WHEN 'MEDIUM' THEN 2 ELSE 3 END, created_at, id";

fn row_to_cell(row: &libsql::Row) -> Result<Cell, DatabaseError> {
    Ok(Cell {
        id: int_col(row, 0, "cell.id")?,
        row: int_col(row, 1, "cell.row_num")?,
        col: int_col(row, 2, "cell.col_num")?,
        label: text_col(row, 3, "cell.label")?,
        product_id: row.get::<i64>(4).ok(),
        quantity: row.get::<i64>(5).unwrap_or(0),
        status: enum_col(row, 6, "cell.status")?,
        updated_at: time_col(row, 7, "cell.updated_at")?,
    })
}

fn row_to_product(row: &libsql::Row) -> Result<Product, DatabaseError> {
    Ok(Product {
        id: int_col(row, 0, "product.id")?,
        name: text_col(row, 1, "product.name")?,
        sku: row.get::<String>(2).ok(),
        rfid_tag: row.get::<String>(3).ok(),
        category: row.get::<String>(4).ok(),
        created_at: time_col(row, 5, "product.created_at")?,
    })
}

fn row_to_operation(row: &libsql::Row) -> Result<Operation, DatabaseError> {
    Ok(Operation {
        id: int_col(row, 0, "operation.id")?,
        kind: enum_col(row, 1, "operation.kind")?,
        command: text_col(row, 2, "operation.command")?,
        product_id: row.get::<i64>(3).ok(),
        cell_id: row.get::<i64>(4).ok(),
        status: enum_col(row, 5, "operation.status")?,
        priority: enum_col(row, 6, "operation.priority")?,
        error_message: row.get::<String>(7).ok(),
        execution_time_ms: row.get::<i64>(8).ok(),
        created_at: time_col(row, 9, "operation.created_at")?,
        started_at: opt_time_col(row, 10, "operation.started_at")?,
        completed_at: opt_time_col(row, 11, "operation.completed_at")?,
    })
}

fn row_to_task(row: &libsql::Row) -> Result<AutoTask, DatabaseError> {
    Ok(AutoTask {
        id: int_col(row, 0, "task.id")?,
        task_type: enum_col(row, 1, "task.task_type")?,
        cell_id: row.get::<i64>(2).ok(),
        product_id: row.get::<i64>(3).ok(),
        product_rfid: row.get::<String>(4).ok(),
        quantity: row.get::<i64>(5).unwrap_or(1),
        priority: enum_col(row, 6, "task.priority")?,
        status: enum_col(row, 7, "task.status")?,
        error_message: row.get::<String>(8).ok(),
        created_at: time_col(row, 9, "task.created_at")?,
        started_at: opt_time_col(row, 10, "task.started_at")?,
        completed_at: opt_time_col(row, 11, "task.completed_at")?,
        updated_at: time_col(row, 12, "task.updated_at")?,
    })
}

fn row_to_loading_zone(row: &libsql::Row) -> Result<LoadingZone, DatabaseError> {
    Ok(LoadingZone {
        product_id: row.get::<i64>(0).ok(),
        quantity: row.get::<i64>(1).unwrap_or(0),
        updated_at: time_col(row, 2, "loading_zone.updated_at")?,
    })
}

fn row_to_conveyor(row: &libsql::Row) -> Result<ConveyorStatus, DatabaseError> {
    Ok(ConveyorStatus {
        has_product: row.get::<i64>(0).unwrap_or(0) != 0,
        product_id: row.get::<i64>(1).ok(),
        product_rfid: row.get::<String>(2).ok(),
        last_detected_at: opt_time_col(row, 3, "conveyor.last_detected_at")?,
        updated_at: time_col(row, 4, "conveyor.updated_at")?,
    })
}

// ── Shared statements (usable inside a transaction) ─────────────────

async fn fetch_cell(conn: &Connection, id: i64) -> Result<Option<Cell>, DatabaseError> {
    query_opt(
        conn,
        "get_cell",
        &format!("SELECT {CELL_COLUMNS} FROM cells WHERE id = ?1"),
        params![id],
        row_to_cell,
    )
    .await
}

async fn fetch_cells(conn: &Connection) -> Result<Vec<Cell>, DatabaseError> {
    query_all(
        conn,
        "list_cells",
        &format!("SELECT {CELL_COLUMNS} FROM cells ORDER BY row_num, col_num"),
        (),
        row_to_cell,
    )
    .await
}

async fn fetch_product(conn: &Connection, id: i64) -> Result<Option<Product>, DatabaseError> {
    query_opt(
        conn,
        "get_product",
        &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
        params![id],
        row_to_product,
    )
    .await
}

async fn fetch_operation(conn: &Connection, id: i64) -> Result<Operation, DatabaseError> {
    query_opt(
        conn,
        "get_operation",
        &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
        params![id],
        row_to_operation,
    )
    .await?
    .ok_or_else(|| not_found("operation", id))
}

async fn fetch_task(conn: &Connection, id: i64) -> Result<Option<AutoTask>, DatabaseError> {
    query_opt(
        conn,
        "get_auto_task",
        &format!("SELECT {TASK_COLUMNS} FROM auto_tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .await
}

async fn fetch_loading_zone(conn: &Connection) -> Result<LoadingZone, DatabaseError> {
    query_opt(
        conn,
        "get_loading_zone",
        "SELECT product_id, quantity, updated_at FROM loading_zone WHERE id = 1",
        (),
        row_to_loading_zone,
    )
    .await?
    .ok_or_else(|| not_found("loading_zone", 1))
}

async fn fetch_conveyor(conn: &Connection) -> Result<ConveyorStatus, DatabaseError> {
    query_opt(
        conn,
        "get_conveyor",
        "SELECT has_product, product_id, product_rfid, last_detected_at, updated_at FROM conveyor_status WHERE id = 1",
        (),
        row_to_conveyor,
    )
    .await?
    .ok_or_else(|| not_found("conveyor_status", 1))
}

async fn fetch_summary(conn: &Connection) -> Result<StatusSummary, DatabaseError> {
    let summary = query_opt(
        conn,
        "status_summary",
        "SELECT
            (SELECT COUNT(*) FROM cells),
            (SELECT COUNT(*) FROM cells WHERE status = 'OCCUPIED'),
            (SELECT COUNT(*) FROM products),
            (SELECT COUNT(*) FROM operations WHERE status IN ('PENDING', 'PROCESSING')),
            (SELECT COUNT(*) FROM auto_tasks WHERE status = 'PENDING')",
        (),
        |row| {
            let cells_total = int_col(row, 0, "cells_total")?;
            let cells_occupied = int_col(row, 1, "cells_occupied")?;
            Ok(StatusSummary {
                cells_total,
                cells_occupied,
                cells_available: cells_total - cells_occupied,
                products: int_col(row, 2, "products")?,
                pending_operations: int_col(row, 3, "pending_operations")?,
                pending_tasks: int_col(row, 4, "pending_tasks")?,
            })
        },
    )
    .await?;
    Ok(summary.unwrap_or_default())
}

/// Set a cell's contents; status follows from the product reference.
async fn write_cell(
    conn: &Connection,
    cell_id: i64,
    product_id: Option<i64>,
    quantity: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    let status = if product_id.is_some() { "OCCUPIED" } else { "EMPTY" };
    let changed = conn
        .execute(
            "UPDATE cells SET product_id = ?1, quantity = ?2, status = ?3, updated_at = ?4 WHERE id = ?5",
            params![opt_int(product_id), quantity, status, now, cell_id],
        )
        .await
        .map_err(|e| db_err("write_cell", e))?;
    if changed == 0 {
        return Err(not_found("cell", cell_id));
    }
    Ok(())
}

async fn write_loading_zone(
    conn: &Connection,
    product_id: Option<i64>,
    quantity: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE loading_zone SET product_id = ?1, quantity = ?2, updated_at = ?3 WHERE id = 1",
            params![opt_int(product_id), quantity, now],
        )
        .await
        .map_err(|e| db_err("write_loading_zone", e))?;
    if changed == 0 {
        return Err(not_found("loading_zone", 1));
    }
    Ok(())
}

/// Apply a side effect and report which cells changed and whether the
/// loading zone changed.
async fn apply_side_effect(
    conn: &Connection,
    effect: &SideEffect,
    now: &str,
) -> Result<(Vec<i64>, bool), DatabaseError> {
    match *effect {
        SideEffect::None => Ok((Vec::new(), false)),
        SideEffect::PlaceInCell { cell_id, product_id } => {
            write_cell(conn, cell_id, Some(product_id), 1, now).await?;
            Ok((vec![cell_id], false))
        }
        SideEffect::ClearCell { cell_id } => {
            write_cell(conn, cell_id, None, 0, now).await?;
            Ok((vec![cell_id], false))
        }
        SideEffect::MoveToLoading { cell_id, product_id } => {
            write_cell(conn, cell_id, None, 0, now).await?;
            write_loading_zone(conn, Some(product_id), 1, now).await?;
            Ok((vec![cell_id], true))
        }
    }
}

/// Run `work` inside a transaction; roll back on any error.
macro_rules! in_transaction {
    ($conn:expr, $op:expr, |$tx:ident| $work:expr) => {{
        let $tx = $conn
            .transaction()
            .await
            .map_err(|e| db_err($op, e))?;
        let result = $work;
        match result {
            Ok(value) => {
                $tx.commit().await.map_err(|e| db_err($op, e))?;
                Ok(value)
            }
            Err(err) => {
                let _ = $tx.rollback().await;
                Err(err)
            }
        }
    }};
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    async fn seed_grid(
        &self,
        rows: u32,
        cols: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let inserted: Result<u64, DatabaseError> = in_transaction!(conn, "seed_grid", |tx| {
            async {
                let mut inserted = 0;
                for row in 1..=i64::from(rows) {
                    for col in 1..=i64::from(cols) {
                        inserted += tx
                            .execute(
                                "INSERT OR IGNORE INTO cells (row_num, col_num, label, quantity, status, updated_at) VALUES (?1, ?2, ?3, 0, 'EMPTY', ?4)",
                                params![row, col, format!("R{row}C{col}"), now.as_str()],
                            )
                            .await
                            .map_err(|e| db_err("seed_grid", e))?;
                    }
                }
                tx.execute(
                    "INSERT OR IGNORE INTO loading_zone (id, quantity, updated_at) VALUES (1, 0, ?1)",
                    params![now.as_str()],
                )
                .await
                .map_err(|e| db_err("seed_grid", e))?;
                tx.execute(
                    "INSERT OR IGNORE INTO conveyor_status (id, has_product, updated_at) VALUES (1, 0, ?1)",
                    params![now.as_str()],
                )
                .await
                .map_err(|e| db_err("seed_grid", e))?;
                Ok::<_, DatabaseError>(inserted)
            }
            .await
        });
        let inserted = inserted?;
        if inserted > 0 {
            info!(rows, cols, inserted, "Seeded storage grid");
        }
        Ok(inserted)
    }

    // ── Grid & products ─────────────────────────────────────────────

    async fn get_cell(&self, id: i64) -> Result<Option<Cell>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_cell(&conn, id).await
    }

    async fn insert_product(
        &self,
        product: &NewProduct,
        now: DateTime<Utc>,
    ) -> Result<Product, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO products (name, sku, rfid_tag, category, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                product.name.as_str(),
                opt_text(product.sku.as_deref()),
                opt_text(product.rfid_tag.as_deref()),
                opt_text(product.category.as_deref()),
                ts(now),
            ],
        )
        .await
        .map_err(|e| db_err("insert_product", e))?;

        let id = conn.last_insert_rowid();
        debug!(product_id = id, name = %product.name, "Product inserted");
        fetch_product(&conn, id)
            .await?
            .ok_or_else(|| not_found("product", id))
    }

    async fn get_product(&self, id: i64) -> Result<Option<Product>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_product(&conn, id).await
    }

    async fn find_product_by_rfid(&self, tag: &str) -> Result<Option<Product>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_opt(
            &conn,
            "find_product_by_rfid",
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE rfid_tag = ?1"),
            params![tag],
            row_to_product,
        )
        .await
    }

    async fn list_products(&self) -> Result<Vec<Product>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_products",
            &format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name, id"),
            (),
            row_to_product,
        )
        .await
    }

    async fn get_loading_zone(&self) -> Result<LoadingZone, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_loading_zone(&conn).await
    }

    async fn warehouse_state(&self) -> Result<WarehouseState, DatabaseError> {
        let conn = self.conn.lock().await;
        Ok(WarehouseState {
            cells: fetch_cells(&conn).await?,
            loading_zone: fetch_loading_zone(&conn).await?,
            conveyor: fetch_conveyor(&conn).await?,
            summary: fetch_summary(&conn).await?,
        })
    }

    async fn set_loading_zone(
        &self,
        assignment: &StockAssignment,
        now: DateTime<Utc>,
    ) -> Result<LoadingZone, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let written: Result<(), DatabaseError> = in_transaction!(conn, "set_loading_zone", |tx| {
            async {
                if let Some(product_id) = assignment.product_id {
                    if fetch_product(&tx, product_id).await?.is_none() {
                        return Err(not_found("product", product_id));
                    }
                }
                write_loading_zone(&tx, assignment.product_id, assignment.stored_quantity(), &now)
                    .await
            }
            .await
        });
        written?;
        fetch_loading_zone(&conn).await
    }

    async fn set_conveyor(
        &self,
        has_product: bool,
        product: Option<&Product>,
        now: DateTime<Utc>,
    ) -> Result<ConveyorStatus, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE conveyor_status SET has_product = ?1, product_id = ?2, product_rfid = ?3, last_detected_at = ?4, updated_at = ?4 WHERE id = 1",
                params![
                    i64::from(has_product),
                    opt_int(product.map(|p| p.id)),
                    opt_text(product.and_then(|p| p.rfid_tag.as_deref())),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| db_err("set_conveyor", e))?;
        if changed == 0 {
            return Err(not_found("conveyor_status", 1));
        }
        fetch_conveyor(&conn).await
    }

    async fn update_conveyor(
        &self,
        has_product: bool,
        product: Option<&Product>,
        now: DateTime<Utc>,
    ) -> Result<ConveyorStatus, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let result = match (has_product, product) {
            (true, Some(product)) => {
                conn.execute(
                    "UPDATE conveyor_status SET has_product = 1, product_id = ?1, product_rfid = ?2, last_detected_at = ?3, updated_at = ?3 WHERE id = 1",
                    params![product.id, opt_text(product.rfid_tag.as_deref()), now.as_str()],
                )
                .await
            }
            (true, None) => {
                conn.execute(
                    "UPDATE conveyor_status SET has_product = 1, last_detected_at = ?1, updated_at = ?1 WHERE id = 1",
                    params![now.as_str()],
                )
                .await
            }
            (false, _) => {
                conn.execute(
                    "UPDATE conveyor_status SET has_product = 0, updated_at = ?1 WHERE id = 1",
                    params![now.as_str()],
                )
                .await
            }
        };
        if result.map_err(|e| db_err("update_conveyor", e))? == 0 {
            return Err(not_found("conveyor_status", 1));
        }
        fetch_conveyor(&conn).await
    }

    async fn assign_cell(
        &self,
        cell_id: i64,
        assignment: &StockAssignment,
        now: DateTime<Utc>,
    ) -> Result<(Cell, Operation), DatabaseError> {
        let now = ts(now);
        let quantity = assignment.stored_quantity();
        let conn = self.conn.lock().await;

        let operation_id: Result<i64, DatabaseError> = in_transaction!(conn, "assign_cell", |tx| {
            async {
                if fetch_cell(&tx, cell_id).await?.is_none() {
                    return Err(not_found("cell", cell_id));
                }
                if let Some(product_id) = assignment.product_id {
                    if fetch_product(&tx, product_id).await?.is_none() {
                        return Err(not_found("product", product_id));
                    }
                }
                write_cell(&tx, cell_id, assignment.product_id, quantity, &now).await?;
                tx.execute(
                    "INSERT INTO operations (kind, command, product_id, cell_id, status, priority, execution_time_ms, created_at, started_at, completed_at) VALUES (?1, ?2, ?3, ?4, 'COMPLETED', 'MEDIUM', 0, ?5, ?5, ?5)",
                    params![
                        OperationKind::ManualCmd.as_str(),
                        format!("ASSIGN_CELL:{cell_id}"),
                        opt_int(assignment.product_id),
                        cell_id,
                        now.as_str(),
                    ],
                )
                .await
                .map_err(|e| db_err("assign_cell", e))?;
                Ok::<_, DatabaseError>(tx.last_insert_rowid())
            }
            .await
        });
        let operation_id = operation_id?;

        let cell = fetch_cell(&conn, cell_id)
            .await?
            .ok_or_else(|| not_found("cell", cell_id))?;
        let operation = fetch_operation(&conn, operation_id).await?;
        Ok((cell, operation))
    }

    // ── Operations ──────────────────────────────────────────────────

    async fn begin_operation(
        &self,
        request: &OperationRequest,
        now: DateTime<Utc>,
    ) -> Result<Operation, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let id: Result<i64, DatabaseError> = in_transaction!(conn, "begin_operation", |tx| {
            async {
                tx.execute(
                    "INSERT INTO operations (kind, command, product_id, cell_id, status, priority, created_at) VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6)",
                    params![
                        request.kind.as_str(),
                        request.command.trim(),
                        opt_int(request.product_id),
                        opt_int(request.cell_id),
                        request.priority.as_str(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(|e| db_err("begin_operation", e))?;
                let id = tx.last_insert_rowid();
                let changed = tx
                    .execute(
                        "UPDATE operations SET status = 'PROCESSING', started_at = ?1 WHERE id = ?2 AND status = 'PENDING'",
                        params![now.as_str(), id],
                    )
                    .await
                    .map_err(|e| db_err("begin_operation", e))?;
                if changed == 0 {
                    return Err(DatabaseError::Constraint(format!(
                        "operation {id} is not pending"
                    )));
                }
                Ok::<_, DatabaseError>(id)
            }
            .await
        });
        fetch_operation(&conn, id?).await
    }

    async fn get_operation(&self, id: i64) -> Result<Option<Operation>, DatabaseError> {
        let conn = self.conn.lock().await;
        match fetch_operation(&conn, id).await {
            Ok(op) => Ok(Some(op)),
            Err(DatabaseError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_operations(&self, limit: u32) -> Result<Vec<Operation>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_all(
            &conn,
            "list_operations",
            &format!("SELECT {OPERATION_COLUMNS} FROM operations ORDER BY id DESC LIMIT ?1"),
            params![i64::from(limit)],
            row_to_operation,
        )
        .await
    }

    async fn fail_operation(
        &self,
        id: i64,
        error: &str,
        elapsed_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Operation, DatabaseError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE operations SET status = 'ERROR', error_message = ?1, execution_time_ms = ?2, completed_at = ?3 WHERE id = ?4 AND status = 'PROCESSING'",
                params![error, elapsed_ms, ts(now), id],
            )
            .await
            .map_err(|e| db_err("fail_operation", e))?;
        if changed == 0 {
            return Err(DatabaseError::Constraint(format!(
                "operation {id} is not processing"
            )));
        }
        fetch_operation(&conn, id).await
    }

    async fn complete_operation(
        &self,
        id: i64,
        elapsed_ms: i64,
        effect: &SideEffect,
        now: DateTime<Utc>,
    ) -> Result<Completion, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;

        let touched: Result<(Vec<i64>, bool), DatabaseError> =
            in_transaction!(conn, "complete_operation", |tx| {
                async {
                    let changed = tx
                        .execute(
                            "UPDATE operations SET status = 'COMPLETED', execution_time_ms = ?1, completed_at = ?2 WHERE id = ?3 AND status = 'PROCESSING'",
                            params![elapsed_ms, now.as_str(), id],
                        )
                        .await
                        .map_err(|e| db_err("complete_operation", e))?;
                    if changed == 0 {
                        return Err(DatabaseError::Constraint(format!(
                            "operation {id} is not processing"
                        )));
                    }
                    apply_side_effect(&tx, effect, &now).await
                }
                .await
            });
        let (cell_ids, zone_touched) = touched?;

        let operation = fetch_operation(&conn, id).await?;
        let mut cells = Vec::with_capacity(cell_ids.len());
        for cell_id in cell_ids {
            if let Some(cell) = fetch_cell(&conn, cell_id).await? {
                cells.push(cell);
            }
        }
        let loading_zone = if zone_touched {
            Some(fetch_loading_zone(&conn).await?)
        } else {
            None
        };
        Ok(Completion {
            operation,
            cells,
            loading_zone,
        })
    }

    // ── Auto tasks ──────────────────────────────────────────────────

    async fn insert_auto_task(
        &self,
        task: &NewAutoTask,
        now: DateTime<Utc>,
    ) -> Result<AutoTask, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO auto_tasks (task_type, cell_id, product_id, product_rfid, quantity, priority, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?7)",
            params![
                task.task_type.as_str(),
                opt_int(task.cell_id),
                opt_int(task.product_id),
                opt_text(task.product_rfid.as_deref()),
                task.quantity.unwrap_or(1),
                task.priority.as_str(),
                now.as_str(),
            ],
        )
        .await
        .map_err(|e| db_err("insert_auto_task", e))?;
        let id = conn.last_insert_rowid();
        fetch_task(&conn, id)
            .await?
            .ok_or_else(|| not_found("auto_task", id))
    }

    async fn get_auto_task(&self, id: i64) -> Result<Option<AutoTask>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_task(&conn, id).await
    }

    async fn list_auto_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<AutoTask>, DatabaseError> {
        let conn = self.conn.lock().await;
        match status {
            Some(status) => {
                query_all(
                    &conn,
                    "list_auto_tasks",
                    &format!("SELECT {TASK_COLUMNS} FROM auto_tasks WHERE status = ?1 ORDER BY {TASK_ORDER}"),
                    params![status.as_str()],
                    row_to_task,
                )
                .await
            }
            None => {
                query_all(
                    &conn,
                    "list_auto_tasks",
                    &format!("SELECT {TASK_COLUMNS} FROM auto_tasks ORDER BY {TASK_ORDER}"),
                    (),
                    row_to_task,
                )
                .await
            }
        }
    }

    async fn next_pending_task(&self) -> Result<Option<AutoTask>, DatabaseError> {
        let conn = self.conn.lock().await;
        query_opt(
            &conn,
            "next_pending_task",
            &format!(
                "SELECT {TASK_COLUMNS} FROM auto_tasks WHERE status = 'PENDING' ORDER BY {TASK_ORDER} LIMIT 1"
            ),
            (),
            row_to_task,
        )
        .await
    }

    async fn claim_auto_task(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AutoTask>, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE auto_tasks SET status = 'PROCESSING', started_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'PENDING'",
                params![now.as_str(), id],
            )
            .await
            .map_err(|e| db_err("claim_auto_task", e))?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_task(&conn, id).await
    }

    async fn finish_auto_task(
        &self,
        id: i64,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AutoTask, DatabaseError> {
        let status = match error {
            None => TaskStatus::Completed,
            Some(_) => TaskStatus::Failed,
        };
        let now = ts(now);
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE auto_tasks SET status = ?1, error_message = ?2, completed_at = ?3, updated_at = ?3 WHERE id = ?4 AND status = 'PROCESSING'",
                params![status.as_str(), opt_text(error), now.as_str(), id],
            )
            .await
            .map_err(|e| db_err("finish_auto_task", e))?;
        if changed == 0 {
            return match fetch_task(&conn, id).await? {
                Some(task) => Err(DatabaseError::Constraint(format!(
                    "auto task {id} is {}, not PROCESSING",
                    task.status.as_str()
                ))),
                None => Err(not_found("auto_task", id)),
            };
        }
        fetch_task(&conn, id)
            .await?
            .ok_or_else(|| not_found("auto_task", id))
    }

    async fn cancel_auto_task(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AutoTask>, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE auto_tasks SET status = 'CANCELLED', completed_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'PENDING'",
                params![now.as_str(), id],
            )
            .await
            .map_err(|e| db_err("cancel_auto_task", e))?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_task(&conn, id).await
    }

    // ── Maintenance ─────────────────────────────────────────────────

    async fn recover_interrupted(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Recovered, DatabaseError> {
        let now = ts(now);
        let conn = self.conn.lock().await;
        in_transaction!(conn, "recover_interrupted", |tx| {
            async {
                let operations = tx
                    .execute(
                        "UPDATE operations SET status = ?1, error_message = ?2, completed_at = ?3 WHERE status = 'PROCESSING'",
                        params![OperationStatus::Error.as_str(), reason, now.as_str()],
                    )
                    .await
                    .map_err(|e| db_err("recover_interrupted", e))?;
                let tasks = tx
                    .execute(
                        "UPDATE auto_tasks SET status = ?1, error_message = ?2, completed_at = ?3, updated_at = ?3 WHERE status = 'PROCESSING'",
                        params![TaskStatus::Failed.as_str(), reason, now.as_str()],
                    )
                    .await
                    .map_err(|e| db_err("recover_interrupted", e))?;
                Ok::<_, DatabaseError>(Recovered { operations, tasks })
            }
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::warehouse::model::{CellStatus, Priority, TaskType};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-10T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn seeded() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.seed_grid(3, 4, t0()).await.unwrap();
        db
    }

    async fn processing_op(db: &LibSqlBackend, request: &OperationRequest) -> Operation {
        db.begin_operation(request, t0()).await.unwrap()
    }

    #[tokio::test]
    async fn seed_grid_is_idempotent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert_eq!(db.seed_grid(3, 4, t0()).await.unwrap(), 12);
        assert_eq!(db.seed_grid(3, 4, t0()).await.unwrap(), 0);

        let cells = db.warehouse_state().await.unwrap().cells;
        assert_eq!(cells.len(), 12);
        assert_eq!(cells[0].label, "R1C1");
        assert_eq!(cells[11].label, "R3C4");
        assert!(cells.iter().all(|c| c.status == CellStatus::Empty));

        let zone = db.get_loading_zone().await.unwrap();
        assert_eq!(zone.quantity, 0);
        assert!(zone.product_id.is_none());
    }

    #[tokio::test]
    async fn duplicate_rfid_is_a_constraint_error() {
        let db = seeded().await;
        db.insert_product(&NewProduct::new("Bolt").with_rfid("TAG-1"), t0())
            .await
            .unwrap();
        let err = db
            .insert_product(&NewProduct::new("Nut").with_rfid("TAG-1"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let found = db.find_product_by_rfid("TAG-1").await.unwrap().unwrap();
        assert_eq!(found.name, "Bolt");
        assert!(db.find_product_by_rfid("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn operation_lifecycle_records_timing() {
        let db = seeded().await;
        let op = db
            .begin_operation(&OperationRequest::new(OperationKind::Home, " HOME "), t0())
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
        assert_eq!(op.command, "HOME");
        assert_eq!(op.started_at, Some(t0()));

        let done = db
            .complete_operation(op.id, 42, &SideEffect::None, t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(done.operation.status, OperationStatus::Completed);
        assert_eq!(done.operation.execution_time_ms, Some(42));
        assert!(done.cells.is_empty());
        assert!(done.loading_zone.is_none());

        assert!(db.fail_operation(op.id, "late", 1, t0()).await.is_err());
    }

    #[tokio::test]
    async fn move_to_loading_updates_cell_and_zone_together() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Crate"), t0()).await.unwrap();
        db.assign_cell(
            5,
            &StockAssignment {
                product_id: Some(product.id),
                quantity: Some(1),
            },
            t0(),
        )
        .await
        .unwrap();

        let request = OperationRequest::new(OperationKind::MoveToLoading, "LOADING_TAKE 1 2")
            .with_cell(5)
            .with_product(product.id);
        let op = processing_op(&db, &request).await;
        let done = db
            .complete_operation(op.id, 10, &request.side_effect(), t0())
            .await
            .unwrap();

        assert_eq!(done.cells.len(), 1);
        assert_eq!(done.cells[0].status, CellStatus::Empty);
        assert_eq!(done.cells[0].quantity, 0);
        let zone = done.loading_zone.unwrap();
        assert_eq!(zone.product_id, Some(product.id));
        assert_eq!(zone.quantity, 1);
    }

    #[tokio::test]
    async fn failed_side_effect_rolls_back_everything() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Crate"), t0()).await.unwrap();
        db.assign_cell(
            2,
            &StockAssignment {
                product_id: Some(product.id),
                quantity: None,
            },
            t0(),
        )
        .await
        .unwrap();
        db.execute_raw("DELETE FROM loading_zone").await.unwrap();

        let request = OperationRequest::new(OperationKind::MoveToLoading, "LOADING_TAKE 2 1")
            .with_cell(2)
            .with_product(product.id);
        let op = processing_op(&db, &request).await;
        let err = db
            .complete_operation(op.id, 10, &request.side_effect(), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));

        let cell = db.get_cell(2).await.unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::Occupied);
        assert_eq!(cell.product_id, Some(product.id));
        let op = db.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
    }

    #[tokio::test]
    async fn assign_cell_logs_a_completed_operation() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Box"), t0()).await.unwrap();

        let (cell, op) = db
            .assign_cell(
                7,
                &StockAssignment {
                    product_id: Some(product.id),
                    quantity: Some(4),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(cell.status, CellStatus::Occupied);
        assert_eq!(cell.quantity, 4);
        assert_eq!(op.kind, OperationKind::ManualCmd);
        assert_eq!(op.command, "ASSIGN_CELL:7");
        assert_eq!(op.status, OperationStatus::Completed);

        let (cell, _) = db
            .assign_cell(7, &StockAssignment::default(), t0())
            .await
            .unwrap();
        assert_eq!(cell.status, CellStatus::Empty);
        assert_eq!(cell.quantity, 0);
        assert!(cell.product_id.is_none());
    }

    #[tokio::test]
    async fn assign_cell_to_unknown_product_changes_nothing() {
        let db = seeded().await;
        let err = db
            .assign_cell(
                1,
                &StockAssignment {
                    product_id: Some(999),
                    quantity: None,
                },
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "product"));
        assert!(db.list_operations(10).await.unwrap().is_empty());
        assert!(db.get_cell(1).await.unwrap().unwrap().product_id.is_none());
    }

    #[tokio::test]
    async fn tasks_list_in_queue_order() {
        let db = seeded().await;
        let specs = [
            (Priority::Medium, 1),
            (Priority::Urgent, 2),
            (Priority::Medium, 3),
            (Priority::Low, 0),
            (Priority::High, 4),
        ];
        for (priority, minute) in specs {
            db.insert_auto_task(
                &NewAutoTask::new(TaskType::Stock, priority),
                t0() + Duration::minutes(minute),
            )
            .await
            .unwrap();
        }

        let ids: Vec<i64> = db
            .list_auto_tasks(None)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![2, 5, 1, 3, 4]);
        assert_eq!(db.next_pending_task().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn pending_tasks_drain_in_queue_order_for_every_mix() {
        let db = seeded().await;
        let priorities = [Priority::Low, Priority::Medium, Priority::High, Priority::Urgent];
        let rank = |p: Priority| match p {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        };
        for i in 0..24i64 {
            let priority = priorities[(i * 7 % 4) as usize];
            db.insert_auto_task(
                &NewAutoTask::new(TaskType::Stock, priority),
                t0() + Duration::minutes((i * 5) % 11),
            )
            .await
            .unwrap();
        }

        let mut drained = Vec::new();
        while let Some(next) = db.next_pending_task().await.unwrap() {
            db.claim_auto_task(next.id, t0()).await.unwrap().unwrap();
            drained.push((rank(next.priority), next.created_at, next.id));
        }
        assert_eq!(drained.len(), 24);
        assert!(drained.windows(2).all(|w| w[0] < w[1]), "{drained:?}");
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_id() {
        let db = seeded().await;
        for _ in 0..3 {
            db.insert_auto_task(&NewAutoTask::new(TaskType::Stock, Priority::High), t0())
                .await
                .unwrap();
        }
        let first = db.next_pending_task().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        db.cancel_auto_task(first.id, t0()).await.unwrap();
        assert_eq!(db.next_pending_task().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn claim_and_cancel_are_conditional() {
        let db = seeded().await;
        let a = db
            .insert_auto_task(&NewAutoTask::new(TaskType::Retrieve, Priority::High), t0())
            .await
            .unwrap();
        let b = db
            .insert_auto_task(&NewAutoTask::new(TaskType::Stock, Priority::Low), t0())
            .await
            .unwrap();

        assert!(db.cancel_auto_task(b.id, t0()).await.unwrap().is_some());
        assert!(db.claim_auto_task(b.id, t0()).await.unwrap().is_none());

        let claimed = db.claim_auto_task(a.id, t0()).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(db.cancel_auto_task(a.id, t0()).await.unwrap().is_none());

        let failed = db.finish_auto_task(a.id, Some("jammed"), t0()).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("jammed"));
        assert!(db.finish_auto_task(a.id, None, t0()).await.is_err());
        assert!(db.next_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_work() {
        let db = seeded().await;
        let op = processing_op(&db, &OperationRequest::new(OperationKind::Home, "HOME")).await;
        let task = db
            .insert_auto_task(&NewAutoTask::new(TaskType::Stock, Priority::Medium), t0())
            .await
            .unwrap();
        db.claim_auto_task(task.id, t0()).await.unwrap();
        let untouched = db
            .insert_auto_task(&NewAutoTask::new(TaskType::Stock, Priority::Medium), t0())
            .await
            .unwrap();

        let recovered = db
            .recover_interrupted("interrupted by restart", t0())
            .await
            .unwrap();
        assert_eq!(recovered, Recovered { operations: 1, tasks: 1 });

        let op = db.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Error);
        let task = db.get_auto_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let untouched = db.get_auto_task(untouched.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn conveyor_keeps_last_product_when_cleared() {
        let db = seeded().await;
        let product = db
            .insert_product(&NewProduct::new("Tray").with_rfid("RF-9"), t0())
            .await
            .unwrap();

        let seen = db.update_conveyor(true, Some(&product), t0()).await.unwrap();
        assert!(seen.has_product);
        assert_eq!(seen.product_rfid.as_deref(), Some("RF-9"));
        assert_eq!(seen.last_detected_at, Some(t0()));

        let cleared = db
            .update_conveyor(false, None, t0() + Duration::seconds(5))
            .await
            .unwrap();
        assert!(!cleared.has_product);
        assert_eq!(cleared.product_id, Some(product.id));
        assert_eq!(cleared.last_detected_at, Some(t0()));
    }

    #[tokio::test]
    async fn begin_operation_leaves_nothing_behind_when_the_start_fails() {
        let db = seeded().await;
        db.execute_raw(
            "CREATE TRIGGER block_start BEFORE UPDATE ON operations WHEN NEW.status = 'PROCESSING' BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .await
        .unwrap();

        let err = db
            .begin_operation(&OperationRequest::new(OperationKind::Home, "HOME"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Query(ref msg) if msg.contains("disk I/O error")));
        assert!(db.list_operations(10).await.unwrap().is_empty());
        assert_eq!(db.warehouse_state().await.unwrap().summary.pending_operations, 0);
    }

    #[tokio::test]
    async fn corrupt_timestamp_is_a_serialization_error() {
        let db = seeded().await;
        db.execute_raw("UPDATE cells SET updated_at = 'yesterday' WHERE id = 4")
            .await
            .unwrap();

        let err = db.warehouse_state().await.unwrap_err();
        assert!(
            matches!(err, DatabaseError::Serialization(ref msg) if msg.contains("cell.updated_at")),
            "{err:?}"
        );
        assert!(db.get_cell(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sqlite_timestamps_still_parse() {
        let db = seeded().await;
        db.execute_raw("UPDATE loading_zone SET updated_at = '2026-02-10 09:30:00'")
            .await
            .unwrap();
        let zone = db.get_loading_zone().await.unwrap();
        assert_eq!(zone.updated_at, t0() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn loading_zone_can_be_set_and_cleared() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Drum"), t0()).await.unwrap();

        let zone = db
            .set_loading_zone(
                &StockAssignment {
                    product_id: Some(product.id),
                    quantity: Some(3),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(zone.product_id, Some(product.id));
        assert_eq!(zone.quantity, 3);

        let err = db
            .set_loading_zone(
                &StockAssignment {
                    product_id: Some(404),
                    quantity: None,
                },
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "product"));
        assert_eq!(db.get_loading_zone().await.unwrap().product_id, Some(product.id));

        let cleared = db
            .set_loading_zone(&StockAssignment::default(), t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(cleared.product_id.is_none());
        assert_eq!(cleared.quantity, 0);
    }

    #[tokio::test]
    async fn set_conveyor_overwrites_the_product_reference() {
        let db = seeded().await;
        let product = db
            .insert_product(&NewProduct::new("Tote").with_rfid("RF-1"), t0())
            .await
            .unwrap();
        db.update_conveyor(true, Some(&product), t0()).await.unwrap();

        let manual = db
            .set_conveyor(true, None, t0() + Duration::seconds(2))
            .await
            .unwrap();
        assert!(manual.has_product);
        assert!(manual.product_id.is_none());
        assert!(manual.product_rfid.is_none());
        assert_eq!(manual.last_detected_at, Some(t0() + Duration::seconds(2)));
    }

    #[tokio::test]
    async fn warehouse_state_reflects_a_completed_move() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Reel"), t0()).await.unwrap();
        db.assign_cell(
            6,
            &StockAssignment {
                product_id: Some(product.id),
                quantity: None,
            },
            t0(),
        )
        .await
        .unwrap();
        let request = OperationRequest::new(OperationKind::MoveToLoading, "LOADING_TAKE 2 2")
            .with_cell(6)
            .with_product(product.id);
        let op = processing_op(&db, &request).await;

        let before = db.warehouse_state().await.unwrap();
        assert_eq!(before.cells[5].product_id, Some(product.id));
        assert!(before.loading_zone.product_id.is_none());
        assert_eq!(before.summary.cells_occupied, 1);
        assert_eq!(before.summary.pending_operations, 1);

        db.complete_operation(op.id, 5, &request.side_effect(), t0())
            .await
            .unwrap();
        let after = db.warehouse_state().await.unwrap();
        assert!(after.cells[5].product_id.is_none());
        assert_eq!(after.loading_zone.product_id, Some(product.id));
        assert_eq!(after.summary.cells_occupied, 0);
        assert_eq!(after.summary.pending_operations, 0);
        assert!(!after.conveyor.has_product);
    }

    #[tokio::test]
    async fn status_summary_counts() {
        let db = seeded().await;
        let product = db.insert_product(&NewProduct::new("Kit"), t0()).await.unwrap();
        db.assign_cell(
            3,
            &StockAssignment {
                product_id: Some(product.id),
                quantity: None,
            },
            t0(),
        )
        .await
        .unwrap();
        db.insert_auto_task(&NewAutoTask::new(TaskType::Stock, Priority::Low), t0())
            .await
            .unwrap();
        db.begin_operation(&OperationRequest::new(OperationKind::Home, "HOME"), t0())
            .await
            .unwrap();

        let summary = db.warehouse_state().await.unwrap().summary;
        assert_eq!(
            summary,
            StatusSummary {
                cells_total: 12,
                cells_occupied: 1,
                cells_available: 11,
                products: 1,
                pending_operations: 1,
                pending_tasks: 1,
            }
        );
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warehouse.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.seed_grid(2, 2, t0()).await.unwrap();
            db.insert_product(&NewProduct::new("Pallet"), t0()).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.seed_grid(2, 2, t0()).await.unwrap(), 0);
        assert_eq!(db.list_products().await.unwrap().len(), 1);
        assert_eq!(db.warehouse_state().await.unwrap().cells.len(), 4);
    }
}
