//! Operation executor: runs one operator command end to end.
//!
//! validate → check refs → take gate → record PENDING/PROCESSING (one
//! transaction) → dispatch → COMPLETED + side effect in one transaction, or
//! ERROR with no side effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::arm::{ArmContext, InFlight};
use crate::broadcast::{Broadcaster, WarehouseEvent};
use crate::clock::Clock;
use crate::device::{DeviceCommand, DeviceGateway};
use crate::error::{Error, Result};
use crate::store::Database;
use crate::store::Completion;
use crate::warehouse::model::{Operation, OperationKind, OperationRequest};

/// A completed operation and the device's reply.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub operation: Operation,
    pub response: String,
}

pub struct OperationExecutor {
    store: Arc<dyn Database>,
    gateway: Arc<DeviceGateway>,
    arm: Arc<ArmContext>,
    events: Broadcaster,
    clock: Arc<dyn Clock>,
}

impl OperationExecutor {
    pub fn new(
        store: Arc<dyn Database>,
        gateway: Arc<DeviceGateway>,
        arm: Arc<ArmContext>,
        events: Broadcaster,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            arm,
            events,
            clock,
        }
    }

    /// Execute a manual command. Rejects with `Busy` instead of queueing when
    /// anything else holds the gate.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationOutcome> {
        request.validate()?;
        self.check_refs(&request).await?;

        let mut guard = self.arm.try_acquire()?;

        let started_at = self.clock.now();
        let operation = self.store.begin_operation(&request, started_at).await?;
        guard.set_current(InFlight::Operation(operation.id));
        info!(
            operation_id = operation.id,
            kind = operation.kind.as_str(),
            command = %operation.command,
            "Operation started"
        );
        self.publish_operation(operation.clone());

        let command = DeviceCommand::raw(request.command.as_str());
        let response = match self.gateway.send_command(&command).await {
            Ok(response) => response,
            Err(err) => {
                let reason = err.to_string();
                warn!(operation_id = operation.id, error = %reason, "Operation failed at the device");
                self.record_failure(operation.id, &reason, started_at).await;
                return Err(Error::Device(err));
            }
        };

        let elapsed = self.elapsed_ms(started_at);
        let completion = match self
            .store
            .complete_operation(operation.id, elapsed, &request.side_effect(), self.clock.now())
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                error!(
                    operation_id = operation.id,
                    error = %e,
                    "Device acknowledged command but state update failed"
                );
                let reason = format!("device acknowledged but state update failed: {e}");
                self.record_failure(operation.id, &reason, started_at).await;
                return Err(Error::Persistence(e.to_string()));
            }
        };

        info!(
            operation_id = operation.id,
            elapsed_ms = elapsed,
            "Operation completed"
        );
        let operation = completion.operation.clone();
        self.publish_changes(completion);
        self.publish_operation(operation.clone());

        Ok(OperationOutcome {
            operation,
            response,
        })
    }

    /// A move out of a cell and into the loading zone goes out as a single
    /// event; everything else as one event per record.
    fn publish_changes(&self, completion: Completion) {
        let mut cells = completion.cells.into_iter();
        if let Some(loading_zone) = completion.loading_zone {
            match cells.next() {
                Some(cell) => self
                    .events
                    .publish(WarehouseEvent::StockMoved { cell, loading_zone }),
                None => self
                    .events
                    .publish(WarehouseEvent::LoadingZoneUpdate { loading_zone }),
            }
        }
        for cell in cells {
            self.events.publish(WarehouseEvent::CellUpdate { cell });
        }
    }

    async fn check_refs(&self, request: &OperationRequest) -> Result<()> {
        if let Some(cell_id) = request.cell_id {
            if self.store.get_cell(cell_id).await?.is_none() {
                return Err(Error::not_found("cell", cell_id));
            }
        }
        if let Some(product_id) = request.product_id {
            if self.store.get_product(product_id).await?.is_none() {
                return Err(Error::not_found("product", product_id));
            }
        }
        if request.kind == OperationKind::MoveToLoading {
            let zone = self.store.get_loading_zone().await?;
            if let Some(staged) = zone.product_id {
                warn!(
                    staged_product_id = staged,
                    "Loading zone is occupied; the move will replace its contents"
                );
            }
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, reason: &str, started_at: DateTime<Utc>) {
        let elapsed = self.elapsed_ms(started_at);
        match self
            .store
            .fail_operation(id, reason, elapsed, self.clock.now())
            .await
        {
            Ok(operation) => self.publish_operation(operation),
            Err(e) => error!(operation_id = id, error = %e, "Failed to record operation error"),
        }
    }

    fn elapsed_ms(&self, since: DateTime<Utc>) -> i64 {
        (self.clock.now() - since).num_milliseconds().max(0)
    }

    fn publish_operation(&self, operation: Operation) {
        self.events
            .publish(WarehouseEvent::OperationUpdate { operation });
    }
}
