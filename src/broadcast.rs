//! Broadcaster: best-effort fan-out of state changes to every observer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::arm::{ArmSnapshot, Mode};
use crate::device::DeviceStatus;
use crate::warehouse::model::{
    AutoTask, Cell, ConveyorStatus, LoadingZone, Operation, Product, SensorSnapshot,
    StatusSummary,
};

/// Everything an observer needs to render the warehouse from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    pub cells: Vec<Cell>,
    pub loading_zone: LoadingZone,
    pub conveyor: ConveyorStatus,
    pub arm: ArmSnapshot,
    pub sensors: SensorSnapshot,
    pub device: DeviceStatus,
    pub summary: StatusSummary,
    pub timestamp: DateTime<Utc>,
}

/// Closed set of messages pushed to observers. Each carries the full record,
/// so observers patch their view by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarehouseEvent {
    /// Full state, sent on connect and after the observer lagged.
    Init { snapshot: Box<WarehouseSnapshot> },
    /// Periodic grid refresh.
    WarehouseData {
        cells: Vec<Cell>,
        loading_zone: LoadingZone,
        timestamp: DateTime<Utc>,
    },
    OperationUpdate { operation: Operation },
    TaskUpdate { task: AutoTask },
    CellUpdate { cell: Cell },
    LoadingZoneUpdate { loading_zone: LoadingZone },
    /// A product left a cell for the loading zone. Both records travel
    /// together so no observer sees the product in neither place.
    StockMoved { cell: Cell, loading_zone: LoadingZone },
    ConveyorUpdate { conveyor: ConveyorStatus },
    SensorUpdate { sensors: SensorSnapshot },
    RfidDetected { tag: String, product: Product },
    ModeUpdate { mode: Mode, arm: ArmSnapshot },
    DeviceStatus { device: DeviceStatus },
    ProductCreated { product: Product },
}

impl WarehouseEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::WarehouseData { .. } => "warehouse_data",
            Self::OperationUpdate { .. } => "operation_update",
            Self::TaskUpdate { .. } => "task_update",
            Self::CellUpdate { .. } => "cell_update",
            Self::LoadingZoneUpdate { .. } => "loading_zone_update",
            Self::StockMoved { .. } => "stock_moved",
            Self::ConveyorUpdate { .. } => "conveyor_update",
            Self::SensorUpdate { .. } => "sensor_update",
            Self::RfidDetected { .. } => "rfid_detected",
            Self::ModeUpdate { .. } => "mode_update",
            Self::DeviceStatus { .. } => "device_status",
            Self::ProductCreated { .. } => "product_created",
        }
    }
}

/// Cloneable handle over a `tokio::sync::broadcast` channel.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<WarehouseEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WarehouseEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Having none is fine.
    pub fn publish(&self, event: WarehouseEvent) {
        let kind = event.kind();
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(kind, receivers, "Event published");
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ArmStatus;

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        for mode in [Mode::Auto, Mode::Manual] {
            broadcaster.publish(WarehouseEvent::ModeUpdate {
                mode,
                arm: ArmSnapshot {
                    mode,
                    status: ArmStatus::Ready,
                    current: None,
                },
            });
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, WarehouseEvent::ModeUpdate { mode: Mode::Auto, .. }));
        assert!(matches!(second, WarehouseEvent::ModeUpdate { mode: Mode::Manual, .. }));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let broadcaster = Broadcaster::new(4);
        broadcaster.publish(WarehouseEvent::DeviceStatus {
            device: DeviceStatus::default(),
        });
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn events_are_tagged_by_type() {
        let event = WarehouseEvent::DeviceStatus {
            device: DeviceStatus {
                connected: true,
                address: Some("http://10.0.0.3".into()),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_status");
        assert_eq!(json["device"]["connected"], true);
        assert_eq!(event.kind(), "device_status");
    }

    #[test]
    fn stock_moved_carries_both_ends() {
        let at = DateTime::parse_from_rfc3339("2026-02-10T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = WarehouseEvent::StockMoved {
            cell: Cell {
                id: 6,
                row: 2,
                col: 2,
                label: "R2C2".into(),
                product_id: None,
                quantity: 0,
                status: crate::warehouse::model::CellStatus::Empty,
                updated_at: at,
            },
            loading_zone: LoadingZone {
                product_id: Some(3),
                quantity: 1,
                updated_at: at,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stock_moved");
        assert_eq!(json["cell"]["status"], "EMPTY");
        assert_eq!(json["loading_zone"]["product_id"], 3);
    }
}
