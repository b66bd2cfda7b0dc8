//! Warehouse domain: entity types, intents, sensor ingestion, the service
//! facade and its WebSocket endpoint.

pub mod intent;
pub mod model;
pub mod sensors;
pub mod service;
pub mod ws;

pub use intent::{Intent, IntentReply, IntentResult};
pub use sensors::{SensorMonitor, SensorReading};
pub use service::Warehouse;
pub use ws::warehouse_routes;
