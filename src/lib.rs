//! Smart Warehouse: coordination core for a single-arm storage rig.

pub mod arm;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod ops;
pub mod store;
pub mod warehouse;
