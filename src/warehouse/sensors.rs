//! Latest conveyor sensor readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::warehouse::model::SensorSnapshot;

/// One parsed reading pushed by the conveyor controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub ldr1: bool,
    #[serde(default)]
    pub ldr2: bool,
    #[serde(default)]
    pub rfid: Option<String>,
    #[serde(default, alias = "conveyorState")]
    pub conveyor_state: Option<String>,
}

impl SensorReading {
    /// Trimmed tag, if the reader saw one.
    pub fn tag(&self) -> Option<&str> {
        self.rfid.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Holds the most recent snapshot. In memory only; a restart starts idle.
pub struct SensorMonitor {
    latest: RwLock<SensorSnapshot>,
}

impl SensorMonitor {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(SensorSnapshot::default()),
        }
    }

    /// Replace the snapshot with `reading`.
    pub async fn record(&self, reading: &SensorReading, now: DateTime<Utc>) -> SensorSnapshot {
        let snapshot = SensorSnapshot {
            ldr1: reading.ldr1,
            ldr2: reading.ldr2,
            rfid: reading.tag().map(str::to_string),
            conveyor_state: reading
                .conveyor_state
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("IDLE")
                .to_string(),
            last_update: Some(now),
        };
        *self.latest.write().await = snapshot.clone();
        snapshot
    }

    pub async fn latest(&self) -> SensorSnapshot {
        self.latest.read().await.clone()
    }
}

impl Default for SensorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_normalizes_reading() {
        let monitor = SensorMonitor::new();
        assert_eq!(monitor.latest().await.conveyor_state, "IDLE");

        let now = Utc::now();
        let snapshot = monitor
            .record(
                &SensorReading {
                    ldr1: true,
                    ldr2: false,
                    rfid: Some("  ".into()),
                    conveyor_state: Some("WAIT_PICK".into()),
                },
                now,
            )
            .await;
        assert!(snapshot.product_present());
        assert!(snapshot.rfid.is_none());
        assert_eq!(snapshot.conveyor_state, "WAIT_PICK");
        assert_eq!(monitor.latest().await.last_update, Some(now));
    }

    #[test]
    fn reading_accepts_camel_case_state() {
        let reading: SensorReading =
            serde_json::from_str(r#"{"ldr2":true,"rfid":"04A1","conveyorState":"MOVING"}"#).unwrap();
        assert!(reading.ldr2);
        assert_eq!(reading.tag(), Some("04A1"));
        assert_eq!(reading.conveyor_state.as_deref(), Some("MOVING"));
    }
}
