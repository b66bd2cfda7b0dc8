//! Arm/mode context: operating mode, arm status and the single in-flight gate.
//!
//! One physical actuator means one command at a time. Every device dispatch
//! (manual operation, auto task, mode notification) holds a [`GateGuard`] for
//! its whole duration; the guard clears the in-flight marker when dropped.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::Error;

/// Operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Operator drives the arm command by command.
    #[default]
    Manual,
    /// The scheduler drains the auto-task queue.
    Auto,
}

impl Mode {
    /// Keyword used in `MODE ...` device commands.
    pub fn device_keyword(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Validation(format!("invalid mode '{other}'"))),
        }
    }
}

/// What currently holds the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum InFlight {
    Operation(i64),
    Task(i64),
}

impl fmt::Display for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(id) => write!(f, "operation {id}"),
            Self::Task(id) => write!(f, "auto task {id}"),
        }
    }
}

/// Arm status text as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArmStatus {
    Ready,
    Busy,
}

/// Point-in-time view of the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmSnapshot {
    pub mode: Mode,
    pub status: ArmStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<InFlight>,
}

#[derive(Debug)]
struct ArmState {
    mode: Mode,
    status: ArmStatus,
    current: Option<InFlight>,
}

/// Process-wide arm/mode context, created once at startup and shared by `Arc`.
pub struct ArmContext {
    state: Arc<Mutex<ArmState>>,
    gate: Arc<Semaphore>,
}

fn lock(state: &Mutex<ArmState>) -> MutexGuard<'_, ArmState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ArmContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            state: Arc::new(Mutex::new(ArmState {
                mode,
                status: ArmStatus::Ready,
                current: None,
            })),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn mode(&self) -> Mode {
        lock(&self.state).mode
    }

    /// Switch mode, returning the previous one.
    pub fn set_mode(&self, mode: Mode) -> Mode {
        let mut state = lock(&self.state);
        std::mem::replace(&mut state.mode, mode)
    }

    pub fn current(&self) -> Option<InFlight> {
        lock(&self.state).current
    }

    pub fn snapshot(&self) -> ArmSnapshot {
        let state = lock(&self.state);
        ArmSnapshot {
            mode: state.mode,
            status: state.status,
            current: state.current,
        }
    }

    /// Take the gate or fail immediately with `Busy`.
    pub fn try_acquire(&self) -> Result<GateGuard, Error> {
        match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => Ok(self.guard(permit)),
            Err(_) => Err(Error::Busy {
                current: self.current(),
            }),
        }
    }

    /// Wait for the gate. Used by fire-and-forget device notifications that
    /// must not overlap a running command but should not be dropped either.
    pub async fn acquire(&self) -> Result<GateGuard, Error> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| Error::Busy { current: None })?;
        Ok(self.guard(permit))
    }

    fn guard(&self, permit: OwnedSemaphorePermit) -> GateGuard {
        lock(&self.state).status = ArmStatus::Busy;
        GateGuard {
            state: Arc::clone(&self.state),
            _permit: permit,
        }
    }
}

/// Exclusive right to talk to the device. Releases the gate on drop.
pub struct GateGuard {
    state: Arc<Mutex<ArmState>>,
    _permit: OwnedSemaphorePermit,
}

impl GateGuard {
    /// Record which operation or task is using the device.
    pub fn set_current(&mut self, in_flight: InFlight) {
        lock(&self.state).current = Some(in_flight);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(previous) = state.current.take() {
            debug!(released = %previous, "Gate released");
        }
        state.status = ArmStatus::Ready;
        // The permit field drops after this body, so the state is already
        // clean when the next holder gets in.
    }
}
