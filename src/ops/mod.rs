//! Operation execution and auto-task scheduling.

pub mod executor;
pub mod retry;
pub mod scheduler;

pub use executor::{OperationExecutor, OperationOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, TaskOutcome};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::arm::{ArmContext, Mode};
    use crate::broadcast::Broadcaster;
    use crate::clock::testing::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::device::DeviceGateway;
    use crate::device::testing::ScriptedTransport;
    use crate::store::{Database, LibSqlBackend};

    use super::{OperationExecutor, Scheduler};

    /// Seeded 3x4 store, registered scripted device, manual clock.
    pub struct Harness {
        pub store: Arc<LibSqlBackend>,
        pub transport: Arc<ScriptedTransport>,
        pub gateway: Arc<DeviceGateway>,
        pub arm: Arc<ArmContext>,
        pub events: Broadcaster,
        pub clock: Arc<ManualClock>,
    }

    impl Harness {
        pub async fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            store.seed_grid(3, 4, crate::clock::Clock::now(&*clock)).await.unwrap();
            let transport = Arc::new(ScriptedTransport::new());
            let gateway = Arc::new(DeviceGateway::new(transport.clone(), Duration::from_secs(2)));
            gateway.register("10.0.0.7").unwrap();
            Self {
                store,
                transport,
                gateway,
                arm: Arc::new(ArmContext::new(Mode::Manual)),
                events: Broadcaster::new(64),
                clock,
            }
        }

        pub fn db(&self) -> Arc<dyn Database> {
            self.store.clone()
        }

        pub fn executor(&self) -> OperationExecutor {
            OperationExecutor::new(
                self.db(),
                Arc::clone(&self.gateway),
                Arc::clone(&self.arm),
                self.events.clone(),
                self.clock.clone(),
            )
        }

        pub fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
            Scheduler::new(
                self.db(),
                Arc::clone(&self.gateway),
                Arc::clone(&self.arm),
                self.events.clone(),
                self.clock.clone(),
                config,
            )
        }
    }
}
