//! Device gateway: the only path to the physical arm controller.

pub mod command;
pub mod gateway;
pub mod transport;

pub use command::DeviceCommand;
pub use gateway::{DeviceGateway, DeviceStatus, normalize_address};
pub use transport::{DeviceTransport, HttpTransport};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    use super::DeviceTransport;

    /// In-memory transport: records every command, fails on demand, and can
    /// hold commands until released.
    pub struct ScriptedTransport {
        sent: Mutex<Vec<(String, String)>>,
        failures: Mutex<VecDeque<String>>,
        held: AtomicBool,
        release: Semaphore,
        entered: Notify,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                held: AtomicBool::new(false),
                release: Semaphore::new(0),
                entered: Notify::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Make the next `count` commands fail with `reason`.
        pub fn fail_next(&self, count: usize, reason: &str) {
            let mut failures = self.failures.lock().unwrap();
            failures.extend(std::iter::repeat_n(reason.to_string(), count));
        }

        /// Block every command until `release` is called once per command.
        pub fn hold(&self) {
            self.held.store(true, Ordering::SeqCst);
        }

        pub fn release(&self) {
            self.release.add_permits(1);
        }

        /// Wait until a command reached the transport.
        pub async fn wait_entered(&self) {
            self.entered.notified().await;
        }

        /// `(base_url, command)` pairs in send order.
        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn commands(&self) -> Vec<String> {
            self.sent().into_iter().map(|(_, c)| c).collect()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceTransport for ScriptedTransport {
        async fn send(&self, base_url: &str, command: &str) -> Result<String, String> {
            self.sent
                .lock()
                .unwrap()
                .push((base_url.to_string(), command.to_string()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.entered.notify_one();

            if self.held.load(Ordering::SeqCst) {
                if let Ok(permit) = self.release.acquire().await {
                    permit.forget();
                }
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop_front() {
                Some(reason) => Err(reason),
                None => Ok("OK".to_string()),
            }
        }
    }
}
