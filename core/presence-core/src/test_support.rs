//! In-memory presence service shared by the unit tests.

use crate::error::{ConnectError, SendError};
use crate::transport::{CloseNotifier, Connector, Transport};
use presence_protocol::Activity;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct FakeService {
    pub available: bool,
    pub fail_sends: bool,
    pub connect_delay: Option<Duration>,
    pub attempts: usize,
    pub closes: usize,
    pub sent: Vec<Activity>,
    pub notifiers: Vec<CloseNotifier>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    service: Arc<Mutex<FakeService>>,
}

impl FakeConnector {
    pub fn available() -> Self {
        let connector = Self::default();
        connector.with(|service| service.available = true);
        connector
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeService) -> R) -> R {
        f(&mut self.service.lock().expect("lock fake service"))
    }

    pub fn sent(&self) -> Vec<Activity> {
        self.with(|service| service.sent.clone())
    }

    pub fn attempts(&self) -> usize {
        self.with(|service| service.attempts)
    }

    pub fn closes(&self) -> usize {
        self.with(|service| service.closes)
    }

    /// Simulates the service dropping the newest connection.
    pub fn close_peer(&self) {
        let notifier = self.with(|service| service.notifiers.pop());
        if let Some(notifier) = notifier {
            notifier("peer closed".to_string());
        }
    }
}

struct FakeTransport {
    service: Arc<Mutex<FakeService>>,
    closed: bool,
}

impl Connector for FakeConnector {
    fn connect(
        &mut self,
        _client_id: &str,
        on_close: CloseNotifier,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let delay = self.with(|service| {
            service.attempts += 1;
            service.connect_delay
        });
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.with(|service| {
            if !service.available {
                return Err(ConnectError::EndpointUnavailable {
                    details: "not running".to_string(),
                });
            }
            service.notifiers.push(on_close);
            Ok(())
        })?;
        Ok(Box::new(FakeTransport {
            service: Arc::clone(&self.service),
            closed: false,
        }))
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, activity: &Activity) -> Result<(), SendError> {
        let mut service = self.service.lock().expect("lock fake service");
        if self.closed || service.fail_sends {
            return Err(SendError::ConnectionClosed);
        }
        service.sent.push(activity.clone());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.service.lock().expect("lock fake service").closes += 1;
        }
    }
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
