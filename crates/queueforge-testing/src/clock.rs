use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// A controllable clock for deterministic lease-expiry and backoff tests.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(now)) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut guard = self.now.lock().unwrap();
        *guard += by;
        *guard
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}
