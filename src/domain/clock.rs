use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Clock that only moves when told to. Stands in for the database clock in the
/// in-memory stores.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + chrono::Duration::from_std(by).unwrap();
    }
}
