//! ID generation.
//!
//! ULIDs are minted from the injected clock so fixed-clock tests produce
//! deterministic timestamp halves; the entropy half stays random.

use std::sync::Arc;

use ulid::Ulid;

use super::clock::Clock;
use crate::domain::ids::{FixAttemptId, TaskId};

pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn fix_attempt_id(&self) -> FixAttemptId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn mint(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.mint())
    }

    fn fix_attempt_id(&self) -> FixAttemptId {
        FixAttemptId::from(self.mint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::clock::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_ids_are_unique() {
        let ids = UlidGenerator::new(Arc::new(SystemClock));
        let a = ids.task_id();
        let b = ids.task_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_half() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(Arc::new(FixedClock::new(at)));

        let a = ids.task_id();
        let b = ids.task_id();

        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
    }
}
