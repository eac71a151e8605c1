//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs behind a phantom-typed wrapper: `TaskId` and `FixAttemptId`
//! share one implementation but cannot be mixed up at compile time. ULIDs are
//! time-sortable, so audit tables ordered by id are also ordered by creation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID type. Provides the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type. `T` is a zero-sized marker that only exists at compile
/// time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Parse from the bare ULID string form used in persistence.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self::from_ulid(Ulid::from_string(s)?))
    }

    /// Bare ULID string, without the display prefix. This is the form stored
    /// in the database.
    pub fn storage_key(&self) -> String {
        self.ulid.to_string()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker type for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker type for fix attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fix {}

impl IdMarker for Fix {
    fn prefix() -> &'static str {
        "fix-"
    }
}

/// Identifier of a Task (one unit of queued work).
pub type TaskId = Id<Task>;

/// Identifier of a FixAttempt (one row in the repair audit log).
pub type FixAttemptId = Id<Fix>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let task = TaskId::from_ulid(ulid1);
        let fix = FixAttemptId::from_ulid(ulid2);

        assert_eq!(task.as_ulid(), ulid1);
        assert_eq!(fix.as_ulid(), ulid2);

        assert!(task.to_string().starts_with("task-"));
        assert!(fix.to_string().starts_with("fix-"));

        // The whole point: you can't accidentally mix these types.
        // let _: TaskId = fix; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn storage_key_roundtrip() {
        let id = TaskId::from_ulid(Ulid::new());
        let parsed = TaskId::parse(&id.storage_key()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_can_be_serialized() {
        let id = FixAttemptId::from_ulid(Ulid::new());
        let serialized = serde_json::to_string(&id).unwrap();
        let deserialized: FixAttemptId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
