//! Domain model (IDs, tasks, health, fix history, schemas).

pub mod fix;
pub mod health;
pub mod ids;
pub mod source;
pub mod task;
pub mod validation;

pub use fix::{Classification, FailureKind, FixAttempt, FixOutcome, FixStrategy};
pub use health::{SourceHealth, SourceState};
pub use ids::{FixAttemptId, TaskId};
pub use source::SourceSpec;
pub use task::{Task, TaskKind, TaskState, priority};
pub use validation::{ExpectedSchema, FieldKind, ValidationReport, validate_records};
