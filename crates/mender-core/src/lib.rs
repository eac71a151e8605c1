//! Self-healing scraper orchestration core.
//!
//! The core owns four pieces of durable state in one SQLite database: the
//! task queue, per-source health, the repair audit log, and the source
//! registry. Around them sit the health tracker's strike machine, a circuit
//! breaker over repair attempts, the diagnose/patch/stage/validate/promote
//! repair workflow, and the orchestrator loop that drives all of it.
//!
//! External effects (fetching pages, generating scraper code, running
//! candidates, storing artifacts) live behind the traits in [`ports`];
//! [`impls`] has in-process versions good enough to run the whole loop in
//! development and tests.

pub mod breaker;
pub mod config;
pub mod doctor;
pub mod domain;
pub mod error;
pub mod health;
pub mod impls;
pub mod orchestrator;
pub mod ports;
pub mod queue;
pub mod status;
pub mod store;

pub use breaker::{BreakerDecision, CircuitBreaker, DenyReason};
pub use config::MenderConfig;
pub use doctor::{Collaborators, Doctor, RepairOutcome, RepairStage};
pub use domain::{
    Classification, ExpectedSchema, FailureKind, FieldKind, FixAttempt, FixOutcome, SourceHealth,
    SourceSpec, SourceState, Task, TaskKind, TaskState, priority,
};
pub use error::{CollaboratorError, MenderError};
pub use health::{FailureReport, HealthTracker};
pub use orchestrator::Orchestrator;
pub use queue::{RecoveryReport, TaskOutcome, TaskQueue};
pub use status::{HealthSummary, StatusView, TaskCounts};
pub use store::SqliteStore;
