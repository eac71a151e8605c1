//! Ports: the seams between the orchestration core and its collaborators.
//!
//! Implementations of the fetch/generate/execute ports are out of scope for
//! the core; `crate::impls` carries in-memory versions for development and
//! tests.

pub mod artifact_store;
pub mod clock;
pub mod fetcher;
pub mod generator;
pub mod id_generator;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::fetcher::{Fetcher, HashDiff, RawSnapshot, SnapshotDiff, StructuralDiff};
pub use self::generator::{
    CandidateArtifact, CandidateRunner, CodeGenerator, DiagnosisContext,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
