//! In-process implementations of the collaborator ports. Enough to run the
//! whole loop without a network or a generative backend; production
//! deployments plug real ones in at the same seams.

pub mod dev;
pub mod memory_artifacts;

pub use self::dev::{DevFetcher, DevGenerator, DevRunner, content_hash};
pub use self::memory_artifacts::MemoryArtifactStore;
