//! Self-update engine: checksum verification, binary delta encoding and
//! decoding, and a transactional orchestrator that applies an ordered list of
//! file actions to an installation tree with full rollback.

pub mod action;
pub mod apply;
pub mod checksum;
pub mod config;
pub mod create;
pub mod delta;
pub mod error;
pub mod orchestrator;
pub mod package;
pub mod platform;
pub mod util;

pub use action::{ActionSpec, Architecture, UpdateFileAction};
pub use config::UpdateConfig;
pub use error::{DeltaError, UpdateError};
pub use orchestrator::{CancelToken, Orchestrator, UpdateReport, UpdateState};
pub use package::{PayloadStore, UpdatePackage};
