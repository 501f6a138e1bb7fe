//! Argus: detection task coordinator.
//!
//! Facade over the workspace crates so integration tests and embedders can
//! depend on a single package.

pub use common;
pub use coordinator;
pub use telemetry;
