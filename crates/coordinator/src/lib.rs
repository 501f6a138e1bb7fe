pub mod config;
pub mod detector;
pub mod error;
pub mod lifecycle;
pub mod pg_store;
pub mod processing;
pub mod registry;
pub mod routes;
pub mod service;
pub mod source;
pub mod state;
pub mod store;

pub use error::{ApiError, CoordinatorError};
pub use service::Coordinator;
