//! regtrack daemon: lifecycle wiring over the ingestion, analytics and
//! metadata services
//!
//! The HTTP shell mounts [`app::AdminService`] and the analytics service
//! onto its routes; this crate owns configuration, startup order and
//! graceful teardown.

pub mod app;
pub mod bootstrap;

pub use app::{AdminError, AdminService};
pub use bootstrap::{App, start};
