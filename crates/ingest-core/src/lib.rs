//! Orchestration crate: the admin control surface (§6) and the alert
//! dispatcher's scheduling glue (§4.I). Everything here is a thin layer
//! over the leaf crates — no new storage or transport concerns are
//! introduced at this level.

pub mod admin;
pub mod alerts;

pub use admin::{AdminApi, BulkCreateError, BulkCreateReport, CreateTargetInput};
pub use alerts::{AlertDispatcher, AlertJobPayload, DispatchReport, ALERT_QUEUE};
