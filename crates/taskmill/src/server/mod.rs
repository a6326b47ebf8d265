//! The control plane: job store, resource ownership, supervisor allocation and the
//! reconciliation loops that drive jobs from submission to teardown.

pub mod alarm;
pub mod api;
pub mod bootstrap;
pub mod daemon;
pub mod event;
pub mod ingest;
pub mod resource;
pub mod store;
pub mod supervisor;
