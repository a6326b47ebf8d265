//! Supervisor agent: starts executor processes next to a resource pool.

pub mod agent;
pub mod launcher;
