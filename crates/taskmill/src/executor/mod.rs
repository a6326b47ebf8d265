//! Executor runtime: runs one job, reports its progress and serves its logs.

pub mod command;
pub mod monitor;
pub mod reporter;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod task;
