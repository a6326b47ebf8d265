#[macro_use]
pub mod common;
pub mod context;
pub mod endpoint;
pub mod fsm;
pub mod ids;
pub mod job;
pub mod messages;
pub mod resource;
pub mod result;

pub use crate::common::{Map, Set};
pub use crate::ids::{JobId, UserId};

pub type Error = crate::common::error::MillError;
pub type Result<T> = std::result::Result<T, Error>;
