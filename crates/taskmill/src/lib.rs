pub mod common;
pub mod executor;
pub mod server;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::TaskmillError;
pub type Result<T> = std::result::Result<T, Error>;
