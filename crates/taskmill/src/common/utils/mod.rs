pub mod network;
pub mod time;
