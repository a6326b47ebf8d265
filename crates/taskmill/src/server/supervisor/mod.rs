pub mod allocator;
pub mod client;
