pub mod ssh;
pub mod tunnel_storage;

pub use tunnel_storage::*;
