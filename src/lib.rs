pub mod logging;
pub mod services;

pub use services::ssh;
