mod config;
mod constants;
mod protocol;
mod report;
mod service;
mod stats;

pub use config::*;
pub use constants::*;
pub use protocol::*;
pub use report::*;
pub use service::*;
pub use stats::*;
