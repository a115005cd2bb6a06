#![doc = include_str!("../README.md")]

pub mod benchmark;
pub mod driver;
pub mod error;
pub mod runner;
pub mod sampler;

pub use benchmark::{run_benchmark, Phase};
pub use driver::{ConnectionDriver, Driver, ServiceDriver};
pub use error::{DriverError, RunError};
pub use runner::run_stage;
pub use sampler::ResourceSampler;

pub mod prelude {
    pub use crate::benchmark::run_benchmark;
    pub use crate::driver::{ConnectionDriver, Driver, ServiceDriver};
    pub use stagger_core::{BenchmarkConfig, BenchmarkRunOutput, ConnectionConfig, Mode, StageResult};
}
