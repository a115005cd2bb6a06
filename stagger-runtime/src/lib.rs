//! Command line runtime for Stagger.
//!
//! Resolves configuration from the environment, spawns the quiz server for connection runs,
//! executes each mode through [`stagger::run_benchmark`] and writes one JSON report per run.
pub mod error;
pub mod output;
pub mod process;
pub mod runtime;

pub use error::{ProcessError, RuntimeError};
pub use output::{AllSummary, TempDbPath, DEFAULT_RESULTS_DIR};
pub use process::{TargetCommand, TargetProcess};
pub use runtime::{ModeRun, StaggerRuntime};
