pub mod controller;
pub mod driver;

pub use controller::{RunConfig, RunController, RunOutput, RunPhase};
pub use driver::{RunDriver, RunSummary};
