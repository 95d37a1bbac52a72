pub mod agents;
pub mod bus;
pub mod context;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod run;
pub mod truncate;

pub use bus::EventBus;
pub use context::{AssembleRequest, AssembledTurn, AssemblerConfig, ContextAssembler};
pub use error::EngineError;
pub use reconcile::StateReconciler;
pub use registry::ToolRegistry;
pub use run::{RunConfig, RunController, RunDriver, RunSummary};
