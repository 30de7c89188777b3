//! 控制核心：阶段引擎、状态与快照、存活监测、关闭协调

pub mod builder;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod shutdown;
pub mod snapshot;
pub mod state;

pub use builder::EngineBuilder;
pub use engine::{EngineSettings, EventBus, LogEvent, LogLevel, PhaseContext, PhaseEngine, PhaseHandler};
pub use error::{EngineError, PhaseError};
pub use liveness::{LivenessMonitor, LivenessStats, NoopNotifier, Notifier, SystemdNotifier};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use snapshot::{StatePublisher, StateReader, StateSnapshot};
pub use state::{
    ActionIntent, ActionKind, ActionOutcome, ActionResult, EngineStatus, IterationState, LogTail, Phase, Telemetry,
};
