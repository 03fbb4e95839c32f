pub mod apply;
pub mod config;
pub mod container;
pub mod entity;
pub mod error;
pub mod exporter;
pub mod gateway;
pub mod idmap;
pub mod masterdata;
pub mod platform;
pub mod property_matrix;
pub mod reconcile;
pub mod runner;
pub mod status;
pub mod store;
pub mod trace;
pub mod users;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use apply::{ApplyPort, LiveApply, SimulatedApply};
pub use config::Config;
pub use container::{Container, ContainerError, ContainerIssue, EntityType, Format};
pub use entity::{NaturalKey, ObjectId, SourceId, TargetId, TcmsClass};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use exporter::{ExportOptions, ExportTarget, Exporter};
pub use gateway::{Filter, GatewayError, MemoryGateway, TcmsGateway, TcmsObject};
pub use reconcile::{Engine, ExistingResultPolicy, ImportOptions, ImportReport};
pub use runner::result::{ExecutionResult, PlanRecord, ResultStatus, RunReport, SkipReason};
pub use runner::{AbortHandle, ProductPaths, RunOptions, RunTarget, Runner, RunnerSettings};
pub use store::{load_store, save_store};
pub use trace::{Action, Decision, Summary, Trace};
pub use users::UserPolicy;
