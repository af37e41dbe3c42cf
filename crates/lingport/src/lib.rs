pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod intake;
pub mod lock;
pub mod logging;
pub mod model;
pub mod planner;
pub mod progress;
pub mod storage;
pub mod workspace;

pub use config::{load_config, Config, ConversionConfig, DerivedConfig, ToolConfig};
pub use db::Database;
pub use error::{ConfigError, ErrorKind, LingportError, Result, StorageError};
pub use executor::{BatchReport, ConversionExecutor, TerminalState, ToolError};
pub use intake::{AssetInput, IntakeCoordinator, NewProjectInput, ProjectBundle};
pub use lock::ProjectLocks;
pub use logging::init_logging;
pub use model::{FileRole, ImportStatus, LanguagePair, ProjectStatus, TaskStatus, ValidationOutcome};
pub use planner::{ConversionPlanner, ConversionTask, IntegrityAlert, IntegrityAlertKind, Plan};
pub use progress::{BroadcastProgress, ConversionEvent, ConversionPhase, NoopProgress, ProgressReporter};
pub use workspace::{ConversionPlan, TaskStatusDetails, Workspace};
