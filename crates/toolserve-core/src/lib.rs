pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod schema;
pub mod script;
pub mod status;
pub mod validate;

pub use config::{ConfigError, LoadedConfiguration, ToolConfiguration};
pub use engine::{
    EngineSettings, ExecutionFailure, ExecutionRequest, ExecutionResult, ExecutionStage,
    PartialExecution, ToolEngine,
};
pub use error::{Error, ErrorCategory, Hook, Result};
pub use invoke::{
    CommandOutput, InvocationOutcome, ProcessInvoker, PERMISSION_DENIED_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use schema::{DataType, EndpointSpec};
pub use script::{CommandDependencyManager, DependencyError, DependencyManager, ScriptSettings};
pub use status::{ExecutionRecord, ExecutionStatus, ExecutionStatusTable};
