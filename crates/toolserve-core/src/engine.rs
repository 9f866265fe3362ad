//! One request lifecycle: validate, build, pre-script, invoke, post-script,
//! validate outputs.
//!
//! The engine resolves its working directory once per request and hands it to
//! every child process it starts. The server's own current directory is never
//! touched, so concurrent requests cannot observe each other's directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::command::build_command;
use crate::config::ToolConfiguration;
use crate::error::{Error, Hook};
use crate::invoke::{CommandOutput, InvocationOutcome, ProcessInvoker};
use crate::script::{
    CommandDependencyManager, DependencyManager, ScriptContext, ScriptRunner, ScriptSettings,
};
use crate::validate::{validate_inputs, validate_outputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Validating,
    BuildingCommand,
    RunningPreScript,
    InvokingProcess,
    RunningPostScript,
    ValidatingOutputs,
    Completed,
}

impl ExecutionStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::BuildingCommand => "building_command",
            Self::RunningPreScript => "running_pre_script",
            Self::InvokingProcess => "invoking_process",
            Self::RunningPostScript => "running_post_script",
            Self::ValidatingOutputs => "validating_outputs",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input values submitted for one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl ExecutionRequest {
    pub const fn new(inputs: Map<String, Value>) -> Self {
        Self { inputs }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
    pub working_directory: PathBuf,
    pub tool_directory: PathBuf,
    pub output_variables: Map<String, Value>,
    pub outcome: InvocationOutcome,
}

/// Whatever an execution had produced when it stopped
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialExecution {
    pub command: Option<String>,
    pub working_directory: PathBuf,
    pub output: Option<CommandOutput>,
    pub output_variables: Map<String, Value>,
}

#[derive(Debug, Error)]
#[error("execution failed while {stage}: {error}")]
pub struct ExecutionFailure {
    pub stage: ExecutionStage,
    #[source]
    pub error: Error,
    pub partial: PartialExecution,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub timeout: Option<Duration>,
    /// Working directory when the tool directory is not used
    pub base_dir: PathBuf,
    pub scripts: ScriptSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            scripts: ScriptSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Timeout given in (possibly fractional) minutes
    pub fn with_timeout_minutes(mut self, minutes: Option<f64>) -> Self {
        self.timeout = minutes
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0));
        self
    }
}

struct Progress {
    stage: ExecutionStage,
    partial: PartialExecution,
}

impl Progress {
    fn enter(&mut self, stage: ExecutionStage) {
        tracing::debug!(from = %self.stage, to = %stage, "Execution state transition");
        self.stage = stage;
    }
}

pub struct ToolEngine {
    config: ToolConfiguration,
    base_dir: PathBuf,
    invoker: ProcessInvoker,
    scripts: ScriptRunner,
}

impl std::fmt::Debug for ToolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEngine")
            .field("tool", &self.config.tool_name)
            .field("base_dir", &self.base_dir)
            .field("invoker", &self.invoker)
            .finish_non_exhaustive()
    }
}

impl ToolEngine {
    pub fn new(config: ToolConfiguration, settings: EngineSettings) -> Self {
        Self::with_dependencies(config, settings, Arc::new(CommandDependencyManager::default()))
    }

    pub fn with_dependencies(
        mut config: ToolConfiguration,
        settings: EngineSettings,
        dependencies: Arc<dyn DependencyManager>,
    ) -> Self {
        config.tool_directory = config.tool_directory.map(absolute_or_kept);
        Self {
            config,
            base_dir: absolute_or_kept(settings.base_dir),
            invoker: ProcessInvoker::new(settings.timeout),
            scripts: ScriptRunner::new(settings.scripts, dependencies),
        }
    }

    /// Directory the tool and its hooks run in
    pub fn working_directory(&self) -> &Path {
        match (&self.config.tool_directory, self.config.use_tool_directory) {
            (Some(dir), true) => dir.as_path(),
            _ => self.base_dir.as_path(),
        }
    }

    /// Directory substituted for `${dir:tool}`
    pub fn tool_directory(&self) -> &Path {
        self.config
            .tool_directory
            .as_deref()
            .unwrap_or_else(|| self.working_directory())
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let mut progress = Progress {
            stage: ExecutionStage::Validating,
            partial: PartialExecution {
                working_directory: self.working_directory().to_path_buf(),
                ..PartialExecution::default()
            },
        };

        match self.run(request, &mut progress).await {
            Ok(result) => Ok(result),
            Err(error) => {
                tracing::debug!(stage = %progress.stage, error = %error, "Execution failed");
                Err(ExecutionFailure {
                    stage: progress.stage,
                    error,
                    partial: progress.partial,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        progress: &mut Progress,
    ) -> Result<ExecutionResult, Error> {
        let working_dir = self.working_directory();
        let tool_dir = self.tool_directory();

        validate_inputs(&request.inputs, &self.config.inputs)?;

        progress.enter(ExecutionStage::BuildingCommand);
        let command = build_command(&self.config.command_template, &request.inputs);
        progress.partial.command = Some(command.clone());

        let project_root = if self.config.has_hooks() {
            progress.enter(if self.config.pre_script.is_some() {
                ExecutionStage::RunningPreScript
            } else {
                ExecutionStage::RunningPostScript
            });
            Some(self.scripts.project_root_for(working_dir)?)
        } else {
            None
        };

        if let (Some(pre_script), Some(project_root)) = (&self.config.pre_script, &project_root) {
            tracing::info!("Executing pre-script");
            let ctx = ScriptContext {
                tool_dir,
                project_root,
            };
            self.scripts
                .run(Hook::Pre, pre_script, ctx, &mut progress.partial.output_variables)
                .await?;
        }

        progress.enter(ExecutionStage::InvokingProcess);
        tracing::info!("Executing command script: {command}");
        let output = self.invoker.run(&command, working_dir).await?;
        progress.partial.output = Some(output.clone());

        if let (Some(post_script), Some(project_root)) = (&self.config.post_script, &project_root) {
            if output.outcome == InvocationOutcome::Exited {
                progress.enter(ExecutionStage::RunningPostScript);
                tracing::info!("Executing post-script");
                let ctx = ScriptContext {
                    tool_dir,
                    project_root,
                };
                self.scripts
                    .run(Hook::Post, post_script, ctx, &mut progress.partial.output_variables)
                    .await?;

                progress.enter(ExecutionStage::ValidatingOutputs);
                validate_outputs(&progress.partial.output_variables, &self.config.outputs)?;
                tracing::info!(outputs = ?progress.partial.output_variables, "Outputs from post-script");
            } else {
                tracing::debug!(outcome = ?output.outcome, "Skipping post-script");
            }
        }

        progress.enter(ExecutionStage::Completed);
        Ok(ExecutionResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            command,
            working_directory: working_dir.to_path_buf(),
            tool_directory: tool_dir.to_path_buf(),
            output_variables: progress.partial.output_variables.clone(),
            outcome: output.outcome,
        })
    }
}

/// Resolve against the current directory, keeping the path as given if that fails
fn absolute_or_kept(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::invoke::TIMEOUT_EXIT_CODE;
    use crate::schema::EndpointSpec;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(command: &str) -> ToolConfiguration {
        ToolConfiguration {
            tool_name: "poly".into(),
            command_template: command.into(),
            use_tool_directory: false,
            tool_directory: None,
            pre_script: None,
            post_script: None,
            inputs: vec![EndpointSpec::new("x", "Integer"), EndpointSpec::new("n", "Integer")],
            outputs: vec![EndpointSpec::new("root", "Float")],
        }
    }

    fn settings(dir: &TempDir) -> EngineSettings {
        EngineSettings {
            timeout: None,
            base_dir: dir.path().to_path_buf(),
            scripts: ScriptSettings::default(),
        }
    }

    fn request(value: Value) -> ExecutionRequest {
        ExecutionRequest::new(value.as_object().cloned().unwrap())
    }

    fn python3() -> Option<String> {
        which::which("python3")
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    #[tokio::test]
    async fn runs_substituted_command() {
        let dir = TempDir::new().unwrap();
        let engine = ToolEngine::new(config("echo ${in:x} ${in:n}"), settings(&dir));

        let result = engine.execute(&request(json!({"x": 2, "n": 4}))).await.unwrap();

        assert_eq!(result.command, "echo 2 4");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "2 4\n");
        assert_eq!(result.outcome, InvocationOutcome::Exited);
        assert_eq!(result.working_directory, dir.path());
        assert!(result.output_variables.is_empty());
    }

    #[tokio::test]
    async fn repeated_requests_resolve_identically() {
        let dir = TempDir::new().unwrap();
        let engine = ToolEngine::new(config("echo ${in:x} ${in:n}"), settings(&dir));
        let req = request(json!({"x": 7, "n": 1}));

        let first = engine.execute(&req).await.unwrap();
        let second = engine.execute(&req).await.unwrap();
        assert_eq!(first.command, second.command);
        assert_eq!(first.exit_code, second.exit_code);
    }

    #[tokio::test]
    async fn unexpected_input_fails_validation() {
        let dir = TempDir::new().unwrap();
        let engine = ToolEngine::new(config("echo ${in:x}"), settings(&dir));

        let failure = engine
            .execute(&request(json!({"x": 2, "n": 4, "extra": 1})))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, ExecutionStage::Validating);
        assert!(matches!(failure.error, Error::UnexpectedInput { ref names } if names == &["extra"]));
        assert!(failure.partial.command.is_none());
        assert!(failure.partial.output.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_result() {
        let dir = TempDir::new().unwrap();
        let engine = ToolEngine::new(config("echo bad >&2; exit ${in:x}"), settings(&dir));

        let result = engine.execute(&request(json!({"x": 3, "n": 0}))).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "bad\n");
    }

    #[tokio::test]
    async fn relative_tool_directory_runs_from_absolute_path() {
        let base = TempDir::new().unwrap();
        let mut cfg = config("test -f lib.rs && echo found");
        cfg.use_tool_directory = true;
        cfg.tool_directory = Some(PathBuf::from("src"));
        let engine = ToolEngine::new(cfg, settings(&base));

        let expected = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
        assert_eq!(engine.working_directory(), expected);
        assert_eq!(engine.tool_directory(), expected);

        let result = engine.execute(&request(json!({"x": 1, "n": 1}))).await.unwrap();
        assert_eq!(result.stdout, "found\n");
        assert!(result.working_directory.is_absolute());
    }

    #[tokio::test]
    async fn runs_in_tool_directory_without_changing_host_directory() {
        let base = TempDir::new().unwrap();
        let tool = TempDir::new().unwrap();
        std::fs::write(tool.path().join("marker.txt"), "here").unwrap();
        let mut cfg = config("cat marker.txt");
        cfg.use_tool_directory = true;
        cfg.tool_directory = Some(tool.path().to_path_buf());
        let engine = ToolEngine::new(cfg, settings(&base));
        let before = std::env::current_dir().unwrap();

        let result = engine.execute(&request(json!({"x": 1, "n": 1}))).await.unwrap();

        assert_eq!(result.stdout, "here");
        assert_eq!(result.working_directory, tool.path());
        assert_eq!(result.tool_directory, tool.path());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[tokio::test]
    async fn tool_directory_falls_back_to_working_directory() {
        let dir = TempDir::new().unwrap();
        let engine = ToolEngine::new(config("true"), settings(&dir));
        assert_eq!(engine.tool_directory(), dir.path());
    }

    #[tokio::test]
    async fn timeout_skips_post_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\n").unwrap();
        let mut cfg = config("sleep 5");
        cfg.post_script = Some("${out:root} = 1.0".into());
        let mut settings = settings(&dir).with_timeout_minutes(Some(0.05));
        settings.scripts.interpreter = vec!["toolserve-no-such-interpreter".into()];
        let engine = ToolEngine::new(cfg, settings);

        let result = engine.execute(&request(json!({"x": 1, "n": 1}))).await.unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.outcome, InvocationOutcome::TimedOut);
        assert!(result.stderr.contains("Timeout expired"));
        assert!(result.output_variables.is_empty());
    }

    #[tokio::test]
    async fn missing_project_root_fails_before_invocation() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config("echo ran");
        cfg.post_script = Some("${out:root} = 1.0".into());
        let mut settings = settings(&dir);
        settings.scripts.project_marker = "toolserve-absent-marker.toml".into();
        let engine = ToolEngine::new(cfg, settings);

        let failure = engine.execute(&request(json!({"x": 1, "n": 1}))).await.unwrap_err();

        assert_eq!(failure.stage, ExecutionStage::RunningPostScript);
        assert!(matches!(failure.error, Error::ProjectRootNotFound { .. }));
        assert_eq!(failure.partial.command.as_deref(), Some("echo ran"));
        assert!(failure.partial.output.is_none());
    }

    #[tokio::test]
    async fn post_script_outputs_are_validated() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\n").unwrap();
        let mut cfg = config("echo 2 > result.txt");
        cfg.post_script = Some(
            "file = open(\"${dir:tool}/result.txt\",\"r\")\nroot = file.read()\nfile.close()\n${out:root} = float(root)".into(),
        );
        let mut settings = settings(&dir);
        settings.scripts.interpreter = vec![python];
        let engine = ToolEngine::new(cfg, settings);

        let result = engine.execute(&request(json!({"x": 2, "n": 4}))).await.unwrap();

        assert_eq!(result.output_variables["root"], json!(2.0));
    }

    #[tokio::test]
    async fn wrong_output_type_fails_output_validation() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\n").unwrap();
        let mut cfg = config("echo done");
        cfg.post_script = Some("${out:root} = 'abc'".into());
        let mut settings = settings(&dir);
        settings.scripts.interpreter = vec![python];
        let engine = ToolEngine::new(cfg, settings);

        let failure = engine.execute(&request(json!({"x": 2, "n": 4}))).await.unwrap_err();

        assert_eq!(failure.stage, ExecutionStage::ValidatingOutputs);
        assert!(matches!(failure.error, Error::OutputTypeMismatch { ref name, .. } if name == "root"));
        let output = failure.partial.output.unwrap();
        assert_eq!(output.stdout, "done\n");
        assert_eq!(failure.partial.output_variables["root"], json!("abc"));
    }

    #[tokio::test]
    async fn pre_script_values_reach_post_script() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\n").unwrap();
        let mut cfg = config("true");
        cfg.pre_script = Some("${out:seed} = 1.5".into());
        cfg.post_script = Some("${out:root} = ${out:seed} * 2".into());
        cfg.outputs.push(EndpointSpec::new("seed", "Float"));
        let mut settings = settings(&dir);
        settings.scripts.interpreter = vec![python];
        let engine = ToolEngine::new(cfg, settings);

        let result = engine.execute(&request(json!({"x": 2, "n": 4}))).await.unwrap();

        assert_eq!(result.output_variables["root"], json!(3.0));
        assert_eq!(result.output_variables["seed"], json!(1.5));
    }
}
