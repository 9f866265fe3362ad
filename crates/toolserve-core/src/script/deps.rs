use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency tool not found: {0}")]
    ToolNotFound(String),
    #[error("`{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adds and removes modules in the environment hook scripts run in
#[async_trait]
pub trait DependencyManager: Send + Sync {
    async fn add(&self, module: &str, project_root: &Path) -> Result<(), DependencyError>;

    async fn remove(&self, module: &str, project_root: &Path) -> Result<(), DependencyError>;
}

/// Drives an external package manager, e.g. `poetry add` / `poetry remove`
#[derive(Debug, Clone)]
pub struct CommandDependencyManager {
    program: String,
    add_verb: String,
    remove_verb: String,
}

impl Default for CommandDependencyManager {
    fn default() -> Self {
        Self::new("poetry")
    }
}

impl CommandDependencyManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            add_verb: "add".to_string(),
            remove_verb: "remove".to_string(),
        }
    }

    pub fn with_verbs(mut self, add: impl Into<String>, remove: impl Into<String>) -> Self {
        self.add_verb = add.into();
        self.remove_verb = remove.into();
        self
    }

    async fn run(&self, verb: &str, module: &str, project_root: &Path) -> Result<(), DependencyError> {
        let program = which::which(&self.program)
            .map_err(|_| DependencyError::ToolNotFound(self.program.clone()))?;

        let output = Command::new(program)
            .arg(verb)
            .arg(module)
            .current_dir(project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DependencyError::CommandFailed {
                command: format!("{} {verb} {module}", self.program),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl DependencyManager for CommandDependencyManager {
    async fn add(&self, module: &str, project_root: &Path) -> Result<(), DependencyError> {
        tracing::info!(tool = %self.program, module, "Installing dependency");
        self.run(&self.add_verb, module, project_root).await
    }

    async fn remove(&self, module: &str, project_root: &Path) -> Result<(), DependencyError> {
        tracing::info!(tool = %self.program, module, "Removing dependency");
        self.run(&self.remove_verb, module, project_root).await
    }
}
