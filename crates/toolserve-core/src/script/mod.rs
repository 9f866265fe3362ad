//! Pre-/post-script hooks.
//!
//! Hooks run out of process under a configurable interpreter, rooted at the
//! tool's project root. A hook that fails to import a module gets that module
//! installed through the [`DependencyManager`] and is retried; everything that
//! was installed is removed again once the hook has finished.

pub mod deps;
pub mod driver;
pub mod project;

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Hook, Result};

pub use deps::{CommandDependencyManager, DependencyError, DependencyManager};
pub use driver::ScriptOutcome;
pub use project::find_project_root;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    /// Program and leading arguments, e.g. `poetry run python`
    pub interpreter: Vec<String>,
    /// File whose presence marks the project root
    pub project_marker: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            interpreter: vec!["poetry".into(), "run".into(), "python".into()],
            project_marker: "pyproject.toml".into(),
        }
    }
}

impl ScriptSettings {
    /// Split a command line like `poetry run python` into an interpreter.
    pub fn with_interpreter_line(mut self, line: &str) -> Self {
        self.interpreter = line.split_whitespace().map(str::to_string).collect();
        self
    }
}

/// Directories a hook runs against
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub tool_dir: &'a Path,
    pub project_root: &'a Path,
}

pub struct ScriptRunner {
    settings: ScriptSettings,
    dependencies: Arc<dyn DependencyManager>,
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ScriptRunner {
    pub fn new(settings: ScriptSettings, dependencies: Arc<dyn DependencyManager>) -> Self {
        Self {
            settings,
            dependencies,
        }
    }

    pub fn project_root_for(&self, tool_dir: &Path) -> Result<std::path::PathBuf> {
        find_project_root(tool_dir, &self.settings.project_marker)
    }

    /// Run one hook, updating `output_vars` with whatever the snippet assigned.
    ///
    /// On failure `output_vars` keeps the values it had on entry.
    pub async fn run(
        &self,
        hook: Hook,
        source: &str,
        ctx: ScriptContext<'_>,
        output_vars: &mut Map<String, Value>,
    ) -> Result<()> {
        let script = driver::render_script(source, ctx.tool_dir);
        let mut installed = Vec::new();
        let result = self
            .resolve_and_run(hook, &script, ctx.project_root, output_vars, &mut installed)
            .await;
        self.remove_installed(&installed, ctx.project_root).await;
        result
    }

    async fn resolve_and_run(
        &self,
        hook: Hook,
        script: &str,
        project_root: &Path,
        output_vars: &mut Map<String, Value>,
        installed: &mut Vec<String>,
    ) -> Result<()> {
        let mut attempted = HashSet::new();
        loop {
            match self.run_once(hook, script, project_root, output_vars).await? {
                ScriptOutcome::Completed {
                    output_vars: produced,
                } => {
                    *output_vars = produced;
                    return Ok(());
                }
                ScriptOutcome::MissingModule { module, message } => {
                    let Some(module) = driver::installable_module(&module, &message) else {
                        return Err(Error::DependencyInstallFailed {
                            module,
                            reason: format!("could not determine module to install: {message}"),
                        });
                    };
                    if !attempted.insert(module.clone()) {
                        return Err(Error::DependencyInstallFailed {
                            module,
                            reason: format!("still missing after installation: {message}"),
                        });
                    }
                    tracing::warn!("Missing dependency detected: {module}. Attempting to install it.");
                    if let Err(err) = self.dependencies.add(&module, project_root).await {
                        return Err(Error::DependencyInstallFailed {
                            module,
                            reason: err.to_string(),
                        });
                    }
                    installed.push(module);
                }
                ScriptOutcome::Raised {
                    kind,
                    message,
                    traceback,
                } => {
                    tracing::debug!(%hook, %traceback, "Hook raised");
                    return Err(Error::UnhandledScriptError {
                        hook,
                        kind,
                        message,
                        traceback,
                    });
                }
            }
        }
    }

    async fn run_once(
        &self,
        hook: Hook,
        script: &str,
        project_root: &Path,
        output_vars: &Map<String, Value>,
    ) -> Result<ScriptOutcome> {
        let Some((program, args)) = self.settings.interpreter.split_first() else {
            return Err(Error::ScriptProtocol {
                hook,
                reason: "no interpreter configured".to_string(),
            });
        };

        let scratch = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create hook scratch directory", e))?;
        let result_path = scratch.path().join("result.json");
        let vars = serde_json::to_string(output_vars).map_err(|e| Error::ScriptProtocol {
            hook,
            reason: format!("output variables are not serializable: {e}"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .arg("-c")
            .arg(driver::DRIVER_SOURCE)
            .current_dir(project_root)
            .env(driver::RESULT_FILE_ENV, &result_path)
            .env(driver::OUTPUT_VARS_ENV, vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("failed to start {hook} interpreter '{program}'"), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| Error::io(format!("failed to send {hook} to interpreter"), e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io(format!("failed to wait for {hook} interpreter"), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(%hook, stdout = %stdout.trim_end(), "Hook output");
        }

        match std::fs::read_to_string(&result_path) {
            Ok(document) if !document.trim().is_empty() => {
                serde_json::from_str(&document).map_err(|e| Error::ScriptProtocol {
                    hook,
                    reason: format!("malformed result document: {e}"),
                })
            }
            _ => Err(Error::ScriptProtocol {
                hook,
                reason: format!(
                    "interpreter exited with code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    async fn remove_installed(&self, installed: &[String], project_root: &Path) {
        for module in installed {
            if let Err(err) = self.dependencies.remove(module, project_root).await {
                tracing::warn!(module, error = %err, "Failed to remove installed dependency");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Installs a module by dropping `<module>.py` into the project root
    #[derive(Default)]
    struct FakeDependencies {
        module_source: String,
        fail_add: bool,
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DependencyManager for FakeDependencies {
        async fn add(&self, module: &str, project_root: &Path) -> std::result::Result<(), DependencyError> {
            self.added.lock().unwrap().push(module.to_string());
            if self.fail_add {
                return Err(DependencyError::ToolNotFound("poetry".into()));
            }
            if !self.module_source.is_empty() {
                std::fs::write(project_root.join(format!("{module}.py")), &self.module_source)?;
            }
            Ok(())
        }

        async fn remove(&self, module: &str, project_root: &Path) -> std::result::Result<(), DependencyError> {
            self.removed.lock().unwrap().push(module.to_string());
            let _ = std::fs::remove_file(project_root.join(format!("{module}.py")));
            Ok(())
        }
    }

    fn python3() -> Option<String> {
        which::which("python3")
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn runner(python: String, deps: Arc<FakeDependencies>) -> ScriptRunner {
        let settings = ScriptSettings {
            interpreter: vec![python],
            ..ScriptSettings::default()
        };
        ScriptRunner::new(settings, deps)
    }

    fn ctx(dir: &TempDir) -> ScriptContext<'_> {
        ScriptContext {
            tool_dir: dir.path(),
            project_root: dir.path(),
        }
    }

    #[test]
    fn interpreter_line_is_split() {
        let settings = ScriptSettings::default().with_interpreter_line("  uv run  python3 ");
        assert_eq!(settings.interpreter, vec!["uv", "run", "python3"]);
        assert_eq!(settings.project_marker, "pyproject.toml");
    }

    #[tokio::test]
    async fn empty_interpreter_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let settings = ScriptSettings {
            interpreter: Vec::new(),
            ..ScriptSettings::default()
        };
        let runner = ScriptRunner::new(settings, Arc::new(FakeDependencies::default()));
        let err = runner
            .run(Hook::Pre, "pass", ctx(&dir), &mut Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptProtocol { hook: Hook::Pre, .. }));
    }

    #[tokio::test]
    async fn assigns_output_from_tool_directory() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("result.txt"), "2").unwrap();
        let runner = runner(python, Arc::new(FakeDependencies::default()));

        let mut vars = Map::new();
        let script = "file = open(\"${dir:tool}/result.txt\",\"r\")\r\nroot = file.read()\r\nfile.close()\r\n${out:root} = float(root)";
        runner.run(Hook::Post, script, ctx(&dir), &mut vars).await.unwrap();

        assert_eq!(vars["root"], json!(2.0));
    }

    #[tokio::test]
    async fn keeps_existing_output_variables() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let runner = runner(python, Arc::new(FakeDependencies::default()));

        let mut vars = json!({"seen": 1}).as_object().cloned().unwrap();
        runner
            .run(Hook::Post, "${out:next} = ${out:seen} + 1", ctx(&dir), &mut vars)
            .await
            .unwrap();

        assert_eq!(vars["seen"], json!(1));
        assert_eq!(vars["next"], json!(2));
    }

    #[tokio::test]
    async fn raised_exception_is_reported() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let runner = runner(python, Arc::new(FakeDependencies::default()));

        let mut vars = json!({"kept": true}).as_object().cloned().unwrap();
        let err = runner
            .run(Hook::Post, "raise ValueError('Test error')", ctx(&dir), &mut vars)
            .await
            .unwrap_err();

        match err {
            Error::UnhandledScriptError {
                hook,
                kind,
                message,
                traceback,
            } => {
                assert_eq!(hook, Hook::Post);
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "Test error");
                assert!(traceback.contains("ValueError"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(vars, json!({"kept": true}).as_object().cloned().unwrap());
    }

    #[tokio::test]
    async fn clean_sys_exit_completes_the_hook() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let runner = runner(python, Arc::new(FakeDependencies::default()));

        let mut vars = Map::new();
        let script = "import sys\n${out:v} = 1\nsys.exit(0)\n${out:v} = 2";
        runner.run(Hook::Post, script, ctx(&dir), &mut vars).await.unwrap();
        assert_eq!(vars["v"], json!(1));

        let mut vars = Map::new();
        runner.run(Hook::Post, "import sys\n${out:w} = 'a'\nsys.exit()", ctx(&dir), &mut vars).await.unwrap();
        assert_eq!(vars["w"], json!("a"));
    }

    #[tokio::test]
    async fn failing_sys_exit_is_reported() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let runner = runner(python, Arc::new(FakeDependencies::default()));

        let err = runner
            .run(Hook::Pre, "import sys\nsys.exit(3)", ctx(&dir), &mut Map::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::UnhandledScriptError { ref kind, ref message, .. } if kind == "SystemExit" && message == "exit status 3"
        ));
    }

    #[tokio::test]
    async fn missing_module_is_installed_retried_and_removed() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let deps = Arc::new(FakeDependencies {
            module_source: "VALUE = 3\n".into(),
            ..FakeDependencies::default()
        });
        let runner = runner(python, deps.clone());

        let mut vars = Map::new();
        let script = "import toolserve_fake_dep\n${out:v} = toolserve_fake_dep.VALUE";
        runner.run(Hook::Pre, script, ctx(&dir), &mut vars).await.unwrap();

        assert_eq!(vars["v"], json!(3));
        assert_eq!(*deps.added.lock().unwrap(), vec!["toolserve_fake_dep"]);
        assert_eq!(*deps.removed.lock().unwrap(), vec!["toolserve_fake_dep"]);
        assert!(!dir.path().join("toolserve_fake_dep.py").exists());
    }

    #[tokio::test]
    async fn failed_install_is_an_environment_error() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let deps = Arc::new(FakeDependencies {
            fail_add: true,
            ..FakeDependencies::default()
        });
        let runner = runner(python, deps.clone());

        let err = runner
            .run(Hook::Pre, "import toolserve_absent_dep", ctx(&dir), &mut Map::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::DependencyInstallFailed { ref module, .. } if module == "toolserve_absent_dep")
        );
        assert!(deps.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn module_still_missing_after_install_is_not_retried_forever() {
        let Some(python) = python3() else { return };
        let dir = TempDir::new().unwrap();
        let deps = Arc::new(FakeDependencies::default());
        let runner = runner(python, deps.clone());

        let err = runner
            .run(Hook::Pre, "import toolserve_ghost_dep.sub", ctx(&dir), &mut Map::new())
            .await
            .unwrap_err();

        match err {
            Error::DependencyInstallFailed { module, reason } => {
                assert_eq!(module, "toolserve_ghost_dep");
                assert!(reason.contains("still missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*deps.added.lock().unwrap(), vec!["toolserve_ghost_dep"]);
        assert_eq!(*deps.removed.lock().unwrap(), vec!["toolserve_ghost_dep"]);
    }
}
