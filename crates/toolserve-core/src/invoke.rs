use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Exit code reported when the watchdog killed the tool
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported when the tool could not be executed for lack of permission
pub const PERMISSION_DENIED_EXIT_CODE: i32 = -2;

/// POSIX shells exit with 126 when the command exists but cannot be executed
const SHELL_CANNOT_EXECUTE: i32 = 126;

/// How long to keep draining pipes after the process group was killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The process ran and exited on its own, with any exit code
    Exited,
    TimedOut,
    PermissionDenied,
}

/// Output from one tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub outcome: InvocationOutcome,
}

enum Attempt {
    Finished(CommandOutput),
    PermissionDenied(String),
}

/// Runs a resolved command line through the platform shell
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    timeout: Option<Duration>,
}

impl ProcessInvoker {
    pub const fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Run `command` in `working_dir`.
    ///
    /// Timeouts and permission failures come back as a [`CommandOutput`] carrying
    /// a sentinel exit code. Only failures to start the shell itself are errors.
    pub async fn run(&self, command: &str, working_dir: &Path) -> Result<CommandOutput> {
        let detail = match self.run_once(command, working_dir, false).await? {
            Attempt::Finished(output) => return Ok(output),
            Attempt::PermissionDenied(detail) => detail,
        };

        if !grant_execute_permission(command, working_dir) {
            return Ok(permission_denied(command, &detail));
        }

        match self.run_once(command, working_dir, true).await? {
            Attempt::Finished(output) => Ok(output),
            Attempt::PermissionDenied(detail) => Ok(permission_denied(command, &detail)),
        }
    }

    /// `after_grant` marks the retry following a successful `chmod`, where a
    /// shell refusal can no longer be checked against the program's mode.
    async fn run_once(&self, command: &str, working_dir: &Path, after_grant: bool) -> Result<Attempt> {
        let mut cmd = shell_command(command);
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(Attempt::PermissionDenied(err.to_string()));
            }
            Err(err) => {
                return Err(Error::io(
                    format!("failed to start '{command}' in {}", working_dir.display()),
                    err,
                ));
            }
        };

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => {
                if let Ok(status) = tokio::time::timeout(limit, child.wait()).await {
                    status.map_err(|e| Error::io("failed to wait for tool process", e))?
                } else {
                    terminate_process_group(&mut child).await;
                    let stdout = drain(stdout, Some(DRAIN_GRACE)).await;
                    let stderr = drain(stderr, Some(DRAIN_GRACE)).await;
                    tracing::warn!(
                        timeout_secs = limit.as_secs_f64(),
                        "Tool process exceeded its timeout and was terminated"
                    );
                    return Ok(Attempt::Finished(timed_out(command, limit, stdout, &stderr)));
                }
            }
            None => child
                .wait()
                .await
                .map_err(|e| Error::io("failed to wait for tool process", e))?,
        };

        let stdout = drain(stdout, None).await;
        let stderr = drain(stderr, None).await;
        let exit_code = exit_code(status);

        if exit_code == SHELL_CANNOT_EXECUTE
            && stderr.contains("ermission denied")
            && (after_grant || lacks_execute_permission(command, working_dir))
        {
            return Ok(Attempt::PermissionDenied(stderr));
        }

        Ok(Attempt::Finished(CommandOutput {
            exit_code,
            stdout,
            stderr,
            outcome: InvocationOutcome::Exited,
        }))
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    }
    #[cfg(not(windows))]
    {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            let _ = reader.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn drain(handle: JoinHandle<String>, grace: Option<Duration>) -> String {
    match grace {
        Some(grace) => match tokio::time::timeout(grace, handle).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        },
        None => handle.await.unwrap_or_default(),
    }
}

/// Kill the child and everything it spawned.
///
/// The child leads its own process group on Unix, so the whole group is
/// signalled; the direct kill afterwards covers platforms without groups.
async fn terminate_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(err) = group_killer(pid)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::warn!(pid, error = %err, "Failed to signal tool process group");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(not(windows))]
fn group_killer(pid: u32) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(format!("kill -KILL -- -{pid}"));
    c
}

#[cfg(windows)]
fn group_killer(pid: u32) -> Command {
    let mut c = Command::new("taskkill");
    c.args(["/F", "/T", "/PID", &pid.to_string()]);
    c
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn timed_out(command: &str, limit: Duration, stdout: String, partial_stderr: &str) -> CommandOutput {
    let mut stderr = format!(
        "Timeout expired: '{command}' did not finish within {:.2} minutes and was terminated.",
        limit.as_secs_f64() / 60.0
    );
    if !partial_stderr.is_empty() {
        stderr.push('\n');
        stderr.push_str(partial_stderr);
    }
    CommandOutput {
        exit_code: TIMEOUT_EXIT_CODE,
        stdout,
        stderr,
        outcome: InvocationOutcome::TimedOut,
    }
}

fn permission_denied(command: &str, detail: &str) -> CommandOutput {
    tracing::warn!(command, "Tool could not be executed: permission denied");
    CommandOutput {
        exit_code: PERMISSION_DENIED_EXIT_CODE,
        stdout: String::new(),
        stderr: format!("Permission denied: unable to execute '{command}'. {}", detail.trim()),
        outcome: InvocationOutcome::PermissionDenied,
    }
}

/// Existing file the command line starts with, resolved against `working_dir`
#[cfg(unix)]
fn program_file(command: &str, working_dir: &Path) -> Option<(std::path::PathBuf, std::fs::Metadata)> {
    let program = command.split_whitespace().next()?;
    let path = working_dir.join(program.trim_matches(|c| c == '"' || c == '\''));
    let metadata = std::fs::metadata(&path).ok()?;
    metadata.is_file().then_some((path, metadata))
}

/// Whether the command's program is a file with no execute bit at all
#[cfg(unix)]
fn lacks_execute_permission(command: &str, working_dir: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    program_file(command, working_dir)
        .is_some_and(|(_, metadata)| metadata.permissions().mode() & 0o111 == 0)
}

#[cfg(not(unix))]
const fn lacks_execute_permission(_command: &str, _working_dir: &Path) -> bool {
    false
}

/// Best-effort `chmod +x` on the program the command line starts with.
///
/// Returns whether anything changed, i.e. whether a retry can succeed.
#[cfg(unix)]
fn grant_execute_permission(command: &str, working_dir: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Some((path, metadata)) = program_file(command, working_dir) else {
        return false;
    };

    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o111 == 0o111 {
        return false;
    }
    permissions.set_mode(mode | 0o111);

    match std::fs::set_permissions(&path, permissions) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Granted execute permission to tool");
            true
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Could not grant execute permission");
            false
        }
    }
}

#[cfg(not(unix))]
const fn grant_execute_permission(_command: &str, _working_dir: &Path) -> bool {
    false
}
