//! Builder for executing external tool commands with timeout support.
//!
//! Stdout and stderr share one pipe, so the transcript holds lines in the
//! order the tool wrote them. Each tool leads its own process group. On
//! timeout, or when the stage future is dropped, the whole group is killed,
//! so helpers a tool forked die with it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;

/// Default command timeout: 1 hour.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Output captured from a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Merged stdout and stderr (lossy UTF-8).
    pub output: String,
}

/// Why a tool invocation did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The process could not be started.
    #[error("{tool}: failed to spawn: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    /// The process exceeded its timeout and was killed.
    #[error("{tool}: timed out after {after:?}")]
    TimedOut {
        tool: String,
        after: Duration,
        /// Output captured before the kill.
        output: String,
    },

    /// The process exited unsuccessfully or was terminated by a signal.
    #[error("{tool}: exited with {status}")]
    Failed {
        tool: String,
        status: ExitStatus,
        output: String,
    },

    /// Waiting on the process failed.
    #[error("{tool}: I/O error waiting for process: {source}")]
    Wait {
        tool: String,
        source: std::io::Error,
    },
}

impl CommandError {
    /// Output captured before the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            CommandError::TimedOut { output, .. } | CommandError::Failed { output, .. } => output,
            _ => "",
        }
    }
}

impl From<CommandError> for mf_core::Error {
    fn from(e: CommandError) -> Self {
        let tool = match &e {
            CommandError::Spawn { tool, .. }
            | CommandError::TimedOut { tool, .. }
            | CommandError::Failed { tool, .. }
            | CommandError::Wait { tool, .. } => tool.clone(),
        };
        mf_core::Error::tool(tool, e.to_string())
    }
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use mf_tools::ToolCommand;
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), mf_tools::CommandError> {
/// let output = ToolCommand::new(PathBuf::from("prusa-slicer"))
///     .arg("--gcode")
///     .arg("--output").arg("/tmp/out")
///     .arg("/tmp/model.stl")
///     .timeout(Duration::from_secs(600))
///     .execute()
///     .await?;
/// println!("{}", output.output);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<PathBuf>,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            current_dir: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append a path argument.
    pub fn arg_path(&mut self, p: &Path) -> &mut Self {
        self.args.push(p.to_string_lossy().into_owned());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Run the process in `dir`.
    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing merged stdout and stderr.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Spawn`] if the process cannot be started.
    /// - [`CommandError::TimedOut`] if it runs past the timeout; the process
    ///   group is killed and the child reaped first.
    /// - [`CommandError::Failed`] on a non-zero exit or signal.
    pub async fn execute(&self) -> Result<ToolOutput, CommandError> {
        let tool = self.program_name();
        let spawn_err = |source| CommandError::Spawn {
            tool: tool.clone(),
            source,
        };

        let (reader, writer) = transcript_pipe().map_err(spawn_err)?;
        let stderr_writer = writer.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(tool = %tool, args = ?self.args, "Spawning tool");

        let mut child = cmd.spawn().map_err(spawn_err)?;
        // The command still owns our copies of the write end; the reader
        // only sees EOF once they are closed.
        drop(cmd);

        let mut group = ProcessGroup::of(child.id());
        let mut receiver = pipe::Receiver::from_owned_fd(reader).map_err(spawn_err)?;
        let mut raw = Vec::new();

        let result = tokio::time::timeout(self.timeout, async {
            read_transcript(&mut receiver, &mut raw).await;
            child.wait().await
        })
        .await;

        match result {
            Ok(Ok(status)) if status.success() => Ok(ToolOutput {
                status,
                output: lossy(&raw),
            }),
            Ok(Ok(status)) => Err(CommandError::Failed {
                tool,
                status,
                output: lossy(&raw),
            }),
            Ok(Err(source)) => Err(CommandError::Wait { tool, source }),
            Err(_elapsed) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::warn!(tool = %tool, "Failed to reap timed-out tool: {e}");
                }
                Err(CommandError::TimedOut {
                    tool,
                    after: self.timeout,
                    output: lossy(&raw),
                })
            }
        }
    }
}

/// A close-on-exec pipe; the child only sees the copies dup'ed onto its
/// stdout and stderr.
fn transcript_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Append everything the tool writes until EOF. Bytes read before a timeout
/// stay in `raw`.
async fn read_transcript(receiver: &mut pipe::Receiver, raw: &mut Vec<u8>) {
    let mut chunk = [0u8; 8192];
    loop {
        match receiver.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!("Tool output read failed: {e}");
                break;
            }
        }
    }
}

fn lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// The process group a tool leads. Dropping it sends SIGKILL to every
/// member that is still running.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child_id: Option<u32>) -> Self {
        Self(child_id.and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw))
    }

    fn kill(&mut self) {
        let Some(pgid) = self.0.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = pgid.as_raw(), "Failed to kill tool process group: {e}"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(PathBuf::from("sh"));
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn execute_echo() {
        let output = sh("echo hello").execute().await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.output.trim(), "hello");
    }

    #[tokio::test]
    async fn stderr_is_merged() {
        let output = sh("echo out; echo err 1>&2").execute().await.unwrap();
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        sh("echo data > produced.txt")
            .current_dir(dir.path())
            .execute()
            .await
            .unwrap();
        assert!(dir.path().join("produced.txt").exists());
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed_with_output() {
        let err = sh("echo broken mesh; exit 3").execute().await.unwrap_err();
        match err {
            CommandError::Failed { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("broken mesh"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_fires_and_kills() {
        let started = Instant::now();
        let err = sh("echo started; sleep 10")
            .timeout(Duration::from_millis(200))
            .execute()
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn transcript_keeps_write_order_across_streams() {
        for _ in 0..50 {
            let output = sh(r#"echo warning 1>&2; echo '{"ok":true}'"#)
                .execute()
                .await
                .unwrap();
            let lines: Vec<&str> = output.output.lines().collect();
            assert_eq!(lines, vec!["warning", r#"{"ok":true}"#]);
        }
    }

    /// Whether `pid` is running; zombies count as gone.
    #[cfg(target_os = "linux")]
    fn running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(str::to_owned))
            .is_some_and(|rest| !rest.trim_start().starts_with('Z'))
    }

    #[cfg(target_os = "linux")]
    async fn gone_soon(pid: i32) -> bool {
        for _ in 0..100 {
            if !running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn read_pid(path: &Path) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_forked_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let err = sh("sleep 30 & echo $! > helper.pid; wait")
            .current_dir(dir.path())
            .timeout(Duration::from_millis(300))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));

        let helper = read_pid(&dir.path().join("helper.pid"));
        assert!(gone_soon(helper).await, "helper {helper} outlived the tool");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_the_future_kills_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = sh("echo $$ > tool.pid; sleep 30 & echo $! > helper.pid; wait");
        cmd.current_dir(dir.path());

        let cancelled = tokio::time::timeout(Duration::from_millis(300), cmd.execute()).await;
        assert!(cancelled.is_err());

        let tool = read_pid(&dir.path().join("tool.pid"));
        let helper = read_pid(&dir.path().join("helper.pid"));
        assert!(gone_soon(tool).await, "tool {tool} survived cancellation");
        assert!(gone_soon(helper).await, "helper {helper} survived cancellation");
    }

    #[test]
    fn converts_to_core_tool_error() {
        let err: mf_core::Error = CommandError::Spawn {
            tool: "blender".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        }
        .into();
        assert!(matches!(err, mf_core::Error::Tool { ref tool, .. } if tool == "blender"));
    }
}
