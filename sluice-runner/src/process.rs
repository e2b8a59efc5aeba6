//! External command execution
//!
//! [`CommandExecutor`] is the only place where a step touches the outside
//! world. The local implementation spawns each invocation in its own process
//! group so that timeouts and cancellation can take down the whole tree.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines longer than this are replaced by a marker instead of being buffered
const MAX_RAW_LINE: u64 = 1024 * 1024;

/// Captured lines per stream beyond this are dropped (the pipe is still drained)
const MAX_CAPTURED_LINES: usize = 20_000;

/// How long readers may keep going once the process group is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One command to run for a step
#[derive(Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Variables added on top of the executor's base environment
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

// Env values may hold resolved secrets, so only the keys are printed
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal that did not come from us
    Signalled,
    TimedOut,
    Cancelled,
}

/// Raw, unredacted result of an invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external commands on behalf of the stage runner
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the invocation to completion, its timeout, or cancellation
    async fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecutorError>;
}

/// Executes commands as local child processes
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    grace: Duration,
    scrubbed_prefixes: Vec<String>,
}

impl LocalExecutor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            scrubbed_prefixes: Vec::new(),
        }
    }

    /// Removes inherited variables starting with `prefix` from every child
    ///
    /// Used so that secrets exported to the orchestrator for `EnvSecretStore`
    /// only reach the steps that declare them.
    pub fn scrub_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.scrubbed_prefixes.push(prefix.into());
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, _) in std::env::vars_os() {
            let Some(key) = key.to_str() else { continue };
            if self.scrubbed_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                cmd.env_remove(key);
            }
        }
        cmd.envs(&invocation.env);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecutorError> {
        debug!(
            program = %invocation.program,
            working_dir = %invocation.working_dir.display(),
            timeout_secs = invocation.timeout.as_secs(),
            "Spawning command"
        );

        let mut child = self
            .command(&invocation)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        // The pid doubles as the process group id; tokio forgets it once the
        // leader is reaped
        let pid = child.id();
        let deadline = Instant::now() + invocation.timeout;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut output =
            tokio::spawn(async move { tokio::join!(collect(stdout), collect(stderr)) });

        enum ExitReason {
            Completed(std::process::ExitStatus),
            WaitError(std::io::Error),
            Timeout,
            Cancelled,
        }

        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => ExitReason::WaitError(e),
            },
            _ = tokio::time::sleep_until(deadline) => ExitReason::Timeout,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        let mut drained = None;
        let termination = match exit_reason {
            ExitReason::Completed(status) => {
                let exited = match status.code() {
                    Some(code) => Termination::Exited(code),
                    None => Termination::Signalled,
                };

                // Background children may still hold the pipes open, and they
                // answer to the same deadline and cancellation as the leader
                tokio::select! {
                    captured = &mut output => {
                        drained = Some(captured);
                        kill_process_group(pid);
                        exited
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            program = %invocation.program,
                            timeout_secs = invocation.timeout.as_secs(),
                            "Command exited but its process group kept running past the timeout"
                        );
                        terminate_process_group(&mut child, pid, self.grace).await;
                        Termination::TimedOut
                    }
                    _ = cancel.cancelled() => {
                        info!(program = %invocation.program, "Command cancelled");
                        terminate_process_group(&mut child, pid, self.grace).await;
                        Termination::Cancelled
                    }
                }
            }
            ExitReason::WaitError(source) => {
                terminate_process_group(&mut child, pid, self.grace).await;
                finish_output(output).await;
                return Err(ExecutorError::Wait {
                    program: invocation.program,
                    source,
                });
            }
            ExitReason::Timeout => {
                warn!(
                    program = %invocation.program,
                    timeout_secs = invocation.timeout.as_secs(),
                    "Command timed out"
                );
                terminate_process_group(&mut child, pid, self.grace).await;
                Termination::TimedOut
            }
            ExitReason::Cancelled => {
                info!(program = %invocation.program, "Command cancelled");
                terminate_process_group(&mut child, pid, self.grace).await;
                Termination::Cancelled
            }
        };

        let (stdout, stderr) = match drained {
            Some(Ok(captured)) => captured,
            Some(Err(e)) => {
                warn!(error = %e, "Output reader failed");
                (String::new(), String::new())
            }
            None => finish_output(output).await,
        };

        Ok(CommandOutput {
            termination,
            stdout,
            stderr,
        })
    }
}

/// Waits briefly for the readers once the process group is gone
async fn finish_output(output: JoinHandle<(String, String)>) -> (String, String) {
    let abort = output.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader failed");
            (String::new(), String::new())
        }
        Err(_) => {
            warn!("Command output still open after its process group was killed");
            abort.abort();
            (String::new(), String::new())
        }
    }
}

/// Reads a stream to EOF, lossily decoding each line
///
/// The stream is always drained so the writer never blocks or sees a broken
/// pipe. Lines are kept whole; length limits apply after redaction.
async fn collect<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut collected = String::new();
    let mut lines = 0usize;

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_RAW_LINE)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(n) => {
                let oversized = n as u64 == MAX_RAW_LINE && buf.last() != Some(&b'\n');
                let skipped = if oversized {
                    n + discard_line(&mut reader).await
                } else {
                    0
                };

                lines += 1;
                if lines > MAX_CAPTURED_LINES {
                    continue;
                }
                if oversized {
                    collected.push_str(&format!("... [line of {} bytes dropped]\n", skipped));
                } else {
                    collected.push_str(&String::from_utf8_lossy(&buf));
                }
            }
            Err(e) => {
                warn!("Error reading command output: {}", e);
                break;
            }
        }
    }

    if lines > MAX_CAPTURED_LINES {
        collected.push_str(&format!(
            "... [{} more lines dropped]\n",
            lines - MAX_CAPTURED_LINES
        ));
    }
    collected
}

/// Skips the rest of the current line, returning the bytes consumed
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> usize {
    let mut discarded = 0;
    loop {
        let (consumed, done) = match reader.fill_buf().await {
            Ok([]) | Err(_) => return discarded,
            Ok(available) => match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            },
        };
        reader.consume(consumed);
        discarded += consumed;
        if done {
            return discarded;
        }
    }
}

/// SIGTERM to the process group, wait up to `grace` for every member, then
/// SIGKILL and reap
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, pid: Option<u32>, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };

    signal_group(pid, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        // A zombie leader still counts as a group member
        let _ = child.try_wait();
        if !group_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    signal_group(pid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _pid: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Kills whatever is left of the group after the leader exited
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = ?e, "Signalling process group failed"),
    }
}

#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(-(pid as i32)), None::<Signal>).is_ok()
}

/// Maps symbolic step actions to concrete commands
///
/// `with` inputs reach the command as `INPUT_<NAME>` variables.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Vec<String>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as `argv[0] argv[1..]`; empty argv is ignored
    pub fn register(&mut self, name: impl Into<String>, argv: Vec<String>) {
        if !argv.is_empty() {
            self.actions.insert(name.into(), argv);
        }
    }

    pub fn with_action<I, S>(mut self, name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(name, argv.into_iter().map(Into::into).collect());
        self
    }

    /// Program and arguments for `name`
    pub fn resolve(&self, name: &str) -> Option<(&str, &[String])> {
        self.actions
            .get(name)
            .and_then(|argv| argv.split_first())
            .map(|(program, args)| (program.as_str(), args))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Environment variable carrying a `with` input
    pub fn input_variable(key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("INPUT_{}", normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> Invocation {
        Invocation::new("sh", std::env::temp_dir(), timeout).args(["-c", script])
    }

    #[test]
    fn test_invocation_debug_hides_env_values() {
        let mut invocation = sh("true", Duration::from_secs(1));
        invocation
            .env
            .insert("DOCKER_PASSWORD".to_string(), "hunter2".to_string());

        let debug = format!("{:?}", invocation);
        assert!(debug.contains("DOCKER_PASSWORD"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_action_registry() {
        let registry = ActionRegistry::new()
            .with_action("checkout", ["git", "checkout", "--force"])
            .with_action("nothing", Vec::<String>::new());

        let (program, args) = registry.resolve("checkout").unwrap();
        assert_eq!(program, "git");
        assert_eq!(args, ["checkout".to_string(), "--force".to_string()]);
        assert!(!registry.contains("nothing"));
        assert!(registry.resolve("deploy").is_none());
    }

    #[test]
    fn test_input_variable_names() {
        assert_eq!(ActionRegistry::input_variable("node-version"), "INPUT_NODE_VERSION");
        assert_eq!(ActionRegistry::input_variable("path"), "INPUT_PATH");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let executor = LocalExecutor::default();
        let output = executor
            .invoke(
                sh("echo out; echo err >&2; exit 3", Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(3));
        assert!(!output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_passed() {
        let executor = LocalExecutor::default();
        let mut invocation = sh("printf %s \"$GREETING\"", Duration::from_secs(10));
        invocation
            .env
            .insert("GREETING".to_string(), "hello".to_string());

        let output = executor
            .invoke(invocation, CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let executor = LocalExecutor::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let output = executor
            .invoke(
                sh("sleep 30 & sleep 30; wait", Duration::from_millis(300)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_terminates_command() {
        let executor = LocalExecutor::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let output = executor
            .invoke(sh("sleep 30", Duration::from_secs(60)), cancel)
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_is_decoded_lossily() {
        let executor = LocalExecutor::default();
        let output = executor
            .invoke(
                sh(
                    "printf 'a\\377b\\n'; i=0; while [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done; echo done",
                    Duration::from_secs(30),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(0));
        assert!(output.stdout.starts_with("a\u{FFFD}b\n"));
        assert!(output.stdout.contains("line 1999\n"));
        assert!(output.stdout.ends_with("done\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oversized_line_is_replaced_and_reading_continues() {
        let executor = LocalExecutor::default();
        let output = executor
            .invoke(
                sh(
                    "head -c 1500000 /dev/zero | tr '\\0' x; echo; echo after",
                    Duration::from_secs(30),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(0));
        assert!(output.stdout.contains("[line of 1500001 bytes dropped]"));
        assert!(output.stdout.ends_with("after\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_child_holding_pipe_is_bounded_by_timeout() {
        let executor = LocalExecutor::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let output = executor
            .invoke(
                sh("sleep 6 & echo started", Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(output.stdout, "started\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_child_holding_pipe_is_cancelled() {
        let executor = LocalExecutor::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let output = executor
            .invoke(sh("sleep 30 & echo started", Duration::from_secs(60)), cancel)
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(output.stdout, "started\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_written_after_leader_exits_is_kept() {
        let executor = LocalExecutor::default();
        let output = executor
            .invoke(
                sh("(sleep 0.3; echo late) & echo early; exit 4", Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(4));
        assert_eq!(output.stdout, "early\nlate\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let executor = LocalExecutor::default();
        let err = executor
            .invoke(
                Invocation::new(
                    "definitely-not-a-real-program-sluice",
                    std::env::temp_dir(),
                    Duration::from_secs(1),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
