use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, RwLock};
use wifi_capture_schemas::models::SnifferEvent;
use wifi_capture_schemas::settings::SnifferSettings;
use crate::events::EventPublisher;

/// This is the implementation and management of the remote shell transport to the
/// router. Although there is the sophisticated SSH crate `russh`, all we need is to
/// run remote commands and stream file contents back, so we drive the system ssh
/// client as a sub process and multiplex over its control sockets. In the future we
/// can look at using something more sophisticated if necessary.

/// Outcome of one remote command, owned by the caller once produced.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// The error taxonomy every transport failure is translated into before it
/// reaches the capture manager. Raw io errors never leave this module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication to remote host failed: {0}")]
    AuthFailure(String),
    #[error("could not connect to remote host: {0}")]
    ConnectionRefused(String),
    #[error("remote command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
    #[error("no pooled session became free within {0:?}")]
    PoolExhausted(Duration),
    #[error("local ssh client error: {0}")]
    Local(String),
}

/// The seam between the capture components and the transport. The pool is the
/// production implementation, tests inject a scripted one so command strings can
/// be asserted without a router on the bench.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command, returning its result whatever the remote exit status was.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionError>;

    /// Run a command and stream its stdout straight into a local file, for
    /// pulling capture artefacts without a file transfer service on the router.
    async fn execute_streamed(
        &self,
        command: &str,
        timeout: Duration,
        sink: &Path,
    ) -> Result<CommandResult, ExecutionError>;

    /// Like `execute` but a non zero remote exit is an error.
    async fn execute_checked(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionError> {
        let result = self.execute(command, timeout).await?;
        if !result.success() {
            return Err(ExecutionError::NonZeroExit {
                status: result.exit_status,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }
}

/// One pooled session slot. A session is an OpenSSH control master over its own
/// control socket, so repeated commands through the slot skip authentication.
/// Never used by two callers at once, ownership passes through the pool queue.
#[derive(Debug)]
struct SshSession {
    slot: usize,
    control_path: PathBuf,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    established: bool,
    healthy: bool,
}

/// Bounded pool of authenticated sessions to the one fixed router. Sessions are
/// established lazily on first use and handed out through a queue, callers block
/// on acquisition up to the configured acquire timeout.
pub struct SshPool {
    settings: SnifferSettings,
    ssh_exe: PathBuf,
    // keeps the control sockets alive for the lifetime of the pool
    _control_dir: tempfile::TempDir,
    slots_tx: mpsc::Sender<SshSession>,
    slots_rx: Mutex<mpsc::Receiver<SshSession>>,
    last_error: RwLock<Option<String>>,
    events: EventPublisher,
}

impl SshPool {
    pub fn new(settings: SnifferSettings, events: EventPublisher) -> anyhow::Result<Self> {
        let ssh_exe = find_ssh_executable();
        tracing::info!("ssh pool using client binary {:?}", ssh_exe);
        let control_dir = tempfile::Builder::new()
            .prefix("wifi-capture-ssh")
            .tempdir()
            .context("creating control socket folder for ssh pool")?;
        let pool_size = settings.pool_size.max(1);
        let (slots_tx, slots_rx) = mpsc::channel(pool_size);
        for slot in 0..pool_size {
            let session = SshSession {
                slot,
                control_path: control_dir.path().join(format!("cm-{slot}.sock")),
                created_at: Utc::now(),
                last_used: Utc::now(),
                established: false,
                healthy: false,
            };
            slots_tx
                .try_send(session)
                .context("seeding ssh pool slots")?;
        }
        Ok(Self {
            settings,
            ssh_exe,
            _control_dir: control_dir,
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
            last_error: RwLock::new(None),
            events,
        })
    }

    /// The last connection level failure seen by the pool, for diagnostics.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Lightweight no-op probe through a pooled session.
    pub async fn health_check(&self) -> bool {
        match self.execute("echo ok", Duration::from_secs(5)).await {
            Ok(result) => result.success() && result.stdout.contains("ok"),
            Err(err) => {
                tracing::debug!("ssh health check failed: {err}");
                false
            }
        }
    }

    /// Close all control masters. Called at process shutdown, best effort.
    pub async fn shutdown(&self) {
        let mut rx = self.slots_rx.lock().await;
        while let Ok(session) = rx.try_recv() {
            if session.established {
                let _ = Command::new(&self.ssh_exe)
                    .args(self.target_args(&session.control_path))
                    .args(["-O", "exit"])
                    .output()
                    .await;
            }
        }
    }

    async fn acquire(&self) -> Result<SshSession, ExecutionError> {
        let acquire_timeout = Duration::from_secs(self.settings.acquire_timeout_secs);
        let recv = async {
            let mut rx = self.slots_rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(acquire_timeout, recv).await {
            Ok(Some(session)) => Ok(session),
            // the sender half lives as long as the pool
            Ok(None) => Err(ExecutionError::Local("ssh pool closed".to_string())),
            Err(_) => Err(ExecutionError::PoolExhausted(acquire_timeout)),
        }
    }

    fn release(&self, mut session: SshSession) {
        session.last_used = Utc::now();
        // the channel was sized for every slot so this cannot fail
        let _ = self.slots_tx.try_send(session);
    }

    /// Start a control master for the slot, authenticating to the router. The
    /// legacy algorithm options are a fixed compatibility requirement of the
    /// router's dropbear, not a retry dimension.
    async fn establish(&self, session: &mut SshSession) -> Result<(), ExecutionError> {
        // clear out any stale master for this socket first
        if session.established {
            let _ = Command::new(&self.ssh_exe)
                .args(self.target_args(&session.control_path))
                .args(["-O", "exit"])
                .output()
                .await;
            session.established = false;
        }
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let mut command = self.ssh_command(&session.control_path);
        command.arg("-o").arg("ControlMaster=yes");
        command.arg("-N").arg("-f");
        command.arg(self.target());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let output =
            output_with_deadline(command, connect_timeout + Duration::from_secs(2)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let err = classify_connect_failure(&stderr);
            *self.last_error.write().await = Some(err.to_string());
            self.events.publish(SnifferEvent::ConnectionDown {
                error: err.to_string(),
            });
            return Err(err);
        }
        session.created_at = Utc::now();
        session.established = true;
        session.healthy = true;
        *self.last_error.write().await = None;
        self.events.publish(SnifferEvent::ConnectionUp);
        tracing::debug!("ssh control master up on slot {}", session.slot);
        Ok(())
    }

    fn target(&self) -> String {
        format!("{}@{}", self.settings.user, self.settings.host)
    }

    /// Arguments that identify the target and its control socket, used for the
    /// `-O` control commands which take no remote command string.
    fn target_args(&self, control_path: &Path) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            self.target(),
        ]
    }

    fn ssh_command(&self, control_path: &Path) -> Command {
        let mut command = match &self.settings.password {
            // password auth goes through sshpass, only when explicitly configured
            Some(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password).arg(&self.ssh_exe);
                c
            }
            None => {
                let mut c = Command::new(&self.ssh_exe);
                c.arg("-o").arg("BatchMode=yes");
                c
            }
        };
        command
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            // the router's dropbear only offers legacy host key / pubkey algorithms
            .arg("-o")
            .arg("HostKeyAlgorithms=+ssh-rsa")
            .arg("-o")
            .arg("PubkeyAcceptedAlgorithms=+ssh-rsa")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.connect_timeout_secs))
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()));
        if self.settings.port != 22 {
            command.arg("-p").arg(self.settings.port.to_string());
        }
        if let Some(identity) = &self.settings.identity_file {
            command.arg("-i").arg(identity);
        }
        command.stdin(Stdio::null());
        command
    }

    /// Run one command over an acquired session, assuming its master is up.
    async fn run_on_session(
        &self,
        session: &SshSession,
        command_string: &str,
        timeout: Duration,
        sink: Option<&Path>,
    ) -> Result<CommandResult, ExecutionError> {
        let mut command = self.ssh_command(&session.control_path);
        command.arg(self.target());
        command.arg(command_string);
        match sink {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|err| ExecutionError::Local(format!("opening {path:?}: {err}")))?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }
        command.stderr(Stdio::piped());
        let started = Instant::now();
        let output = output_with_deadline(command, timeout).await?;
        Ok(CommandResult {
            exit_status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        })
    }

    async fn execute_inner(
        &self,
        command_string: &str,
        timeout: Duration,
        sink: Option<&Path>,
    ) -> Result<CommandResult, ExecutionError> {
        let mut session = self.acquire().await?;
        // at most one retry per logical call, and only for connection level
        // failures - a non zero remote exit is the caller's business
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            if !session.established || !session.healthy {
                if let Err(err) = self.establish(&mut session).await {
                    session.healthy = false;
                    if attempts >= 2 {
                        break Err(err);
                    }
                    continue;
                }
            }
            match self.run_on_session(&session, command_string, timeout, sink).await {
                Ok(result) => {
                    // dropbear closing the multiplex channel shows up as a local
                    // ssh error status with a mux message, treat as dead session
                    if result.exit_status == 255 && result.stderr.contains("mux") {
                        session.healthy = false;
                        if attempts < 2 {
                            continue;
                        }
                    }
                    break Ok(result);
                }
                Err(ExecutionError::Timeout(t)) => {
                    // the session state after an abandoned command is unknown
                    session.healthy = false;
                    break Err(ExecutionError::Timeout(t));
                }
                Err(err) => {
                    session.healthy = false;
                    if attempts >= 2 {
                        break Err(err);
                    }
                }
            }
        };
        self.release(session);
        result
    }
}

#[async_trait]
impl RemoteExecutor for SshPool {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecutionError> {
        tracing::debug!("running remote command: {}", command);
        self.execute_inner(command, timeout, None).await
    }

    async fn execute_streamed(
        &self,
        command: &str,
        timeout: Duration,
        sink: &Path,
    ) -> Result<CommandResult, ExecutionError> {
        tracing::debug!("streaming remote command into {:?}: {}", sink, command);
        self.execute_inner(command, timeout, Some(sink)).await
    }
}

/// Run a child process to completion under a deadline. The child is spawned
/// with kill_on_drop so abandoning the wait at the deadline also terminates
/// the subprocess, a timed out ssh client must not keep running and contend
/// the mux channel after its slot is reused.
async fn output_with_deadline(
    mut command: Command,
    deadline: Duration,
) -> Result<std::process::Output, ExecutionError> {
    command.kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|err| ExecutionError::Local(err.to_string()))?;
    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ExecutionError::Local(err.to_string())),
        Err(_) => Err(ExecutionError::Timeout(deadline)),
    }
}

/// Locate the ssh client binary once, the result is cached in the pool for its
/// lifetime. Falls back to the bare name and lets the OS resolve it.
fn find_ssh_executable() -> PathBuf {
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("ssh");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    for candidate in ["/usr/bin/ssh", "/usr/local/bin/ssh", "/bin/ssh"] {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return path;
        }
    }
    PathBuf::from("ssh")
}

fn classify_connect_failure(stderr: &str) -> ExecutionError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        ExecutionError::AuthFailure(stderr.to_string())
    } else {
        ExecutionError::ConnectionRefused(stderr.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;

    fn test_pool(pool_size: usize, acquire_timeout_secs: u64) -> SshPool {
        let settings = SnifferSettings {
            pool_size,
            acquire_timeout_secs,
            ..SnifferSettings::default()
        };
        SshPool::new(settings, EventPublisher::new()).unwrap()
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let pool = test_pool(1, 1);
        // hold the only slot so execute has nothing to acquire
        let held = pool.acquire().await.unwrap();
        let err = pool
            .execute("echo hi", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PoolExhausted(_)));
        pool.release(held);
    }

    #[tokio::test]
    async fn test_released_slot_is_reacquirable() {
        let pool = test_pool(2, 1);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.slot, second.slot);
        pool.release(first);
        let again = pool.acquire().await.unwrap();
        pool.release(second);
        pool.release(again);
    }

    #[tokio::test]
    async fn test_deadline_ends_overrunning_child() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 30");
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let started = Instant::now();
        let err = output_with_deadline(command, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)));
        // the wait returned at the deadline, not at the child's own exit
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_passes_fast_child_through() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo done");
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let output = output_with_deadline(command, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "done");
    }

    #[test]
    fn test_connect_failure_classification() {
        assert!(matches!(
            classify_connect_failure("root@192.168.1.1: Permission denied (publickey)"),
            ExecutionError::AuthFailure(_)
        ));
        assert!(matches!(
            classify_connect_failure("ssh: connect to host 192.168.1.1 port 22: Connection refused"),
            ExecutionError::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_nonzero_exit_error_message() {
        let err = ExecutionError::NonZeroExit {
            status: 1,
            stderr: "no such file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "remote command exited with status 1: no such file"
        );
    }
}
