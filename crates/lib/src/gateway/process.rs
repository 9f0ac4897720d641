//! Gateway child process: spawn, output capture, graceful terminate, exit notification.
//!
//! One background task owns the `Child` and publishes its exit exactly once through a
//! watch channel. On unix the child leads its own process group, and signals go to the
//! whole group so helpers the gateway started go down with it.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::error::BridgeError;

/// What to run.
#[derive(Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited environment. May contain secrets; never logged.
    pub env: BTreeMap<String, String>,
    pub output_lines: usize,
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("output_lines", &self.output_lines)
            .finish()
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal (unix).
    pub signal: Option<i32>,
    /// True when the exit followed a force-kill issued by [`GatewayProcess::terminate`].
    pub forced: bool,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus, forced: bool) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            forced,
        }
    }

    fn unknown(forced: bool) -> Self {
        Self {
            code: None,
            signal: None,
            forced,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal, self.forced) {
            (_, _, true) => f.write_str("force-killed"),
            (Some(code), _, _) => write!(f, "exit code {}", code),
            (None, Some(sig), _) => write!(f, "killed by signal {}", sig),
            (None, None, _) => f.write_str("unknown exit status"),
        }
    }
}

/// Bounded ring buffer of the child's output lines, for the diagnostics screen.
#[derive(Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&self, line: String) {
        if let Ok(mut buf) = self.lines.lock() {
            buf.push_back(line);
            while buf.len() > self.max_lines {
                buf.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Handle to a spawned gateway.
pub struct GatewayProcess {
    pid: Option<u32>,
    executable: String,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    output: OutputBuffer,
}

impl GatewayProcess {
    /// Spawn the child and start capturing its stdout/stderr. Must run inside a tokio runtime.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, BridgeError> {
        let executable = spec.executable.display().to_string();
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            executable: executable.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        log::info!(
            "spawned gateway {} (pid {}) with args {:?}",
            executable,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            spec.args
        );

        let output = OutputBuffer::new(spec.output_lines);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(stdout, "stdout", output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(stderr, "stderr", output.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(child, pid, kill_rx, exit_tx));

        Ok(Self {
            pid,
            executable,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
            output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Exit info if the child has already exited.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Resolves once, when the child has exited. Every caller sees the same [`ExitInfo`].
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(v) => *v,
            Err(_) => None,
        };
        info.unwrap_or(ExitInfo::unknown(false))
    }

    /// Captured output lines, oldest first.
    pub fn output(&self) -> Vec<String> {
        self.output.snapshot()
    }

    /// Ask the child to exit, wait up to `grace`, then force-kill. No-op once it has exited.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.try_exit() {
            return info;
        }
        if self.request_graceful_exit() {
            if let Ok(info) = tokio::time::timeout(grace, self.wait_exit()).await {
                return info;
            }
            log::warn!(
                "gateway did not exit within {}ms, killing it",
                grace.as_millis()
            );
        }
        self.force_kill();
        self.wait_exit().await
    }

    /// Returns false when no graceful path exists on this platform.
    #[cfg(unix)]
    fn request_graceful_exit(&self) -> bool {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return false };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                log::debug!("sent SIGTERM to gateway process group {}", pid);
                true
            }
            Err(nix::errno::Errno::ESRCH) => {
                log::debug!("gateway process group {} already gone", pid);
                true
            }
            Err(e) => {
                log::warn!("SIGTERM to gateway {} failed: {}", pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_graceful_exit(&self) -> bool {
        false
    }

    fn force_kill(&self) {
        let tx = self.kill_tx.lock().ok().and_then(|mut g| g.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Owns the child until it exits; publishes the exit once.
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let mut forced = false;
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the handle is dropped.
        _ = kill_rx => {
            forced = true;
            kill_group(pid);
            if let Err(e) = child.start_kill() {
                log::debug!("kill gateway: {}", e);
            }
            child.wait().await
        }
    };
    let info = match status {
        Ok(status) => ExitInfo::from_status(status, forced),
        Err(e) => {
            log::warn!("waiting for gateway process failed: {}", e);
            ExitInfo::unknown(forced)
        }
    };
    log::info!(
        "gateway process {} exited: {}",
        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
        info
    );
    exit_tx.send_replace(Some(info));
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn capture_lines<R>(reader: R, stream: &'static str, output: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!(target: "gateway", "{}", line);
                output.push(format!(
                    "{} [{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    stream,
                    line
                ));
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("reading gateway {}: {}", stream, e);
                break;
            }
        }
    }
}
