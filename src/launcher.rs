use crate::config::RuntimeConfig;
use crate::error::LaunchError;
use crate::ipc::{self, ReadyMessage, ReadySignal, RestartCallback};
use crate::logs::{relay_output, LogSinks, LogStream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Settings for starting the functions runtime
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Working directory (default: inherited)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// How long to wait for the readiness message
    pub start_timeout: Duration,
    /// Relay the runtime's stdout/stderr to ours
    pub show_logs: bool,
    /// Where relayed output goes when `show_logs` is set
    pub log_sinks: LogSinks,
}

impl LauncherConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            start_timeout: Duration::from_millis(3000),
            show_logs: false,
            log_sinks: LogSinks::default(),
        }
    }

    /// Build from the runtime section of the plugin options
    pub fn from_runtime(runtime: &RuntimeConfig, show_logs: bool) -> Result<Self, LaunchError> {
        let (program, args) = runtime
            .program_and_args()
            .map_err(LaunchError::InvalidCommand)?;

        Ok(Self {
            program,
            args,
            working_dir: runtime.working_dir.as_ref().map(PathBuf::from),
            env: runtime.env.clone(),
            start_timeout: runtime.start_timeout(),
            show_logs,
            log_sinks: LogSinks::default(),
        })
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_logs(mut self, show_logs: bool) -> Self {
        self.show_logs = show_logs;
        self
    }

    pub fn with_log_sinks(mut self, sinks: LogSinks) -> Self {
        self.log_sinks = sinks;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Result of one launch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The runtime is accepting HTTP traffic at `url`
    Ready { url: String },
    /// The runtime could not be started or never reported in
    Failed { error_message: String },
}

impl LaunchOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            LaunchOutcome::Ready { url } => Some(url),
            LaunchOutcome::Failed { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            LaunchOutcome::Ready { .. } => None,
            LaunchOutcome::Failed { error_message } => Some(error_message),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LaunchOutcome::Ready { .. })
    }
}

impl From<Result<ReadyMessage, LaunchError>> for LaunchOutcome {
    fn from(result: Result<ReadyMessage, LaunchError>) -> Self {
        match result {
            Ok(ready) => LaunchOutcome::Ready { url: ready.url() },
            Err(e) => LaunchOutcome::Failed {
                error_message: e.to_string(),
            },
        }
    }
}

/// What `launch` hands back: the outcome and, if the process was spawned, its handle.
///
/// The handle is returned even when the outcome is a failure: a runtime that
/// reports in after the deadline keeps running and its restart notifications
/// keep firing until the handle is shut down or dropped.
pub struct Launch {
    pub outcome: LaunchOutcome,
    pub process: Option<RuntimeProcess>,
}

/// Handle to the spawned runtime.
///
/// The `Child` itself lives in a supervisor task that waits for it to exit. The
/// handle keeps a kill channel to that task; dropping the handle kills the runtime.
pub struct RuntimeProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl RuntimeProcess {
    fn supervise(child: Child, program: String) -> Self {
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(Self::wait_for_exit(
            child,
            program,
            kill_rx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
        }
    }

    async fn wait_for_exit(
        mut child: Child,
        program: String,
        kill_rx: oneshot::Receiver<()>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        tokio::select! {
            result = child.wait() => match result {
                Ok(status) => info!(%program, ?status, "Functions runtime exited"),
                Err(e) => error!(%program, error = %e, "Error waiting for functions runtime"),
            },
            _ = kill_rx => {
                debug!(%program, "Stopping functions runtime");
                if let Err(e) = child.kill().await {
                    warn!(%program, error = %e, "Failed to kill functions runtime");
                }
            }
        }

        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Kill the runtime and wait until it is gone
    pub async fn shutdown(&mut self) {
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return;
        }
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        notified.await;
    }
}

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

/// Starts the functions runtime and performs the readiness handshake
pub struct RuntimeLauncher {
    config: LauncherConfig,
}

impl RuntimeLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Spawn the runtime and wait for its readiness message or the start timeout,
    /// whichever comes first.
    ///
    /// Completes exactly once. Every message after the first calls `on_restart`,
    /// for as long as the runtime keeps its channel open. No retries: a failed
    /// launch is reported once and the caller decides how to degrade.
    pub async fn launch<F>(&self, on_restart: F) -> Launch
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (process, ready_rx) = match self.spawn(Arc::new(on_restart)) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(program = %self.config.program, error = %e, "Failed to start functions runtime");
                return Launch {
                    outcome: LaunchOutcome::from(Err::<ReadyMessage, _>(e)),
                    process: None,
                };
            }
        };

        let result = self.await_ready(ready_rx).await;
        match &result {
            Ok(ready) => info!(url = %ready.url(), pid = ?process.pid(), "Functions runtime is ready"),
            Err(e) => warn!(program = %self.config.program, error = %e, "Functions runtime did not become ready"),
        }

        Launch {
            outcome: result.into(),
            process: Some(process),
        }
    }

    async fn await_ready(
        &self,
        ready_rx: oneshot::Receiver<ReadySignal>,
    ) -> Result<ReadyMessage, LaunchError> {
        let program = self.config.program.clone();
        match tokio::time::timeout(self.config.start_timeout, ready_rx).await {
            Ok(Ok(Ok(ready))) => Ok(ready),
            Ok(Ok(Err(reason))) => Err(LaunchError::MalformedReadiness { program, reason }),
            Ok(Err(_)) => Err(LaunchError::ChannelClosed { program }),
            Err(_) => Err(LaunchError::Timeout {
                program,
                timeout: self.config.start_timeout,
            }),
        }
    }

    #[cfg(unix)]
    fn spawn(
        &self,
        on_restart: RestartCallback,
    ) -> Result<(RuntimeProcess, oneshot::Receiver<ReadySignal>), LaunchError> {
        let config = &self.config;
        let (parent_end, child_end) = ipc::channel().map_err(LaunchError::Channel)?;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if config.show_logs {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        child_end.attach(&mut cmd);

        info!(program = %config.program, args = ?config.args, "Starting functions runtime");

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        // Only the child may hold this end, or the channel never reports EOF
        drop(child_end);

        debug!(pid = ?child.id(), "Functions runtime spawned");

        if config.show_logs {
            if let Some(stdout) = child.stdout.take() {
                let sink = config.log_sinks.writer(LogStream::Stdout);
                tokio::spawn(async move {
                    if let Err(e) = relay_output(stdout, sink, LogStream::Stdout).await {
                        debug!(error = %e, "Stopped relaying runtime stdout");
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let sink = config.log_sinks.writer(LogStream::Stderr);
                tokio::spawn(async move {
                    if let Err(e) = relay_output(stderr, sink, LogStream::Stderr).await {
                        debug!(error = %e, "Stopped relaying runtime stderr");
                    }
                });
            }
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(ipc::listen(parent_end, ready_tx, on_restart));

        let process = RuntimeProcess::supervise(child, config.program.clone());
        Ok((process, ready_rx))
    }

    #[cfg(not(unix))]
    fn spawn(
        &self,
        _on_restart: RestartCallback,
    ) -> Result<(RuntimeProcess, oneshot::Receiver<ReadySignal>), LaunchError> {
        Err(LaunchError::UnsupportedPlatform)
    }
}
