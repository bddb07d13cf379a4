//! Lifecycle of the frontend dev server process
//!
//! The supervisor spawns the configured command, drains its stdout/stderr into
//! a bounded buffer for diagnostics, waits until the advertised URL accepts
//! connections and records that URL in the hotfile. At most one child exists
//! per supervisor: concurrent `start()` calls are serialised and reuse the
//! live handle, and a live server already recorded in the hotfile is adopted
//! instead of spawning a second one.

use crate::config::{connect_host, DevServerConfig};
use crate::error::StartupError;
use crate::hotfile::HotFileStore;
use crate::tunnel::upstream_origin;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between readiness checks during startup (in milliseconds)
const READY_POLL_INTERVAL_MS: u64 = 50;

/// How long to wait for output readers after the child exited
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded ring buffer of the most recent output lines
#[derive(Debug)]
pub struct OutputBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of the buffered lines, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// A dev server known to the supervisor
#[derive(Debug)]
pub struct DevServerHandle {
    pid: Option<u32>,
    url: String,
    command: String,
    working_dir: Option<PathBuf>,
    started_at: DateTime<Utc>,
    output: Arc<OutputBuffer>,
    exit_code: Mutex<Option<i32>>,
    /// False for servers discovered through the hotfile
    owned: bool,
    child: Mutex<Option<Child>>,
}

impl DevServerHandle {
    fn adopted(url: String, command: String) -> Self {
        Self {
            pid: None,
            url,
            command,
            working_dir: None,
            started_at: Utc::now(),
            output: Arc::new(OutputBuffer::new(1)),
            exit_code: Mutex::new(None),
            owned: false,
            child: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last captured output lines (stdout and stderr interleaved)
    pub fn output(&self) -> Vec<String> {
        self.output.snapshot()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Whether this process spawned the server
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

/// Spawns, watches and stops the dev server
pub struct DevServerSupervisor {
    config: DevServerConfig,
    hotfile: HotFileStore,
    current: Mutex<Option<Arc<DevServerHandle>>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl DevServerSupervisor {
    pub fn new(config: DevServerConfig, hotfile: HotFileStore) -> Self {
        Self {
            config,
            hotfile,
            current: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DevServerConfig {
        &self.config
    }

    /// The handle currently held, if any
    pub fn current(&self) -> Option<Arc<DevServerHandle>> {
        self.current.lock().clone()
    }

    /// Start the dev server, or return the one already running.
    ///
    /// A live handle held by this supervisor is returned as is. Otherwise a
    /// live server recorded in the hotfile is adopted. Only when neither exists
    /// is a new child spawned.
    pub async fn start(&self) -> Result<Arc<DevServerHandle>, StartupError> {
        let _guard = self.start_lock.lock().await;

        if let Some(handle) = self.current() {
            if self.is_alive(&handle).await {
                debug!(url = %handle.url, "Dev server already running");
                return Ok(handle);
            }
            warn!(
                url = %handle.url,
                exit_code = ?handle.exit_code(),
                "Dev server is gone, starting a new one"
            );
            *self.current.lock() = None;
        }

        if let Some(url) = self.hotfile.read_live().await? {
            info!(
                url = %url,
                hotfile = %self.hotfile.path().display(),
                "Adopting running dev server"
            );
            let command = self.config.command.clone().unwrap_or_default();
            let handle = Arc::new(DevServerHandle::adopted(url, command));
            *self.current.lock() = Some(Arc::clone(&handle));
            return Ok(handle);
        }

        let handle = Arc::new(self.spawn().await?);
        self.hotfile.write(&handle.url)?;
        info!(
            url = %handle.url,
            pid = ?handle.pid,
            hotfile = %self.hotfile.path().display(),
            "Dev server ready"
        );
        *self.current.lock() = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Check whether the server behind `handle` is still running
    pub async fn is_alive(&self, handle: &DevServerHandle) -> bool {
        if !handle.owned {
            return self.hotfile.probe(&handle.url).await;
        }

        let mut child = handle.child.lock();
        let Some(process) = child.as_mut() else {
            return false;
        };
        match process.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                *handle.exit_code.lock() = status.code();
                *child = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll dev server process");
                false
            }
        }
    }

    /// Stop the server behind `handle` and clear its hotfile record.
    ///
    /// Adopted servers are only released; they belong to someone else.
    pub async fn stop(&self, handle: &DevServerHandle) {
        {
            let mut current = self.current.lock();
            if current
                .as_ref()
                .is_some_and(|c| std::ptr::eq(c.as_ref(), handle))
            {
                *current = None;
            }
        }

        if !handle.owned {
            info!(url = %handle.url, "Releasing adopted dev server");
            return;
        }

        let child = handle.child.lock().take();
        if let Some(mut child) = child {
            let code = terminate(&mut child, self.config.shutdown_grace_period()).await;
            *handle.exit_code.lock() = code;
        }

        // Another server may have replaced the record meanwhile
        match self.hotfile.read() {
            Ok(Some(url)) if url != handle.url => {
                debug!(recorded = %url, "Hotfile points elsewhere, leaving it");
            }
            _ => {
                if let Err(e) = self.hotfile.clear() {
                    error!(error = %e, "Failed to clear hotfile");
                }
            }
        }
    }

    /// Stop whatever handle is currently held
    pub async fn stop_current(&self) {
        if let Some(handle) = self.current() {
            self.stop(&handle).await;
        }
    }

    async fn spawn(&self) -> Result<DevServerHandle, StartupError> {
        let command_line = self
            .config
            .command
            .clone()
            .ok_or(StartupError::MissingCommand)?;
        let argv = shell_words::split(&command_line).map_err(|e| StartupError::InvalidCommand {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(StartupError::InvalidCommand {
                command: command_line,
                reason: "empty command".to_string(),
            });
        };

        info!(
            command = %command_line,
            working_dir = ?self.config.working_dir,
            "Starting dev server"
        );

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in child_env(&self.config) {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| StartupError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();
        let started_at = Utc::now();
        debug!(pid = ?pid, "Dev server process spawned");

        let output = Arc::new(OutputBuffer::new(self.config.output_lines));
        let (url_tx, url_rx) = watch::channel(self.config.explicit_url());
        let url_tx = Arc::new(url_tx);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_output(
                stdout,
                "stdout",
                Arc::clone(&output),
                Arc::clone(&url_tx),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_output(
                stderr,
                "stderr",
                Arc::clone(&output),
                Arc::clone(&url_tx),
            )));
        }

        let url = match self.wait_ready(&mut child, url_rx).await {
            Ok(url) => url,
            Err(Failure::Exited(code)) => {
                flush_readers(readers).await;
                return Err(StartupError::Exited {
                    command: command_line,
                    exit_code: code,
                    output: output.snapshot(),
                });
            }
            Err(Failure::TimedOut) => {
                let _ = child.kill().await;
                flush_readers(readers).await;
                return Err(StartupError::Timeout {
                    command: command_line,
                    timeout: self.config.startup_timeout(),
                    output: output.snapshot(),
                });
            }
        };

        Ok(DevServerHandle {
            pid,
            url,
            command: command_line,
            working_dir: self.config.working_dir.as_ref().map(PathBuf::from),
            started_at,
            output,
            exit_code: Mutex::new(None),
            owned: true,
            child: Mutex::new(Some(child)),
        })
    }

    /// Poll until the URL is known, answers, and the grace window has passed
    async fn wait_ready(
        &self,
        child: &mut Child,
        url_rx: watch::Receiver<Option<String>>,
    ) -> Result<String, Failure> {
        let started = Instant::now();
        let timeout = self.config.startup_timeout();
        let grace = self.config.startup_grace();
        let mut ready_url: Option<String> = None;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(exit_code = ?status.code(), "Dev server exited during startup");
                    return Err(Failure::Exited(status.code()));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to poll dev server process");
                    return Err(Failure::Exited(None));
                }
            }

            if ready_url.is_none() {
                let candidate = url_rx.borrow().clone();
                if let Some(url) = candidate {
                    if self.hotfile.probe(&url).await {
                        debug!(
                            url = %url,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Dev server accepting connections"
                        );
                        ready_url = Some(url);
                    }
                }
            }

            if let Some(ref url) = ready_url {
                if started.elapsed() >= grace {
                    return Ok(url.clone());
                }
            }

            if started.elapsed() > timeout {
                return Err(Failure::TimedOut);
            }

            tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
        }
    }
}

enum Failure {
    Exited(Option<i32>),
    TimedOut,
}

/// Environment passed to the child on top of the inherited one
fn child_env(config: &DevServerConfig) -> HashMap<String, String> {
    let mut env = config.env.clone();
    if let Some(ref host) = config.host {
        env.insert("VITE_HOST".to_string(), host.clone());
    }
    if let Some(port) = config.port {
        env.insert("VITE_PORT".to_string(), port.to_string());
    }
    env
}

/// SIGTERM, wait for the grace period, then SIGKILL. Returns the exit code.
async fn terminate(child: &mut Child, grace_period: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to dev server");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Dev server exited");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for dev server to exit");
            None
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            None
        }
    }
}

async fn flush_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, reader).await;
    }
}

/// Drain one pipe for the lifetime of the process
async fn capture_output<R>(
    reader: R,
    stream: &'static str,
    output: Arc<OutputBuffer>,
    url_tx: Arc<watch::Sender<Option<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(target: "assetgate::devserver", stream, error = %e, "Output stream closed");
                break;
            }
        }

        let line = clean_line(&buf);
        debug!(target: "assetgate::devserver", stream, "{}", line);

        if let Some(url) = discover_url(&line) {
            url_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(url);
                    true
                } else {
                    false
                }
            });
        }
        output.push(line);
    }
}

/// Decode one raw output line and drop colour codes
fn clean_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    strip_ansi_escapes::strip_str(line.trim_end())
}

/// Extract the server origin from a "Local: http://..." startup line.
///
/// Only `scheme://authority` is kept; a base path the server prints is
/// already part of every request routed to it.
pub fn discover_url(line: &str) -> Option<String> {
    if !line.to_ascii_lowercase().contains("local") {
        return None;
    }
    let start = line.find("http://").or_else(|| line.find("https://"))?;
    let url = line[start..].split_whitespace().next()?;
    let (scheme, rest) = upstream_origin(url).split_once("://")?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme, loopback_authority(rest)))
}

fn loopback_authority(authority: &str) -> String {
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}:{}", connect_host(host), port)
        }
        _ => connect_host(authority).to_string(),
    }
}
