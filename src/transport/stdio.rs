//! Child-process transport.
//!
//! Spawns an MCP server and speaks line-delimited JSON over its stdio: one
//! JSON object per line on stdin, one per line on stdout. Anything on stdout
//! that is not a JSON object is treated as server log output and skipped.
//! stderr is forwarded to the log at debug level.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{StatsCell, Transport, TransportEvent, TransportStats};
use crate::errors::RouterError;
use crate::events::EventNotifier;

/// Address prefix for child-process servers: `stdio:<program> [args...]`.
pub const STDIO_SCHEME: &str = "stdio";

/// How long `disconnect` waits for the child to exit after stdin closes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Command ─────────────────────────────────────────────────────────────────

/// What to run for a child-process server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl StdioCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Parse `stdio:<program> [args...]` (`stdio://` is accepted too).
    ///
    /// Arguments are split on whitespace; there is no quoting. Returns
    /// `None` if the address is not a stdio address or names no program.
    pub fn from_address(address: &str) -> Option<Self> {
        let rest = address
            .strip_prefix(STDIO_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let mut words = rest.split_whitespace();
        let program = words.next()?;
        Some(Self {
            args: words.map(str::to_string).collect(),
            ..Self::new(program)
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        // Windows: no console window for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// [`Transport`] over a spawned child process.
///
/// `connect` spawns the process; `disconnect` closes its stdin, waits for it
/// to exit and kills it if it does not. The process exiting on its own is
/// an unexpected close. There is no reconnect.
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    label: String,
    command: StdioCommand,
    max_message_size: usize,
    /// Outbound lines for the stdin writer task.
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    closing: AtomicBool,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    events: EventNotifier<TransportEvent>,
    stats: StatsCell,
    lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StdioTransport {
    pub fn new(command: StdioCommand, max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(StdioInner {
                label: format!("{STDIO_SCHEME}://{}", command.program),
                command,
                max_message_size,
                writer: Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                subscriber: Mutex::new(None),
                events: EventNotifier::new(),
                stats: StatsCell::default(),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        inner.closing.store(false, Ordering::SeqCst);

        let spawn_error = |reason: String| {
            inner.stats.record_error();
            RouterError::connection(inner.label.clone(), reason)
        };
        let mut child = inner
            .command
            .command()
            .spawn()
            .map_err(|e| spawn_error(format!("failed to spawn '{}': {e}", inner.command.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&inner.writer) = Some(tx);
        *inner.child.lock().await = Some(child);
        inner.connected.store(true, Ordering::SeqCst);
        inner.stats.mark_connected();
        inner.events.emit(TransportEvent::Connected);

        let mut tasks = vec![
            tokio::spawn(write_lines(inner.clone(), stdin, rx)),
            tokio::spawn(read_lines(inner.clone(), stdout)),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(inner.label.clone(), stderr)));
        }
        *lock(&inner.tasks) = tasks;

        tracing::info!(transport = %inner.label, pid, "server process started");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        let _guard = inner.lifecycle.lock().await;

        let was_connected = inner.connected.swap(false, Ordering::SeqCst);
        // Closing the writer closes the child's stdin.
        lock(&inner.writer).take();
        lock(&inner.subscriber).take();

        let child = inner.child.lock().await.take();
        if let Some(child) = child {
            inner.stop(child).await;
        }
        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in tasks {
            task.abort();
        }

        if was_connected {
            inner.stats.mark_disconnected();
            inner
                .events
                .emit(TransportEvent::Disconnected { graceful: true });
            tracing::info!(transport = %inner.label, "server process stopped");
        }
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<(), RouterError> {
        let inner = &self.inner;
        let mut line = serde_json::to_string(&message)?;
        if line.len() > inner.max_message_size {
            return Err(RouterError::InvalidRequest {
                reason: format!(
                    "message of {} bytes exceeds limit of {} bytes",
                    line.len(),
                    inner.max_message_size
                ),
            });
        }

        let bytes = line.len();
        line.push('\n');
        let writer = lock(&inner.writer).clone();
        let Some(writer) = writer else {
            return Err(RouterError::NotConnected {
                target: inner.label.clone(),
            });
        };
        writer.send(line).map_err(|_| {
            inner.stats.record_error();
            RouterError::connection(inner.label.clone(), "server stdin closed")
        })?;
        inner.stats.record_sent(bytes);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.subscriber) = Some(tx);
        rx
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    fn describe(&self) -> String {
        self.inner.label.clone()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        lock(&self.inner.writer).take();
        // The child is killed when the last reference to it goes.
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

// ─── Process Tasks ───────────────────────────────────────────────────────────

impl StdioInner {
    /// Parse one stdout line and hand it to the subscriber.
    fn deliver(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.len() > self.max_message_size {
            self.stats.record_error();
            tracing::warn!(
                transport = %self.label,
                size = trimmed.len(),
                limit = self.max_message_size,
                "dropping oversized line from server"
            );
            return;
        }
        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => value,
            _ => {
                // Not a message, could be server log output.
                tracing::debug!(transport = %self.label, line = %trimmed, "skipping non-message output");
                return;
            }
        };
        self.stats.record_received(trimmed.len());
        match lock(&self.subscriber).as_ref() {
            Some(tx) if tx.send(value).is_ok() => {}
            _ => tracing::debug!(transport = %self.label, "no subscriber, message dropped"),
        }
    }

    /// Close stdin, give the child `SHUTDOWN_TIMEOUT` to exit, then kill it.
    async fn stop(&self, mut child: Child) {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(transport = %self.label, %status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(transport = %self.label, error = %e, "failed to wait for server process");
                let _ = child.kill().await;
            }
            Err(_) => {
                tracing::warn!(transport = %self.label, "server process did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }

    /// Bookkeeping after stdout closed without a local disconnect.
    async fn on_exit(&self, reason: String) {
        if self.closing.load(Ordering::SeqCst) || !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.writer).take();
        // Ends the inbound stream.
        lock(&self.subscriber).take();
        self.stats.mark_disconnected();
        tracing::warn!(transport = %self.label, reason = %reason, "server process went away");
        self.events
            .emit(TransportEvent::Disconnected { graceful: false });

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            self.stop(child).await;
        }
    }
}

async fn write_lines(
    inner: Arc<StdioInner>,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        let written: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            inner.stats.record_error();
            tracing::warn!(transport = %inner.label, error = %e, "failed to write to server stdin");
            break;
        }
    }
}

async fn read_lines(inner: Arc<StdioInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => inner.deliver(&line),
            Ok(None) => break "server stdout closed (process may have exited)".to_string(),
            Err(e) => {
                inner.stats.record_error();
                break format!("failed to read from stdout: {e}");
            }
        }
    };
    inner.on_exit(reason).await;
}

async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(transport = %label, "stderr: {line}");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
