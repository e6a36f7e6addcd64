//! Kernel process plumbing.
//!
//! Spawns the kernel executable as a subprocess and talks to it over
//! stdin/stdout with newline-delimited envelopes. Each launch is tagged with
//! a generation number so events from a replaced process can be told apart.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use pocketrag_protocol::{Envelope, EnvelopeDecoder};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Environment variable carrying the user-data directory to the kernel.
pub const USERDATA_ENV: &str = "POCKETRAG_USERDATA_PATH";

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to spawn kernel at {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("kernel stdin closed")]
    StdinClosed,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] pocketrag_protocol::CodecError),
}

/// Why a kernel process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host killed it (restart or shutdown). Never treated as a crash.
    Requested,
    /// It exited on its own.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Things a running kernel reports back to the dispatch loop.
#[derive(Debug)]
pub enum KernelEvent {
    Envelope { generation: u64, envelope: Envelope },
    Exited { generation: u64, reason: ExitReason },
}

impl KernelEvent {
    pub fn generation(&self) -> u64 {
        match self {
            KernelEvent::Envelope { generation, .. } | KernelEvent::Exited { generation, .. } => {
                *generation
            }
        }
    }
}

/// Handle to one launched kernel process.
#[derive(Debug)]
pub struct KernelLink {
    generation: u64,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl KernelLink {
    pub fn new(
        generation: u64,
        stdin_tx: mpsc::Sender<String>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            generation,
            stdin_tx,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one encoded line (newline included) for the stdin writer.
    pub async fn write_line(&self, line: String) -> Result<(), KernelError> {
        debug!(
            component = "kernel",
            event = "kernel.stdin.write",
            generation = self.generation,
            payload_len = line.len(),
            "Writing to kernel stdin"
        );
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| KernelError::StdinClosed)
    }

    /// Kill the process. Its exit is reported as `ExitReason::Requested`.
    pub fn kill(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Starts kernel processes. Production code spawns the executable; tests substitute a fake.
pub trait KernelLauncher: Send + Sync {
    fn launch(
        &mut self,
        generation: u64,
        events: mpsc::Sender<KernelEvent>,
    ) -> Result<KernelLink, KernelError>;
}

/// Spawns the kernel executable with piped stdio.
pub struct ProcessLauncher {
    kernel_path: PathBuf,
    user_data_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(kernel_path: PathBuf, user_data_dir: PathBuf) -> Self {
        Self {
            kernel_path,
            user_data_dir,
        }
    }

    /// The kernel runs from its own install directory.
    fn working_dir(&self) -> &Path {
        self.kernel_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl KernelLauncher for ProcessLauncher {
    fn launch(
        &mut self,
        generation: u64,
        events: mpsc::Sender<KernelEvent>,
    ) -> Result<KernelLink, KernelError> {
        info!(
            component = "kernel",
            event = "kernel.spawn",
            generation,
            kernel_path = %self.kernel_path.display(),
            cwd = %self.working_dir().display(),
            "Spawning kernel"
        );

        let mut child = tokio::process::Command::new(&self.kernel_path)
            .current_dir(self.working_dir())
            .env_clear()
            .env(USERDATA_ENV, &self.user_data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| KernelError::Spawn {
                path: self.kernel_path.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(KernelError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(KernelError::MissingPipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "kernel",
                        event = "kernel.stderr",
                        generation,
                        line = %line,
                        "Kernel stderr"
                    );
                }
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(stdin_writer(stdin, stdin_rx, generation));
        tokio::spawn(stdout_reader(stdout, events.clone(), generation));
        tokio::spawn(exit_watcher(child, kill_rx, events, generation));

        Ok(KernelLink::new(generation, stdin_tx, kill_tx))
    }
}

/// Dedicated stdin writer task: reads lines from the channel, writes them to the kernel.
async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>, generation: u64) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "kernel",
                event = "kernel.stdin.write_error",
                generation,
                error = %e,
                "Failed to write to kernel stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "kernel",
                event = "kernel.stdin.flush_error",
                generation,
                error = %e,
                "Failed to flush kernel stdin"
            );
            break;
        }
    }
    debug!(
        component = "kernel",
        event = "kernel.stdin.closed",
        generation,
        "Stdin writer task ended"
    );
}

/// Read stdout in raw chunks and hand every decoded envelope to the dispatch loop in order.
async fn stdout_reader(
    mut stdout: ChildStdout,
    events: mpsc::Sender<KernelEvent>,
    generation: u64,
) {
    let mut decoder = EnvelopeDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(
                    component = "kernel",
                    event = "kernel.stdout.read_error",
                    generation,
                    error = %e,
                    "Error reading kernel stdout"
                );
                break;
            }
        };

        for decoded in decoder.push(&chunk[..read]) {
            match decoded {
                Ok(envelope) => {
                    if events
                        .send(KernelEvent::Envelope {
                            generation,
                            envelope,
                        })
                        .await
                        .is_err()
                    {
                        info!(
                            component = "kernel",
                            event = "kernel.stdout.channel_closed",
                            generation,
                            "Event channel closed, stopping reader"
                        );
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        component = "kernel",
                        event = "kernel.stdout.parse_error",
                        generation,
                        error = %e,
                        line_preview = %e.preview(),
                        "Dropping undecodable kernel line"
                    );
                }
            }
        }
    }

    if let Some(fragment) = decoder.finish() {
        warn!(
            component = "kernel",
            event = "kernel.stdout.truncated",
            generation,
            fragment_len = fragment.len(),
            "Kernel stdout ended mid-line"
        );
    }
    info!(
        component = "kernel",
        event = "kernel.stdout.eof",
        generation,
        "Kernel stdout EOF"
    );
}

/// Wait for the process to exit, or kill it when the host asks.
async fn exit_watcher(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<KernelEvent>,
    generation: u64,
) {
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitReason::Exited {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                error!(
                    component = "kernel",
                    event = "kernel.wait_error",
                    generation,
                    error = %e,
                    "Failed to wait on kernel process"
                );
                ExitReason::Exited { code: None, signal: None }
            }
        },
        // Fires on an explicit kill and when the link is dropped.
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(
                    component = "kernel",
                    event = "kernel.kill_error",
                    generation,
                    error = %e,
                    "Failed to kill kernel process"
                );
            }
            ExitReason::Requested
        }
    };

    info!(
        component = "kernel",
        event = "kernel.exited",
        generation,
        reason = ?reason,
        "Kernel process exited"
    );
    let _ = events.send(KernelEvent::Exited { generation, reason }).await;
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
