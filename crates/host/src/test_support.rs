//! In-memory kernel for driving the supervisor and dispatch loop in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pocketrag_protocol::{Envelope, Message, MessageKind};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::kernel::{ExitReason, KernelError, KernelEvent, KernelLauncher, KernelLink};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Shared launch counter.
#[derive(Clone, Default)]
pub struct LaunchCount(Arc<AtomicUsize>);

impl LaunchCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    fail: bool,
    launches: LaunchCount,
    kernels_tx: mpsc::UnboundedSender<FakeKernel>,
    kernels_rx: Option<mpsc::UnboundedReceiver<FakeKernel>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        let (kernels_tx, kernels_rx) = mpsc::unbounded_channel();
        Self {
            fail: false,
            launches: LaunchCount::default(),
            kernels_tx,
            kernels_rx: Some(kernels_rx),
        }
    }

    /// Every launch fails as if the executable were missing.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn launch_count(&self) -> LaunchCount {
        self.launches.clone()
    }

    /// Stream of launched kernels. Call once, before handing the launcher away.
    pub fn kernels(&mut self) -> FakeKernels {
        FakeKernels {
            rx: self.kernels_rx.take().expect("kernels() called twice"),
        }
    }
}

impl KernelLauncher for FakeLauncher {
    fn launch(
        &mut self,
        generation: u64,
        events: mpsc::Sender<KernelEvent>,
    ) -> Result<KernelLink, KernelError> {
        self.launches.0.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KernelError::Spawn {
                path: "PocketRAG_kernel".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            });
        }
        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        let (kill_tx, kill_rx) = oneshot::channel();
        let _ = self.kernels_tx.send(FakeKernel {
            generation,
            stdin_rx,
            kill_rx,
            events,
        });
        Ok(KernelLink::new(generation, stdin_tx, kill_tx))
    }
}

pub struct FakeKernels {
    rx: mpsc::UnboundedReceiver<FakeKernel>,
}

impl FakeKernels {
    pub async fn next(&mut self) -> FakeKernel {
        tokio::time::timeout(TIMEOUT, self.rx.recv())
            .await
            .expect("no kernel launched")
            .expect("launcher dropped")
    }

    pub fn try_next(&mut self) -> Option<FakeKernel> {
        self.rx.try_recv().ok()
    }
}

/// The kernel side of one fake launch.
pub struct FakeKernel {
    pub generation: u64,
    stdin_rx: mpsc::Receiver<String>,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<KernelEvent>,
}

impl FakeKernel {
    /// Next envelope the host wrote to this kernel's stdin.
    pub async fn next_envelope(&mut self) -> Envelope {
        let line = tokio::time::timeout(TIMEOUT, self.stdin_rx.recv())
            .await
            .expect("timed out waiting for kernel stdin")
            .expect("kernel stdin closed");
        assert!(line.ends_with('\n'), "envelope line must end with a newline");
        serde_json::from_str(line.trim_end()).expect("host wrote invalid JSON")
    }

    /// Everything written so far, without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(line) = self.stdin_rx.try_recv() {
            out.push(serde_json::from_str(line.trim_end()).expect("host wrote invalid JSON"));
        }
        out
    }

    /// Stop accepting stdin, as if the pipe broke. Later host writes fail.
    pub fn close_stdin(&mut self) {
        self.stdin_rx.close();
    }

    pub async fn send(&self, envelope: Envelope) {
        self.events
            .send(KernelEvent::Envelope {
                generation: self.generation,
                envelope,
            })
            .await
            .expect("event channel closed");
    }

    pub async fn announce_ready(&self) {
        self.send(ready_envelope()).await;
    }

    pub async fn exit(&self, code: i32) {
        self.events
            .send(KernelEvent::Exited {
                generation: self.generation,
                reason: ExitReason::Exited {
                    code: Some(code),
                    signal: None,
                },
            })
            .await
            .expect("event channel closed");
    }

    /// Report an exit the host asked for.
    pub async fn exit_requested(&self) {
        self.events
            .send(KernelEvent::Exited {
                generation: self.generation,
                reason: ExitReason::Requested,
            })
            .await
            .expect("event channel closed");
    }

    /// True once the host killed this kernel or released its link.
    pub fn was_killed(&mut self) -> bool {
        !matches!(
            self.kill_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

pub fn ready_envelope() -> Envelope {
    Envelope::global_request(0, Message::new(MessageKind::Ready))
}

/// A successful global reply to `request`, carrying `data`.
pub fn global_reply(request: &Envelope, data: serde_json::Value) -> Envelope {
    let mut reply = request.acknowledge();
    reply.extra.insert("data".into(), data);
    reply
}

/// A failed global reply to `request`.
pub fn global_error(request: &Envelope, code: &str, message: &str) -> Envelope {
    let mut reply = request.acknowledge();
    reply.status = Some(pocketrag_protocol::Status::error(code, message));
    reply.extra.insert("data".into(), json!({}));
    reply
}
