//! One-shot readiness signal for the current kernel process.

use tokio::sync::oneshot;

/// Closed until the kernel announces `ready`. Each kernel launch gets a fresh
/// gate; callers still waiting on the previous one carry over to it.
#[derive(Debug, Default)]
pub struct ReadyGate {
    generation: u64,
    open: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl ReadyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open the gate and wake every waiter. Returns `false` if it was already open.
    pub fn open(&mut self) -> bool {
        if self.open {
            return false;
        }
        self.open = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    /// Resolves once the gate is open (immediately if it already is).
    pub fn wait(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.open {
            let _ = tx.send(());
        } else {
            self.waiters.push(tx);
        }
        rx
    }

    /// Replace with a closed gate for the next kernel launch.
    pub fn renew(&mut self) {
        let mut waiters = std::mem::take(&mut self.waiters);
        waiters.retain(|w| !w.is_closed());
        *self = ReadyGate {
            generation: self.generation + 1,
            open: false,
            waiters,
        };
    }
}
