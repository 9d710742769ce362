//! Signal handling for graceful shutdown.
//!
//! First SIGINT or SIGTERM: flag shutdown; the supervisor tears down the
//! current generation and the process exits 0. A second signal skips the
//! graceful path: the published child group is force-killed and the process
//! exits 130 immediately.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Receiver side of the shutdown flag, cloneable into every wait the
/// supervisor multiplexes it into.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Flips the shutdown flag the way a real signal would. Test seam; keep it
/// alive for the duration of the run (dropping it never requests shutdown).
#[allow(dead_code)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[allow(dead_code)]
impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Register SIGINT and SIGTERM handlers. Must be called from within the
    /// runtime.
    ///
    /// `child_pid` is the supervisor's published live-child cell (0 when no
    /// child is running); the second-signal path force-kills that group
    /// before exiting.
    pub fn install(child_pid: Arc<AtomicU32>) -> std::io::Result<ShutdownSignal> {
        let (tx, rx) = watch::channel(false);
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down after cleanup")
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down after cleanup")
                }
            }
            let _ = tx.send(true);

            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            let pid = child_pid.load(Ordering::Acquire);
            if pid != 0 {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            eprintln!("Second interrupt. Forcing exit.");
            std::process::exit(130);
        });

        Ok(ShutdownSignal { rx })
    }

    /// Trigger/receiver pair with no OS signal wiring, for tests.
    #[allow(dead_code)]
    pub fn manual() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested; immediately if it already was.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without a request: nothing will ever arrive.
                std::future::pending::<()>().await;
            }
        }
    }
}
