//! Periodic execution of poll cycles.

use crate::bridge::{Bridge, FolderOutput};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Cooperative shutdown request shared between the signal handler and the worker.
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
        }
    }

    /// Request shutdown and wake up a pending [`Shutdown::wait`].
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            // Buffer of one, the wake up can not block.
            let _ = self.sender.try_send(());
        }
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Block for at most `timeout` or until shutdown is requested. Returns whether shutdown
    /// was requested.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_requested() {
            return true;
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Shutdown channel disconnected");
            }
        }

        self.is_requested()
    }
}

/// Summary of a single cycle.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CycleSummary {
    pub folders_ok: usize,
    pub folders_failed: usize,
    pub notified: usize,
    pub failed_notifications: usize,
}

impl CycleSummary {
    #[must_use]
    pub fn new(outputs: &[FolderOutput]) -> Self {
        outputs
            .iter()
            .fold(Self::default(), |mut summary, output| {
                match &output.result {
                    Ok(report) => {
                        summary.folders_ok += 1;
                        summary.notified += report.notified;
                        summary.failed_notifications += report.failed;
                    }
                    Err(e) => {
                        summary.folders_failed += 1;
                        summary.notified += e.notified();
                    }
                }
                summary
            })
    }
}

/// Runs a poll cycle immediately and then once per interval.
pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run cycles on the calling thread until `shutdown` is requested. Returns the number of
    /// completed cycles.
    ///
    /// The next cycle starts `interval` after the start of the previous one. A cycle which
    /// takes longer than `interval` is completed first and the next one starts right after it.
    pub fn run(&self, bridge: &mut Bridge, shutdown: &Shutdown) -> u64 {
        info!(
            "Checking for new mail every {} seconds",
            self.interval.as_secs()
        );
        let mut cycle = 0_u64;

        while !shutdown.is_requested() {
            cycle += 1;
            let started = Instant::now();
            let summary = info_span!("cycle", cycle).in_scope(|| {
                let outputs = bridge.poll(shutdown);
                CycleSummary::new(&outputs)
            });

            let elapsed = started.elapsed();
            info!(
                "Cycle {cycle} finished in {}ms: {} folders ok, {} failed, {} notifications sent, {} failed",
                elapsed.as_millis(),
                summary.folders_ok,
                summary.folders_failed,
                summary.notified,
                summary.failed_notifications,
            );

            let remaining = self.interval.saturating_sub(elapsed);
            if remaining.is_zero() {
                warn!("Cycle took longer than the check interval");
            }
            debug!("Next cycle in {}s", remaining.as_secs());
            if shutdown.wait(remaining) {
                break;
            }
        }

        info!("Scheduler stopped after {cycle} cycles");
        cycle
    }
}
