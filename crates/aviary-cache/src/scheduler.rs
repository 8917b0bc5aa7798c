//! Verification scheduling
//!
//! Passes must not overlap. The scheduler owns the running flag and can
//! start a pass automatically whenever connectivity comes back.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::verify::{IntegrityVerifier, VerificationProgress, VerificationSummary};

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs verification passes one at a time
#[derive(Debug)]
pub struct RepairScheduler {
    verifier: IntegrityVerifier,
    running: AtomicBool,
    last_summary: Mutex<Option<VerificationSummary>>,
}

impl RepairScheduler {
    /// Scheduler for `verifier`
    pub fn new(verifier: IntegrityVerifier) -> Self {
        Self {
            verifier,
            running: AtomicBool::new(false),
            last_summary: Mutex::new(None),
        }
    }

    /// Whether a pass is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Summary of the most recent successful pass
    pub fn last_summary(&self) -> Option<VerificationSummary> {
        *self.last_summary.lock()
    }

    /// Run a pass unless one is already in progress
    ///
    /// Returns `None` without doing anything when a pass is running.
    pub async fn try_run<F>(&self, on_progress: F) -> Option<Result<VerificationSummary>>
    where
        F: FnMut(&VerificationProgress) + Send,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Verification already running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let result = self.verifier.verify(on_progress).await;
        if let Ok(summary) = &result {
            *self.last_summary.lock() = Some(*summary);
        }
        Some(result)
    }

    /// Start a pass on every offline to online transition
    ///
    /// The baseline is the status at the time of the call, so a change made
    /// right after this returns still counts as a transition. The task ends
    /// when the connectivity source is dropped.
    pub fn watch_connectivity(
        self: Arc<Self>,
        connectivity: Arc<dyn Connectivity>,
    ) -> JoinHandle<()> {
        let mut status = connectivity.subscribe();
        let mut was_online = *status.borrow_and_update();

        tokio::spawn(async move {

            while status.changed().await.is_ok() {
                let online = *status.borrow_and_update();
                if online && !was_online {
                    tracing::info!("Connectivity restored, starting repair pass");
                    match self.try_run(|_| {}).await {
                        None => {}
                        Some(Ok(summary)) => tracing::info!(
                            "Repair pass finished: {} repaired, {} still missing",
                            summary.repaired,
                            summary.missing
                        ),
                        Some(Err(e)) => tracing::warn!("Repair pass failed: {}", e),
                    }
                }
                was_online = online;
            }
        })
    }
}
