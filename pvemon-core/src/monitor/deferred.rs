//! Sessions whose teardown failed.
//!
//! A `qm monitor` process that does not exit on close is parked here and
//! retried once per collection pass. Sessions stuck for longer than the
//! grace period are reported as a single error for the pass, but stay in the
//! registry and keep being retried.

use super::{SessionHandle, VmId};
use crate::error::{PvemonError, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct DeferredSession {
    pub handle: Box<dyn SessionHandle>,
    pub failed_at: Instant,
}

impl DeferredSession {
    pub fn vmid(&self) -> &VmId {
        self.handle.vmid()
    }
}

pub struct DeferredCloseRegistry {
    entries: Mutex<Vec<DeferredSession>>,
    close_timeout: Duration,
}

impl DeferredCloseRegistry {
    pub fn new(close_timeout: Duration) -> Self {
        Self { entries: Mutex::new(Vec::new()), close_timeout }
    }

    pub fn defer(&self, handle: Box<dyn SessionHandle>) {
        warn!(vm_id = %handle.vmid(), "monitor session did not terminate, deferring close");
        let entry = DeferredSession { handle, failed_at: Instant::now() };
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// VM ids with a pending close, in deferral order.
    pub fn pending(&self) -> Vec<VmId> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|entry| entry.vmid().clone()).collect()
    }

    /// Try to close every parked session once.
    ///
    /// Returns the number of sessions closed. Fails with
    /// [`PvemonError::UnterminatedSessions`] when at least one session older
    /// than `grace` is still open. Entries are taken out of the lock while
    /// closing, so `defer` is never blocked on process I/O.
    pub async fn retry_all(&self, grace: Duration) -> Result<usize> {
        let taken = std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()));
        if taken.is_empty() {
            return Ok(0);
        }

        let mut closed = 0;
        let mut survivors = Vec::new();
        let mut escalated = Vec::new();
        for mut entry in taken {
            match entry.handle.close(self.close_timeout).await {
                Ok(()) => {
                    info!(vm_id = %entry.vmid(), "deferred monitor session closed");
                    closed += 1;
                }
                Err(e) => {
                    let age = entry.failed_at.elapsed();
                    if age > grace {
                        warn!(vm_id = %entry.vmid(), ?age, error = %e, "monitor session exceeded close grace period");
                        escalated.push(entry.vmid().to_string());
                    } else {
                        debug!(vm_id = %entry.vmid(), ?age, error = %e, "deferred close still pending");
                    }
                    survivors.push(entry);
                }
            }
        }

        self.entries.lock().unwrap_or_else(|e| e.into_inner()).extend(survivors);

        if escalated.is_empty() {
            Ok(closed)
        } else {
            Err(PvemonError::UnterminatedSessions { count: escalated.len(), grace, vmids: escalated })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` close attempts, then succeeds.
    struct FlakySession {
        vmid: VmId,
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionHandle for FlakySession {
        fn vmid(&self) -> &VmId {
            &self.vmid
        }

        async fn close(&mut self, _timeout: Duration) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(PvemonError::TeardownFailure {
                    vmid: self.vmid.to_string(),
                    reason: "still running".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn flaky(vmid: &str, failures: usize) -> (Box<FlakySession>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let session = FlakySession { vmid: VmId::from(vmid), failures, attempts: attempts.clone() };
        (Box::new(session), attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_within_grace_reports_nothing() {
        let registry = DeferredCloseRegistry::new(Duration::from_secs(5));
        let (session, attempts) = flaky("100", 1);
        registry.defer(session);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.retry_all(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(registry.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.retry_all(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(registry.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sessions_escalate_once_and_are_kept() {
        let registry = DeferredCloseRegistry::new(Duration::from_secs(5));
        let (stuck_a, _) = flaky("100", usize::MAX);
        let (stuck_b, _) = flaky("101", usize::MAX);
        registry.defer(stuck_a);
        registry.defer(stuck_b);

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = registry.retry_all(Duration::from_secs(60)).await.unwrap_err();
        match err {
            PvemonError::UnterminatedSessions { count, vmids, .. } => {
                assert_eq!(count, 2);
                assert_eq!(vmids, vec!["100".to_string(), "101".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(registry.pending(), vec![VmId::from("100"), VmId::from("101")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_sessions_past_grace_escalate() {
        let registry = DeferredCloseRegistry::new(Duration::from_secs(5));
        let (old, _) = flaky("100", usize::MAX);
        registry.defer(old);
        tokio::time::advance(Duration::from_secs(90)).await;
        let (young, _) = flaky("101", usize::MAX);
        registry.defer(young);

        let err = registry.retry_all(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, PvemonError::UnterminatedSessions { count: 1, .. }));
        assert_eq!(registry.len(), 2);
    }
}
