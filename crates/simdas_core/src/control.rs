use crate::error::{AnalysisError, JacobianError, SolverError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Returned by [`RunControl::checkpoint`] once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for SolverError {
    fn from(_: Cancelled) -> Self {
        SolverError::Cancelled
    }
}

impl From<Cancelled> for JacobianError {
    fn from(_: Cancelled) -> Self {
        JacobianError::Cancelled
    }
}

impl From<Cancelled> for AnalysisError {
    fn from(_: Cancelled) -> Self {
        AnalysisError::Cancelled
    }
}

#[derive(Debug, Default)]
struct Flags {
    paused: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct Shared {
    flags: Mutex<Flags>,
    changed: Condvar,
    cancelled: AtomicBool,
}

/// Cloneable handle used to pause, resume and cancel a running solve or analysis from
/// another thread.
///
/// Long-running work calls [`RunControl::checkpoint`] at step boundaries; a paused run blocks
/// there on a condition variable until resumed or cancelled.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    shared: Arc<Shared>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.shared
            .flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.flags().paused = true;
    }

    pub fn resume(&self) {
        self.flags().paused = false;
        self.shared.changed.notify_all();
    }

    /// Requests cancellation. Also wakes a paused run so it can observe the request.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.flags().cancelled = true;
        self.shared.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Non-blocking cancellation check for inner loops.
    pub fn ensure_active(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks while paused, then reports whether the run may continue.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        let guard = self.flags();
        let guard = self
            .shared
            .changed
            .wait_while(guard, |flags| flags.paused && !flags.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.cancelled {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn checkpoint_passes_when_running() {
        let control = RunControl::new();
        assert!(control.checkpoint().is_ok());
        assert!(control.ensure_active().is_ok());
        assert!(!control.is_paused());
    }

    #[test]
    fn paused_checkpoint_waits_for_resume() {
        let control = RunControl::new();
        control.pause();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let control = control.clone();
            thread::spawn(move || {
                let result = control.checkpoint();
                tx.send(result).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        control.resume();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        worker.join().unwrap();
    }

    #[test]
    fn cancel_wakes_paused_checkpoint() {
        let control = RunControl::new();
        control.pause();
        let worker = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint())
        };
        thread::sleep(Duration::from_millis(20));
        control.cancel();
        assert_eq!(worker.join().unwrap(), Err(Cancelled));
        assert!(control.is_cancelled());
        assert_eq!(control.ensure_active(), Err(Cancelled));
    }
}
