//! How a discovery run ends.
//!
//! A session halts for one of two reasons: the event stream drained, or an
//! operator asked it to stop. Both are recorded in a single shared state that
//! every suspension point races against, so a handler blocked on a rate
//! limiter or an I/O permit abandons its work as soon as the verdict lands.

use std::future::Future;

use tokio::sync::watch;

/// Why the session is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The event stream drained and the termination detector saw the engine
    /// idle for a full quiescence window.
    Drained,
    /// An operator or the supervising service requested the stop.
    Stopped,
}

/// Write side of the halt state. The session owns exactly one.
#[derive(Debug)]
pub struct HaltController(watch::Sender<Option<Halt>>);

impl HaltController {
    pub fn new() -> (Self, HaltWatcher) {
        let (tx, rx) = watch::channel(None);
        (Self(tx), HaltWatcher(rx))
    }

    /// Records the halt reason.
    ///
    /// The first verdict sticks, with one exception: a drain can still be
    /// escalated into a stop, since an operator signal must win over a
    /// leisurely wind-down.
    pub fn halt(&self, reason: Halt) {
        self.0.send_if_modified(|state| match state {
            None => {
                *state = Some(reason);
                true
            }
            Some(Halt::Drained) if reason == Halt::Stopped => {
                *state = Some(reason);
                true
            }
            Some(_) => false,
        });
    }
}

/// Read side of the halt state, cloned into tasks and handlers.
#[derive(Debug, Clone)]
pub struct HaltWatcher(watch::Receiver<Option<Halt>>);

impl HaltWatcher {
    /// Resolves with the halt reason, immediately if one is already recorded.
    pub async fn halted(&mut self) -> Halt {
        loop {
            if let Some(reason) = *self.0.borrow_and_update() {
                return reason;
            }

            if self.0.changed().await.is_err() {
                // The session went away without recording a verdict.
                return Halt::Stopped;
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Races `work` against the halt state.
    ///
    /// `Err(reason)` means the work was abandoned at this suspension point;
    /// callers translate that into their own cancellation error.
    pub async fn guard<F>(&mut self, work: F) -> Result<F::Output, Halt>
    where
        F: Future,
    {
        tokio::select! {
            out = work => Ok(out),
            reason = self.halted() => Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_watcher_clone_sees_the_verdict() {
        let (controller, watcher) = HaltController::new();

        let mut clones: Vec<HaltWatcher> = (0..4).map(|_| watcher.clone()).collect();
        drop(watcher);

        controller.halt(Halt::Drained);

        for clone in &mut clones {
            assert_eq!(clone.halted().await, Halt::Drained);
            assert!(clone.is_halted());
        }
    }

    #[tokio::test]
    async fn guard_abandons_pending_work_on_halt() {
        let (controller, mut watcher) = HaltController::new();

        let pending = watcher.guard(std::future::pending::<()>());
        controller.halt(Halt::Stopped);

        assert_eq!(pending.await, Err(Halt::Stopped));
    }

    #[tokio::test]
    async fn guard_passes_through_completed_work() {
        let (_controller, mut watcher) = HaltController::new();

        assert_eq!(watcher.guard(async { 42 }).await, Ok(42));
    }

    #[tokio::test]
    async fn a_stop_overrides_a_drain_but_not_the_reverse() {
        let (controller, mut watcher) = HaltController::new();

        controller.halt(Halt::Drained);
        controller.halt(Halt::Stopped);
        assert_eq!(watcher.halted().await, Halt::Stopped);

        controller.halt(Halt::Drained);
        assert_eq!(watcher.halted().await, Halt::Stopped);
    }

    #[tokio::test]
    async fn a_dropped_session_counts_as_stopped() {
        let (controller, mut watcher) = HaltController::new();
        drop(controller);

        assert_eq!(watcher.halted().await, Halt::Stopped);
    }
}
