//! Execution phase tracking and cooperative stop.
//!
//! The gate brackets every user-code invocation. A stop request only takes
//! effect while user code is running; outside an invocation it is dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LoadingClasses,
    Invoking,
    /// Stop requested; user code has not yet observed it.
    AwaitingStop,
}

#[derive(Debug)]
pub struct ExecutionGate {
    phase: Mutex<Phase>,
}

impl Default for ExecutionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        *self.lock()
    }

    /// Enter the loading phase until the guard drops.
    pub fn loading(&self) -> PhaseGuard<'_> {
        *self.lock() = Phase::LoadingClasses;
        PhaseGuard { gate: self }
    }

    /// Mark entry into user code. Call [`UserCodeGuard::finish`] on exit.
    pub fn enter_user_code(&self) -> UserCodeGuard<'_> {
        *self.lock() = Phase::Invoking;
        UserCodeGuard {
            gate: self,
            finished: false,
        }
    }

    /// Atomically check for running user code and flag it to stop.
    ///
    /// Returns false, with no effect, when no user code is running.
    pub fn request_stop(&self) -> bool {
        let mut phase = self.lock();
        match *phase {
            Phase::Invoking => {
                *phase = Phase::AwaitingStop;
                true
            }
            Phase::AwaitingStop => true,
            Phase::Idle | Phase::LoadingClasses => false,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.phase() == Phase::AwaitingStop
    }
}

/// Returns the gate to idle on drop.
pub struct PhaseGuard<'a> {
    gate: &'a ExecutionGate,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.gate.lock() = Phase::Idle;
    }
}

/// Brackets one user-code invocation. Dropping without `finish` (a panic)
/// still returns the gate to idle.
pub struct UserCodeGuard<'a> {
    gate: &'a ExecutionGate,
    finished: bool,
}

impl UserCodeGuard<'_> {
    /// Leave user code; true if a stop was requested during the call.
    pub fn finish(mut self) -> bool {
        self.finished = true;
        let mut phase = self.gate.lock();
        let stopped = *phase == Phase::AwaitingStop;
        *phase = Phase::Idle;
        stopped
    }
}

impl Drop for UserCodeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.gate.lock() = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_outside_user_code_is_dropped() {
        let gate = ExecutionGate::new();
        assert!(!gate.request_stop());
        assert_eq!(gate.phase(), Phase::Idle);

        // Not queued for the next invocation.
        let call = gate.enter_user_code();
        assert!(!gate.stop_requested());
        assert!(!call.finish());
    }

    #[test]
    fn stop_during_user_code_is_observed_at_exit() {
        let gate = ExecutionGate::new();
        let call = gate.enter_user_code();
        assert!(gate.request_stop());
        assert_eq!(gate.phase(), Phase::AwaitingStop);
        assert!(gate.stop_requested());
        assert!(call.finish());
        assert_eq!(gate.phase(), Phase::Idle);
    }

    #[test]
    fn loading_ignores_stop() {
        let gate = ExecutionGate::new();
        {
            let _loading = gate.loading();
            assert_eq!(gate.phase(), Phase::LoadingClasses);
            assert!(!gate.request_stop());
        }
        assert_eq!(gate.phase(), Phase::Idle);
    }

    #[test]
    fn abandoned_invocation_resets_phase() {
        let gate = ExecutionGate::new();
        let call = gate.enter_user_code();
        gate.request_stop();
        drop(call);
        assert_eq!(gate.phase(), Phase::Idle);
    }
}
