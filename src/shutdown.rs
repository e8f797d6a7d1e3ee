//! Counted operation gate with an awaitable drained signal.
//!
//! Used wherever a close must wait for in-flight work: the endpoint
//! registry (stream handoffs), the forwarder (per-connection tasks), and
//! per-connection HTTP serving.  `shutdown` returns immediately; `wait`
//! resolves once the gate is shut and the in-flight count reaches zero.
//! The `Default` value is ready to use.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    drained: Notify,
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    shut: bool,
}

/// Keeps the gate open while alive; finishing is automatic on drop.
#[derive(Debug)]
pub struct OpGuard<'a> {
    gate: &'a Gate,
}

impl Gate {
    /// Enter the gate.  Returns `None` once `shutdown` has been called.
    pub fn try_op(&self) -> Option<OpGuard<'_>> {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.shut {
            return None;
        }
        state.in_flight += 1;
        Some(OpGuard { gate: self })
    }

    /// Refuse new operations.  Returns immediately; use `wait` for the
    /// drained signal.  Calling more than once is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.shut = true;
        if state.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once the gate is shut and every in-flight operation has
    /// finished.
    pub async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let state = self.state.lock().expect("gate lock poisoned");
                if state.shut && state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    fn finish_op(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.in_flight -= 1;
        if state.shut && state.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.gate.finish_op();
    }
}
