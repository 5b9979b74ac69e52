use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long a worker parks at an armed gate before re-checking its quit
/// flag.
const POLL: Duration = Duration::from_millis(100);

/// Suspends worker threads while the pipeline is not playing.
///
/// Every worker iteration starts with [`Gate::wait_if_set`]; releasing the
/// gate broadcasts to all waiters. Waits are bounded so a worker can never
/// be trapped here across a teardown: while the gate stays armed the
/// worker loops through its quit check instead of running its body.
pub(crate) struct Gate {
    armed: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub(crate) fn new(armed: bool) -> Self {
        Self {
            armed: Mutex::new(armed),
            cond: Condvar::new(),
        }
    }

    /// Parks the calling worker while the gate is armed, for at most one
    /// poll interval. Returns whether the gate is still armed; callers
    /// skip their loop body while it is.
    pub(crate) fn wait_if_set(&self) -> bool {
        let mut armed = self.armed.lock();
        if *armed {
            self.cond.wait_for(&mut armed, POLL);
        }
        *armed
    }

    pub(crate) fn set(&self, armed: bool) {
        *self.armed.lock() = armed;
        if !armed {
            self.cond.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        *self.armed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn released_gate_does_not_block() {
        let gate = Gate::new(false);
        let started = Instant::now();
        assert!(!gate.wait_if_set());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn armed_gate_parks_until_released() {
        let gate = Arc::new(Gate::new(true));
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let started = Instant::now();
                while gate.wait_if_set() {}
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        gate.set(false);

        let blocked_for = waiter.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(40));
    }

    #[test]
    fn release_wakes_all_waiters() {
        let gate = Arc::new(Gate::new(true));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || while gate.wait_if_set() {})
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.set(false);
        assert!(!gate.is_set());

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn armed_gate_reports_armed_after_a_poll() {
        let gate = Gate::new(true);
        assert!(gate.wait_if_set());
        assert!(gate.is_set());
    }
}
