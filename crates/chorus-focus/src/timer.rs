//! A scoped, cancellable one-shot timer.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// One-shot delayed-callback primitive.
///
/// [`Timer::start`] arms the timer (re-arming cancels the pending task);
/// [`Timer::stop`] cancels a pending task but does not interrupt one that has
/// already begun running. The task is invoked on a background thread with no
/// lock held; its body is responsible for its own synchronization.
pub struct Timer {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    /// Bumped on every start/stop; a pending task fires only if the
    /// generation it was armed with is still current.
    generation: u64,
    armed: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    generation: 0,
                    armed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Arms the timer to run `task` after `delay`. A previously armed task is
    /// cancelled first.
    pub fn start<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.armed = true;
            state.generation
        };
        self.shared.cond.notify_all();

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let deadline = Instant::now() + delay;
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if state.generation != generation {
                    trace!("timer generation superseded before firing");
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = shared
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
            // Committed to firing: mark inactive before invoking so stop()
            // observed from inside the task is a no-op.
            state.armed = false;
            drop(state);
            task();
        });
    }

    /// Cancels a pending task. A task that has already started running is not
    /// interrupted.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.armed = false;
        drop(state);
        self.shared.cond.notify_all();
    }

    /// True from `start` until the task fires or is stopped.
    pub fn is_active(&self) -> bool {
        self.lock().armed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
