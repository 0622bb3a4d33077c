//! Per-stream shared state and the caller-facing stream handle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// State shared between the caller-facing handle, the transfer callbacks,
/// and the servicing loop. The cancel flag is the only cross-thread signal a
/// producer touches; everything else is driven by the network thread.
pub(crate) struct StreamState {
    id: String,
    activity_timeout: Option<Duration>,
    intermittent: bool,
    cancelled: AtomicBool,
    paused: AtomicBool,
    last_transfer: Mutex<Instant>,
    /// Latest status code seen on the wire; 0 until one arrives.
    response_code: AtomicU32,
    response_code_reported: AtomicBool,
    finished: AtomicBool,
}

impl StreamState {
    pub(crate) fn new(
        id: String,
        activity_timeout: Option<Duration>,
        intermittent: bool,
    ) -> Self {
        Self {
            id,
            activity_timeout,
            intermittent,
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_transfer: Mutex::new(Instant::now()),
            response_code: AtomicU32::new(0),
            response_code_reported: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_intermittent_transfer_expected(&self) -> bool {
        self.intermittent
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clears the paused flag, returning whether it was set.
    pub(crate) fn clear_paused(&self) -> bool {
        self.paused.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stamps "bytes moved now"; called from every transfer callback and at
    /// dispatch.
    pub(crate) fn mark_transfer(&self) {
        *self
            .last_transfer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Whether the activity timeout has elapsed with no byte movement. A
    /// stream without a configured timeout never stalls.
    pub(crate) fn has_progress_timed_out(&self, now: Instant) -> bool {
        let Some(timeout) = self.activity_timeout else {
            return false;
        };
        let last = *self
            .last_transfer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.duration_since(last) > timeout
    }

    pub(crate) fn set_response_code(&self, code: u32) {
        self.response_code.store(code, Ordering::SeqCst);
    }

    /// Returns the response code exactly once, when one has been seen.
    pub(crate) fn take_response_code_to_report(&self) -> Option<u32> {
        let code = self.response_code.load(Ordering::SeqCst);
        if code == 0 {
            return None;
        }
        if self.response_code_reported.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(code)
    }

    /// Claims the right to report the terminal status. True exactly once.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

/// Caller-facing handle to one in-flight stream.
///
/// Cancellation is cooperative: [`Http2Request::cancel`] flips an atomic
/// flag from any thread; the servicing loop observes it on its next cleanup
/// pass and reports [`crate::FinishedStatus::Cancelled`].
#[derive(Clone)]
pub struct Http2Request {
    state: Arc<StreamState>,
}

impl Http2Request {
    pub(crate) fn new(state: Arc<StreamState>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    /// Requests cancellation. Always succeeds; the transfer is unwound
    /// asynchronously within one loop iteration.
    pub fn cancel(&self) -> bool {
        debug!(stream = %self.state.id(), "cancel requested");
        self.state.set_cancelled();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Whether the stream is currently parked by backpressure.
    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_reports_once() {
        let state = StreamState::new("s".into(), None, false);
        assert_eq!(state.take_response_code_to_report(), None);
        state.set_response_code(200);
        assert_eq!(state.take_response_code_to_report(), Some(200));
        assert_eq!(state.take_response_code_to_report(), None);
    }

    #[test]
    fn finished_claims_once() {
        let state = StreamState::new("s".into(), None, false);
        assert!(state.mark_finished());
        assert!(!state.mark_finished());
    }

    #[test]
    fn progress_timeout_disabled_without_config() {
        let state = StreamState::new("s".into(), None, false);
        assert!(!state.has_progress_timed_out(Instant::now() + Duration::from_secs(3600)));

        let state = StreamState::new("s".into(), Some(Duration::from_millis(10)), false);
        assert!(!state.has_progress_timed_out(Instant::now()));
        assert!(state.has_progress_timed_out(Instant::now() + Duration::from_millis(50)));
        state.mark_transfer();
        assert!(!state.has_progress_timed_out(Instant::now()));
    }
}
