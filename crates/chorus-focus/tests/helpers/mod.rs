#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chorus_focus::{ChannelObserver, FocusState, MixingBehavior};

/// Short timeout for asserting that a callback does not occur.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(120);

/// Plenty of time for a callback that is expected to occur.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_tracing() {
    use tracing_subscriber::EnvFilter;
    _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Channel observer that queues every focus change so tests can assert
/// exact notification sequences.
pub struct TestObserver {
    events: Mutex<VecDeque<(FocusState, MixingBehavior)>>,
    cond: Condvar,
}

impl TestObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    /// Waits for the next queued focus change, or `None` on timeout.
    pub fn next_event(&self, timeout: Duration) -> Option<(FocusState, MixingBehavior)> {
        let events = self.events.lock().unwrap();
        let (mut events, _) = self
            .cond
            .wait_timeout_while(events, timeout, |events| events.is_empty())
            .unwrap();
        events.pop_front()
    }

    /// Asserts the next focus change matches, within `DEFAULT_TIMEOUT`.
    pub fn expect_change(&self, focus: FocusState, behavior: MixingBehavior) {
        match self.next_event(DEFAULT_TIMEOUT) {
            Some(event) => assert_eq!(event, (focus, behavior)),
            None => panic!("expected focus change to ({focus}, {behavior}), got none"),
        }
    }

    /// Asserts no focus change arrives within `SHORT_TIMEOUT`.
    pub fn expect_no_change(&self) {
        if let Some((focus, behavior)) = self.next_event(SHORT_TIMEOUT) {
            panic!("expected no focus change, got ({focus}, {behavior})");
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl ChannelObserver for TestObserver {
    fn on_focus_changed(&self, focus: FocusState, behavior: MixingBehavior) {
        self.events.lock().unwrap().push_back((focus, behavior));
        self.cond.notify_all();
    }
}
