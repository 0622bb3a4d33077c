//! Activity trackers: republish drained channel states as the JSON context
//! shape consumed by the cloud service. The shape is an external wire
//! contract and is preserved bit-for-bit.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::channel::ChannelState;
use crate::FocusState;

/// Consumer of drained activity-update batches (see
/// [`crate::Channel::activity_updates`]).
pub trait ActivityTracker: Send + Sync {
    fn notify_of_activity_updates(&self, states: Vec<ChannelState>);
}

/// The one interface name that is never reported for the dialog channel.
///
/// This is an intentional, product-specific carve-out, not a general rule:
/// speech capture is treated as never occupying the dialog channel for
/// reporting purposes, so the channel keeps reporting whatever interface
/// previously held it.
pub const RESERVED_DIALOG_INTERFACE: &str = "SpeechRecognizer";

const DEFAULT_DIALOG_CHANNEL_NAME: &str = "Dialog";

/// Tracks the latest state of every audio channel and renders the
/// `{"<channel>": {"interface", "idleTimeInMilliseconds"}}` context.
pub struct AudioActivityTracker {
    dialog_channel_name: String,
    states: Mutex<BTreeMap<String, ChannelState>>,
}

impl AudioActivityTracker {
    pub fn new() -> Self {
        Self::with_dialog_channel(DEFAULT_DIALOG_CHANNEL_NAME)
    }

    /// Uses a non-default dialog channel name for the reserved-interface
    /// carve-out.
    pub fn with_dialog_channel(name: impl Into<String>) -> Self {
        Self {
            dialog_channel_name: name.into(),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Renders the context, or an empty string when no channel state has
    /// been retained. Idle time is `0` while a channel is active and the
    /// elapsed milliseconds since it went idle otherwise.
    pub fn context(&self) -> String {
        let states = self.lock();
        if states.is_empty() {
            return String::new();
        }
        let mut root = Map::new();
        for (name, state) in states.iter() {
            let active = state.focus_state != FocusState::None;
            let idle_ms = if active {
                0
            } else {
                state.time_at_idle.elapsed().as_millis() as u64
            };
            root.insert(
                name.to_lowercase(),
                json!({
                    "interface": state.interface_name,
                    "idleTimeInMilliseconds": idle_ms,
                }),
            );
        }
        Value::Object(root).to_string()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ChannelState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AudioActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker for AudioActivityTracker {
    fn notify_of_activity_updates(&self, states: Vec<ChannelState>) {
        let mut retained = self.lock();
        for state in states {
            if state.name == self.dialog_channel_name
                && state.interface_name == RESERVED_DIALOG_INTERFACE
            {
                trace!(
                    channel = %state.name,
                    "dropping reserved interface from reported context"
                );
                continue;
            }
            debug!(
                channel = %state.name,
                interface = %state.interface_name,
                focus = %state.focus_state,
                "retaining activity update"
            );
            retained.insert(state.name.clone(), state);
        }
    }
}

/// Tracks the latest state of the visual channel and renders the
/// `{"focused": {"interface": ...}}` context.
pub struct VisualActivityTracker {
    state: Mutex<Option<ChannelState>>,
}

impl VisualActivityTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Renders the context, or an empty string while the visual channel is
    /// idle or has never reported.
    pub fn context(&self) -> String {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.as_ref() {
            Some(state) if state.focus_state != FocusState::None => json!({
                "focused": { "interface": state.interface_name },
            })
            .to_string(),
            _ => String::new(),
        }
    }
}

impl Default for VisualActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker for VisualActivityTracker {
    fn notify_of_activity_updates(&self, states: Vec<ChannelState>) {
        if let Some(last) = states.into_iter().last() {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(last);
        }
    }
}
