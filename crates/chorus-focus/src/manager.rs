//! Focus bookkeeping over the set of channels: routes acquire/release
//! requests and keeps exactly one channel foregrounded.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::activity::Activity;
use crate::channel::{Channel, ChannelState};
use crate::tracker::ActivityTracker;
use crate::{ChannelObserver, FocusState, MixingBehavior};

/// Name and priority a channel is created with. Lower priority values
/// outrank higher ones; the highest possible priority is 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub priority: u32,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }

    /// Parses a JSON array of `{"name": ..., "priority": ...}` objects, the
    /// shape channel sets are configured with.
    pub fn from_json_array(json: &str) -> Result<Vec<Self>, ConfigError> {
        let configs: Vec<Self> = serde_json::from_str(json)?;
        Ok(configs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed channel configuration: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Notified after every effective channel focus change.
pub trait FocusManagerObserver: Send + Sync {
    fn on_focus_changed(&self, channel_name: &str, focus: FocusState);
}

struct ManagerInner {
    /// Channels with at least one stacked activity.
    active: Vec<Arc<Channel>>,
    observers: Vec<Arc<dyn FocusManagerObserver>>,
}

/// Takes requests to acquire and release channels and updates the focus of
/// every channel so that at most one is foregrounded: the highest-priority
/// active one.
///
/// The manager's own lock is never held across a channel's synchronous
/// observer notifications; transitions are computed under the lock and
/// applied after it is released.
pub struct FocusManager {
    /// Every channel, keyed by name. Immutable after construction; ordered
    /// so that cross-channel update batches drain deterministically.
    all_channels: BTreeMap<String, Arc<Channel>>,
    inner: Mutex<ManagerInner>,
    tracker: Option<Arc<dyn ActivityTracker>>,
}

impl FocusManager {
    /// Creates channels from the given configurations. Duplicate names or
    /// priorities are skipped with a warning. Virtual channels take part in
    /// arbitration but record no activity updates.
    pub fn new(
        channel_configs: Vec<ChannelConfig>,
        virtual_channel_configs: Vec<ChannelConfig>,
        tracker: Option<Arc<dyn ActivityTracker>>,
    ) -> Self {
        let mut all_channels = BTreeMap::new();
        let mut priorities = HashSet::new();
        let groups = [(channel_configs, false), (virtual_channel_configs, true)];
        for (configs, is_virtual) in groups {
            for config in configs {
                if all_channels.contains_key(&config.name) {
                    warn!(name = %config.name, "duplicate channel name, skipping");
                    continue;
                }
                if !priorities.insert(config.priority) {
                    warn!(
                        name = %config.name,
                        priority = config.priority,
                        "duplicate channel priority, skipping"
                    );
                    continue;
                }
                let channel = if is_virtual {
                    Channel::new_virtual(config.name.clone(), config.priority)
                } else {
                    Channel::new(config.name.clone(), config.priority)
                };
                all_channels.insert(config.name, channel);
            }
        }
        Self {
            all_channels,
            inner: Mutex::new(ManagerInner {
                active: Vec::new(),
                observers: Vec::new(),
            }),
            tracker,
        }
    }

    /// Grants `activity` the named channel and refocuses every channel
    /// accordingly. Returns `false` if the channel name is unknown.
    pub fn acquire_channel(&self, channel_name: &str, activity: Activity) -> bool {
        let Some(channel) = self.all_channels.get(channel_name) else {
            warn!(name = %channel_name, "acquire for unknown channel");
            return false;
        };
        debug!(
            channel = %channel_name,
            interface = %activity.interface_name(),
            "acquire channel"
        );
        channel.set_primary_activity(activity);
        {
            let mut inner = self.lock();
            if !inner.active.iter().any(|c| Arc::ptr_eq(c, channel)) {
                inner.active.push(Arc::clone(channel));
            }
        }
        // force an update on the acquired channel: its focus state may be
        // unchanged, but the new primary has not heard it yet
        self.refocus(Some(channel));
        self.notify_activity_tracker();
        true
    }

    /// Releases the activity that `observer` registered on the named channel.
    /// Returns `false` if the channel name is unknown or the observer holds
    /// no activity there.
    pub fn release_channel(&self, channel_name: &str, observer: &Arc<dyn ChannelObserver>) -> bool {
        let Some(channel) = self.all_channels.get(channel_name) else {
            warn!(name = %channel_name, "release for unknown channel");
            return false;
        };
        debug!(channel = %channel_name, "release channel");
        let released = channel.release_activity_for_observer(observer);
        if released {
            self.refocus(None);
            self.notify_activity_tracker();
        }
        released
    }

    /// Stops whatever currently holds the foreground, promoting the next
    /// highest-priority active channel if any.
    pub fn stop_foreground_activity(&self) {
        let foreground = {
            let inner = self.lock();
            highest_priority(&inner.active)
        };
        let Some(channel) = foreground else {
            return;
        };
        let Some(primary) = channel.primary_activity() else {
            return;
        };
        debug!(
            channel = %channel.name(),
            interface = %primary.interface_name(),
            "stop foreground activity"
        );
        if channel.release_activity(primary.interface_name()) {
            self.refocus(None);
            self.notify_activity_tracker();
        }
    }

    /// Releases every activity on every active channel.
    pub fn stop_all_activities(&self) {
        let channels = {
            let inner = self.lock();
            inner.active.clone()
        };
        if channels.is_empty() {
            return;
        }
        for channel in &channels {
            while let Some(activity) = channel.primary_activity() {
                if !channel.release_activity(activity.interface_name()) {
                    break;
                }
            }
        }
        self.refocus(None);
        self.notify_activity_tracker();
    }

    pub fn add_observer(&self, observer: Arc<dyn FocusManagerObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn FocusManagerObserver>) {
        self.lock()
            .observers
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Foregrounds the highest-priority active channel, backgrounds the other
    /// active ones, and retires channels whose stack emptied. `force` is the
    /// channel whose primary just changed and must be notified even if the
    /// channel's focus state did not.
    fn refocus(&self, force: Option<&Arc<Channel>>) {
        let mut transitions: Vec<(Arc<Channel>, FocusState, MixingBehavior)> = Vec::new();
        let observers;
        {
            let mut inner = self.lock();
            let (still_active, emptied): (Vec<_>, Vec<_>) = inner
                .active
                .drain(..)
                .partition(|channel| channel.is_active());
            inner.active = still_active;
            let foreground = highest_priority(&inner.active);
            for channel in &inner.active {
                let is_foreground = foreground
                    .as_ref()
                    .is_some_and(|f| Arc::ptr_eq(f, channel));
                if is_foreground {
                    transitions.push((
                        Arc::clone(channel),
                        FocusState::Foreground,
                        MixingBehavior::Unrestricted,
                    ));
                } else {
                    transitions.push((
                        Arc::clone(channel),
                        FocusState::Background,
                        MixingBehavior::MustPause,
                    ));
                }
            }
            for channel in emptied {
                transitions.push((channel, FocusState::None, MixingBehavior::MustStop));
            }
            observers = inner.observers.clone();
        }
        for (channel, focus, behavior) in transitions {
            let force_update = force.is_some_and(|forced| Arc::ptr_eq(forced, &channel));
            let effective = channel.set_focus(focus, behavior, force_update);
            // a channel whose stack emptied already went to NONE internally;
            // the transition is still surfaced to manager observers
            if effective || (focus == FocusState::None && !channel.is_active()) {
                for observer in &observers {
                    observer.on_focus_changed(channel.name(), focus);
                }
            }
        }
    }

    /// Drains every channel's update buffer and hands the batch to the
    /// activity tracker.
    fn notify_activity_tracker(&self) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let mut updates: Vec<ChannelState> = Vec::new();
        for channel in self.all_channels.values() {
            updates.extend(channel.activity_updates());
        }
        if !updates.is_empty() {
            tracker.notify_of_activity_updates(updates);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn highest_priority(channels: &[Arc<Channel>]) -> Option<Arc<Channel>> {
    channels
        .iter()
        .min_by_key(|channel| channel.priority())
        .cloned()
}
