//! Activity records and the slot arena the channel stack indexes into.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{ChannelObserver, MixingBehavior};

/// One requester's claim on a channel.
///
/// Carries the interface name identifying the requester, the observer to
/// notify of focus changes, the disposition the activity asks for when it is
/// not primary, and an optional patience duration: a grace window an
/// interrupting activity grants this one before it is forcibly stopped.
#[derive(Clone)]
pub struct Activity {
    interface_name: String,
    observer: Arc<dyn ChannelObserver>,
    mixing_behavior: MixingBehavior,
    patience: Duration,
}

impl Activity {
    pub fn new(interface_name: impl Into<String>, observer: Arc<dyn ChannelObserver>) -> Self {
        Self {
            interface_name: interface_name.into(),
            observer,
            mixing_behavior: MixingBehavior::Unrestricted,
            patience: Duration::ZERO,
        }
    }

    /// Sets the grace window granted to the activity this one displaces.
    pub fn with_patience(mut self, patience: Duration) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_mixing_behavior(mut self, behavior: MixingBehavior) -> Self {
        self.mixing_behavior = behavior;
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn observer(&self) -> &Arc<dyn ChannelObserver> {
        &self.observer
    }

    pub fn mixing_behavior(&self) -> MixingBehavior {
        self.mixing_behavior
    }

    pub fn patience(&self) -> Duration {
        self.patience
    }

    pub fn has_patience(&self) -> bool {
        !self.patience.is_zero()
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("interface_name", &self.interface_name)
            .field("mixing_behavior", &self.mixing_behavior)
            .field("patience", &self.patience)
            .finish_non_exhaustive()
    }
}

/// Stable handle to an arena slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ActivityId(u32);

/// Slot arena owning the activity records a channel's stack refers to.
///
/// The stack holds [`ActivityId`]s, not owning references; observers are
/// looked up through the arena at notify time.
#[derive(Default)]
pub(crate) struct ActivityArena {
    slots: Vec<Option<Activity>>,
    free: Vec<u32>,
}

impl ActivityArena {
    pub(crate) fn insert(&mut self, activity: Activity) -> ActivityId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(activity);
                ActivityId(index)
            }
            None => {
                self.slots.push(Some(activity));
                ActivityId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: ActivityId) -> Option<Activity> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let activity = slot.take()?;
        self.free.push(id.0);
        Some(activity)
    }

    pub(crate) fn get(&self, id: ActivityId) -> Option<&Activity> {
        self.slots.get(id.0 as usize)?.as_ref()
    }
}
