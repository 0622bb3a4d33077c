//! Priority-based focus arbitration over named channels.
//!
//! A [`Channel`] is a named, prioritized focus slot that at most one primary
//! [`Activity`] occupies at a time. The [`FocusManager`] owns the set of
//! channels, routes acquire/release requests, and keeps the invariant that
//! only the highest-priority active channel is foregrounded. An activity
//! being displaced may be granted a bounded "patience" grace window before it
//! is forcibly stopped.
//!
//! Focus changes are delivered synchronously through
//! [`ChannelObserver::on_focus_changed`], after the channel's internal lock
//! has been released: observers may call back into the channel or the
//! manager, but must not block indefinitely.

use std::fmt;

pub mod activity;
pub mod channel;
pub mod manager;
pub mod timer;
pub mod tracker;

pub use activity::Activity;
pub use channel::{Channel, ChannelState};
pub use manager::{ChannelConfig, ConfigError, FocusManager, FocusManagerObserver};
pub use timer::Timer;
pub use tracker::{ActivityTracker, AudioActivityTracker, VisualActivityTracker};

/// How much of the channel an activity currently holds.
///
/// `None` means the activity is not on the channel at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    Foreground,
    Background,
    None,
}

impl fmt::Display for FocusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FocusState::Foreground => "FOREGROUND",
            FocusState::Background => "BACKGROUND",
            FocusState::None => "NONE",
        };
        f.write_str(s)
    }
}

/// Disposition applied to an activity alongside a focus change: what it is
/// allowed to keep doing in its new position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingBehavior {
    /// No restriction; the usual disposition of the foreground primary.
    Unrestricted,
    /// May keep producing output at reduced prominence.
    MayDuck,
    /// Must pause output until focus is regained.
    MustPause,
    /// Must stop; the activity is off the channel.
    MustStop,
}

impl fmt::Display for MixingBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MixingBehavior::Unrestricted => "UNRESTRICTED",
            MixingBehavior::MayDuck => "MAY_DUCK",
            MixingBehavior::MustPause => "MUST_PAUSE",
            MixingBehavior::MustStop => "MUST_STOP",
        };
        f.write_str(s)
    }
}

/// Callback target for focus changes on one channel.
///
/// Invoked synchronously from [`Channel::set_focus`] and from activity
/// removal, never while the channel's lock is held. Distinct channels may
/// invoke overlapping callbacks concurrently; implementations must tolerate
/// that and must not block indefinitely.
pub trait ChannelObserver: Send + Sync {
    fn on_focus_changed(&self, focus: FocusState, behavior: MixingBehavior);
}
