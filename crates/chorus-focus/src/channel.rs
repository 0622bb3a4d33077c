//! The focus arbitration core: a named, prioritized channel owning a stack
//! of activities, with a "patience" grace window for displaced primaries.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::activity::{Activity, ActivityArena, ActivityId};
use crate::timer::Timer;
use crate::{ChannelObserver, FocusState, MixingBehavior};

/// Externally visible snapshot of a channel, also used as the record type
/// for the drainable activity-update buffer.
///
/// In an update record, `focus_state` and `interface_name` describe the
/// transition that was recorded (for a release, the released interface with
/// [`FocusState::None`]), not necessarily the channel's own current primary.
#[derive(Clone, Debug)]
pub struct ChannelState {
    pub name: String,
    pub focus_state: FocusState,
    pub interface_name: String,
    /// The moment the channel (or, in an update record, the recorded
    /// interface) last went idle. Meaningful only when not foregrounded.
    pub time_at_idle: Instant,
}

struct Inner {
    state: ChannelState,
    arena: ActivityArena,
    /// Front entry is the primary activity.
    stack: SmallVec<[ActivityId; 4]>,
    /// Drainable buffer of focus-affecting transitions; empty forever on
    /// virtual channels.
    updates: Vec<ChannelState>,
    /// Disposition most recently applied to the primary.
    last_behavior: MixingBehavior,
    patience_initiator: Option<ActivityId>,
    patience_receiver: Option<ActivityId>,
}

/// A named, prioritized focus slot.
///
/// All public methods are callable from any thread. Observer callbacks are
/// invoked after the channel's lock has been released, so observers may call
/// back into the channel; the notified snapshot may be one step stale
/// relative to concurrent stack mutation.
pub struct Channel {
    name: String,
    priority: u32,
    is_virtual: bool,
    timer: Timer,
    inner: Mutex<Inner>,
    self_ref: Weak<Channel>,
}

impl Channel {
    /// Creates a channel. Lower `priority` values outrank higher ones.
    pub fn new(name: impl Into<String>, priority: u32) -> Arc<Self> {
        Self::create(name.into(), priority, false)
    }

    /// Creates a virtual channel: same arbitration, but it records no
    /// activity-update entries.
    pub fn new_virtual(name: impl Into<String>, priority: u32) -> Arc<Self> {
        Self::create(name.into(), priority, true)
    }

    fn create(name: String, priority: u32, is_virtual: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                state: ChannelState {
                    name: name.clone(),
                    focus_state: FocusState::None,
                    interface_name: String::new(),
                    time_at_idle: Instant::now(),
                },
                arena: ActivityArena::default(),
                stack: SmallVec::new(),
                updates: Vec::new(),
                last_behavior: MixingBehavior::MustStop,
                patience_initiator: None,
                patience_receiver: None,
            }),
            name,
            priority,
            is_virtual,
            timer: Timer::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// Strictly lower numeric priority outranks.
    pub fn has_higher_priority_than(&self, other: &Channel) -> bool {
        self.priority < other.priority
    }

    /// Updates the externally visible focus state and the disposition applied
    /// to the primary activity.
    ///
    /// Returns `false` without side effects unless `force_update` is set, the
    /// focus state actually changes, or the primary's disposition changes.
    /// On an effective change the primary's observer is invoked with
    /// `(focus, behavior)` and every other stacked activity's observer with
    /// `(Background, MustPause)`; the call blocks until all observers return.
    /// Callers must not hold other locks across this call.
    pub fn set_focus(&self, focus: FocusState, behavior: MixingBehavior, force_update: bool) -> bool {
        let mut to_notify: Vec<(Arc<dyn ChannelObserver>, FocusState, MixingBehavior)> = Vec::new();
        {
            let mut inner = self.lock();
            let changed =
                force_update || focus != inner.state.focus_state || behavior != inner.last_behavior;
            if !changed {
                return false;
            }
            debug!(channel = %self.name, %focus, %behavior, "focus changed");
            inner.state.focus_state = focus;
            inner.last_behavior = behavior;
            if focus == FocusState::None {
                inner.state.time_at_idle = Instant::now();
            }
            let record = inner.state.clone();
            self.push_update(&mut inner, record);

            if let Some(&primary) = inner.stack.first() {
                if let Some(activity) = inner.arena.get(primary) {
                    to_notify.push((Arc::clone(activity.observer()), focus, behavior));
                }
            }
            for &id in inner.stack.iter().skip(1) {
                if let Some(activity) = inner.arena.get(id) {
                    to_notify.push((
                        Arc::clone(activity.observer()),
                        FocusState::Background,
                        MixingBehavior::MustPause,
                    ));
                }
            }
        }
        for (observer, focus, behavior) in to_notify {
            observer.on_focus_changed(focus, behavior);
        }
        true
    }

    /// Establishes `activity` as the new primary, applying the interruption
    /// policy to the activity it displaces:
    ///
    /// 1. a re-acquire by the same interface releases the old claim outright,
    /// 2. an in-progress grace period is cut short (the receiver is released
    ///    immediately),
    /// 3. an incoming activity with patience lets the displaced primary keep
    ///    running for the grace window while it is already reported idle,
    /// 4. otherwise the displaced primary (and any initiator left parked by
    ///    an elapsed grace period) is released immediately.
    pub fn set_primary_activity(&self, activity: Activity) {
        let mut to_notify: Vec<Arc<dyn ChannelObserver>> = Vec::new();
        {
            let mut inner = self.lock();
            debug!(
                channel = %self.name,
                interface = %activity.interface_name(),
                patience = ?activity.patience(),
                "set primary activity"
            );
            let mut armed_patience = false;
            if let Some(current_id) = inner.stack.first().copied() {
                let current_interface = inner
                    .arena
                    .get(current_id)
                    .map(|a| a.interface_name().to_string())
                    .unwrap_or_default();
                if activity.interface_name() == current_interface {
                    self.remove_activity_locked(&mut inner, current_id, &mut to_notify);
                } else {
                    if self.timer.is_active() {
                        // an interrupting request outranks an in-progress
                        // grace period
                        self.timer.stop();
                        if let Some(receiver) = inner.patience_receiver {
                            self.remove_activity_locked(&mut inner, receiver, &mut to_notify);
                        }
                        inner.patience_receiver = None;
                        inner.patience_initiator = None;
                    }
                    if activity.has_patience() {
                        // externally the displaced primary goes idle now; it
                        // keeps running until the grace window lapses
                        let record = ChannelState {
                            name: self.name.clone(),
                            focus_state: FocusState::None,
                            interface_name: current_interface,
                            time_at_idle: Instant::now(),
                        };
                        self.push_update(&mut inner, record);
                        inner.patience_receiver = Some(current_id);
                        let weak = self.self_ref.clone();
                        self.timer.start(activity.patience(), move || {
                            if let Some(channel) = weak.upgrade() {
                                channel.patience_elapsed(current_id);
                            }
                        });
                        armed_patience = true;
                    } else {
                        if let Some(initiator) = inner.patience_initiator.take() {
                            self.remove_activity_locked(&mut inner, initiator, &mut to_notify);
                        }
                        self.remove_activity_locked(&mut inner, current_id, &mut to_notify);
                    }
                }
            }
            let id = inner.arena.insert(activity);
            inner.stack.insert(0, id);
            if armed_patience {
                inner.patience_initiator = Some(id);
            }
            self.update_interface_locked(&mut inner);
        }
        for observer in to_notify {
            observer.on_focus_changed(FocusState::None, MixingBehavior::MustStop);
        }
    }

    /// Removes the activity with the given interface name. Returns `false`
    /// if no such activity is stacked.
    pub fn release_activity(&self, interface_name: &str) -> bool {
        if interface_name.is_empty() {
            warn!(channel = %self.name, "refusing to release an empty interface name");
            return false;
        }
        self.release_where(|activity| activity.interface_name() == interface_name)
    }

    /// Removes the activity registered with the given observer.
    pub fn release_activity_for_observer(&self, observer: &Arc<dyn ChannelObserver>) -> bool {
        self.release_where(|activity| Arc::ptr_eq(activity.observer(), observer))
    }

    pub fn is_active(&self) -> bool {
        !self.lock().stack.is_empty()
    }

    /// Thread-safe snapshot of the channel's externally visible state.
    pub fn state(&self) -> ChannelState {
        self.lock().state.clone()
    }

    /// Drains the buffered activity-update records: at-most-once delivery
    /// per event, the caller is responsible for timely draining.
    pub fn activity_updates(&self) -> Vec<ChannelState> {
        mem::take(&mut self.lock().updates)
    }

    pub fn primary_activity(&self) -> Option<Activity> {
        let inner = self.lock();
        inner
            .stack
            .first()
            .and_then(|&id| inner.arena.get(id))
            .cloned()
    }

    pub fn activity(&self, interface_name: &str) -> Option<Activity> {
        let inner = self.lock();
        inner
            .stack
            .iter()
            .filter_map(|&id| inner.arena.get(id))
            .find(|activity| activity.interface_name() == interface_name)
            .cloned()
    }

    /// Interface names of all stacked activities, primary first.
    pub fn interface_list(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .stack
            .iter()
            .filter_map(|&id| inner.arena.get(id))
            .map(|activity| activity.interface_name().to_string())
            .collect()
    }

    fn release_where(&self, pred: impl Fn(&Activity) -> bool) -> bool {
        let mut to_notify: Vec<Arc<dyn ChannelObserver>> = Vec::new();
        let found = {
            let mut inner = self.lock();
            let id = inner
                .stack
                .iter()
                .copied()
                .find(|&id| inner.arena.get(id).is_some_and(|a| pred(a)));
            match id {
                Some(id) => {
                    self.remove_activity_locked(&mut inner, id, &mut to_notify);
                    self.update_interface_locked(&mut inner);
                    true
                }
                None => {
                    warn!(channel = %self.name, "no matching activity to release");
                    false
                }
            }
        };
        for observer in to_notify {
            observer.on_focus_changed(FocusState::None, MixingBehavior::MustStop);
        }
        found
    }

    /// Grace window lapsed: evict the receiver if it is still the one the
    /// timer was armed for.
    fn patience_elapsed(&self, id: ActivityId) {
        let mut to_notify: Vec<Arc<dyn ChannelObserver>> = Vec::new();
        {
            let mut inner = self.lock();
            if inner.patience_receiver != Some(id) {
                trace!(channel = %self.name, "patience timer fired for a stale receiver");
                return;
            }
            debug!(channel = %self.name, "patience elapsed, evicting receiver");
            self.remove_activity_locked(&mut inner, id, &mut to_notify);
            self.update_interface_locked(&mut inner);
        }
        for observer in to_notify {
            observer.on_focus_changed(FocusState::None, MixingBehavior::MustStop);
        }
    }

    /// Removes one activity from the arena, the stack, and the patience
    /// bookkeeping; queues its observer for a `(None, MustStop)` callback.
    ///
    /// The patience receiver's removal is silent update-wise: its idle record
    /// was already appended when the grace window was armed.
    fn remove_activity_locked(
        &self,
        inner: &mut Inner,
        id: ActivityId,
        to_notify: &mut Vec<Arc<dyn ChannelObserver>>,
    ) -> bool {
        let Some(activity) = inner.arena.remove(id) else {
            return false;
        };
        inner.stack.retain(|entry| *entry != id);
        let was_receiver = inner.patience_receiver == Some(id);
        if was_receiver {
            self.timer.stop();
            inner.patience_receiver = None;
        }
        if inner.patience_initiator == Some(id) {
            self.timer.stop();
            inner.patience_initiator = None;
        }
        let now = Instant::now();
        if inner.stack.is_empty() && inner.state.focus_state != FocusState::None {
            inner.state.focus_state = FocusState::None;
            inner.state.time_at_idle = now;
            inner.last_behavior = MixingBehavior::MustStop;
        }
        if !was_receiver {
            let record = ChannelState {
                name: self.name.clone(),
                focus_state: FocusState::None,
                interface_name: activity.interface_name().to_string(),
                time_at_idle: now,
            };
            self.push_update(inner, record);
        }
        debug!(
            channel = %self.name,
            interface = %activity.interface_name(),
            "released activity"
        );
        to_notify.push(Arc::clone(activity.observer()));
        true
    }

    fn update_interface_locked(&self, inner: &mut Inner) {
        let interface = inner
            .stack
            .first()
            .and_then(|&id| inner.arena.get(id))
            .map(|activity| activity.interface_name().to_string())
            .unwrap_or_default();
        inner.state.interface_name = interface;
    }

    fn push_update(&self, inner: &mut Inner, record: ChannelState) {
        if !self.is_virtual {
            inner.updates.push(record);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        notified: AtomicUsize,
    }

    impl CountingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notified: AtomicUsize::new(0),
            })
        }
    }

    impl ChannelObserver for CountingObserver {
        fn on_focus_changed(&self, _focus: FocusState, _behavior: MixingBehavior) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn updates_drain_at_most_once() {
        let channel = Channel::new("Content", 300);
        let observer = CountingObserver::new();
        channel.set_primary_activity(Activity::new("AudioPlayer", observer));
        channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, false);
        let first = channel.activity_updates();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].interface_name, "AudioPlayer");
        assert_eq!(first[0].focus_state, FocusState::Foreground);
        assert!(channel.activity_updates().is_empty());
    }

    #[test]
    fn virtual_channel_records_nothing() {
        let channel = Channel::new_virtual("Bookkeeping", 9000);
        let observer = CountingObserver::new();
        channel.set_primary_activity(Activity::new(
            "SideChannel",
            Arc::clone(&observer) as Arc<dyn ChannelObserver>,
        ));
        channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, false);
        channel.release_activity("SideChannel");
        assert!(channel.activity_updates().is_empty());
        // arbitration itself still ran
        assert_eq!(observer.notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_stack_means_focus_none() {
        let channel = Channel::new("Dialog", 100);
        let observer: Arc<dyn ChannelObserver> = CountingObserver::new();
        channel.set_primary_activity(Activity::new("SpeechSynthesizer", Arc::clone(&observer)));
        channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, false);
        assert!(channel.release_activity_for_observer(&observer));
        let state = channel.state();
        assert_eq!(state.focus_state, FocusState::None);
        assert!(!channel.is_active());
    }

    #[test]
    fn set_focus_is_a_noop_without_change() {
        let channel = Channel::new("Dialog", 100);
        let observer = CountingObserver::new();
        channel.set_primary_activity(Activity::new("SpeechSynthesizer", observer));
        assert!(channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, false));
        assert!(!channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, false));
        assert!(channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, true));
    }
}
