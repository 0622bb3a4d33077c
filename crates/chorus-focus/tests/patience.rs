//! Interruption-policy behavior: grace windows, early pre-emption, and the
//! same-interface bypass.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chorus_focus::{
    Activity, ChannelConfig, ChannelObserver, FocusManager, FocusState, MixingBehavior,
};
use chorus_focus::channel::Channel;
use helpers::TestObserver;
use pretty_assertions::assert_eq;

const PATIENCE: Duration = Duration::from_millis(300);

fn as_channel_observer(observer: &Arc<TestObserver>) -> Arc<dyn ChannelObserver> {
    Arc::clone(observer) as Arc<dyn ChannelObserver>
}

#[test]
fn patience_grace_then_evict() {
    helpers::setup_tracing();
    let channel = Channel::new("Dialog", 100);
    let a = TestObserver::new();
    let b = TestObserver::new();

    channel.set_primary_activity(Activity::new("SpeechSynthesizer", as_channel_observer(&a)));
    channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, true);
    a.expect_change(FocusState::Foreground, MixingBehavior::Unrestricted);
    let updates = channel.activity_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].focus_state, FocusState::Foreground);

    channel.set_primary_activity(
        Activity::new("Alert", as_channel_observer(&b)).with_patience(PATIENCE),
    );
    channel.set_focus(FocusState::Foreground, MixingBehavior::Unrestricted, true);
    b.expect_change(FocusState::Foreground, MixingBehavior::Unrestricted);
    // the displaced primary is backgrounded, not yet stopped
    a.expect_change(FocusState::Background, MixingBehavior::MustPause);

    // externally it is already reported idle
    let updates = channel.activity_updates();
    let summary: Vec<_> = updates
        .iter()
        .map(|u| (u.interface_name.as_str(), u.focus_state))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("SpeechSynthesizer", FocusState::None),
            ("Alert", FocusState::Foreground),
        ]
    );

    a.expect_no_change();
    // the grace window lapses: evicted exactly once, and silently
    // update-wise (its idle record was already drained above)
    a.expect_change(FocusState::None, MixingBehavior::MustStop);
    a.expect_no_change();
    assert!(channel.activity_updates().is_empty());
    assert_eq!(channel.interface_list(), vec!["Alert".to_string()]);
}

#[test]
fn interrupt_cancels_patience() {
    helpers::setup_tracing();
    let channel = Channel::new("Dialog", 100);
    let a = TestObserver::new();
    let b = TestObserver::new();
    let c = TestObserver::new();

    channel.set_primary_activity(Activity::new("SpeechSynthesizer", as_channel_observer(&a)));
    channel.set_primary_activity(
        Activity::new("Alert", as_channel_observer(&b)).with_patience(Duration::from_secs(10)),
    );
    a.expect_no_change();

    // a third activity interrupts long before the 10s grace window lapses:
    // the receiver is released right away, and the displaced primary (the
    // old initiator) falls to the immediate-release rule
    channel.set_primary_activity(Activity::new("AudioPlayer", as_channel_observer(&c)));
    a.expect_change(FocusState::None, MixingBehavior::MustStop);
    b.expect_change(FocusState::None, MixingBehavior::MustStop);
    assert_eq!(channel.interface_list(), vec!["AudioPlayer".to_string()]);

    a.expect_no_change();
    b.expect_no_change();
    c.expect_no_change();
}

#[test]
fn same_interface_reacquire_bypasses_patience() {
    helpers::setup_tracing();
    let channel = Channel::new("Dialog", 100);
    let first = TestObserver::new();
    let second = TestObserver::new();

    channel.set_primary_activity(Activity::new("SpeechSynthesizer", as_channel_observer(&first)));
    // even though the newcomer declares patience, a same-interface
    // re-acquire releases the old claim outright
    channel.set_primary_activity(
        Activity::new("SpeechSynthesizer", as_channel_observer(&second))
            .with_patience(Duration::from_secs(10)),
    );
    first.expect_change(FocusState::None, MixingBehavior::MustStop);
    assert_eq!(channel.interface_list(), vec!["SpeechSynthesizer".to_string()]);

    let updates = channel.activity_updates();
    let nones: Vec<_> = updates
        .iter()
        .filter(|u| u.focus_state == FocusState::None)
        .collect();
    assert_eq!(nones.len(), 1, "exactly one idle record for the old claim");
}

#[test]
fn receiver_released_during_grace_stops_the_timer() {
    helpers::setup_tracing();
    let channel = Channel::new("Dialog", 100);
    let a = TestObserver::new();
    let b = TestObserver::new();

    channel.set_primary_activity(Activity::new("SpeechSynthesizer", as_channel_observer(&a)));
    channel.set_primary_activity(
        Activity::new("Alert", as_channel_observer(&b)).with_patience(PATIENCE),
    );

    assert!(channel.release_activity("SpeechSynthesizer"));
    a.expect_change(FocusState::None, MixingBehavior::MustStop);
    a.expect_no_change();

    // the grace window lapsing later must not produce anything further
    std::thread::sleep(PATIENCE + Duration::from_millis(100));
    a.expect_no_change();
    b.expect_no_change();
    assert_eq!(channel.interface_list(), vec!["Alert".to_string()]);
}

#[test]
fn single_primary_after_churn() {
    helpers::setup_tracing();
    let channel = Channel::new("Dialog", 100);
    let observers: Vec<_> = (0..4).map(|_| TestObserver::new()).collect();

    for (index, observer) in observers.iter().enumerate() {
        channel.set_primary_activity(Activity::new(
            format!("Interface{index}"),
            as_channel_observer(observer),
        ));
    }
    // every displaced claim was released on the spot
    for observer in &observers[..3] {
        observer.expect_change(FocusState::None, MixingBehavior::MustStop);
        observer.expect_no_change();
    }
    assert_eq!(channel.interface_list(), vec!["Interface3".to_string()]);

    assert!(channel.release_activity("Interface3"));
    observers[3].expect_change(FocusState::None, MixingBehavior::MustStop);
    assert!(!channel.is_active());
    assert_eq!(channel.state().focus_state, FocusState::None);
}

#[test]
fn end_to_end_dialog_scenario() {
    helpers::setup_tracing();
    let manager = FocusManager::new(vec![ChannelConfig::new("Dialog", 100)], Vec::new(), None);
    let x = TestObserver::new();
    let y = TestObserver::new();

    assert!(manager.acquire_channel(
        "Dialog",
        Activity::new("SpeechSynthesizer", as_channel_observer(&x))
    ));
    x.expect_change(FocusState::Foreground, MixingBehavior::Unrestricted);

    assert!(manager.acquire_channel(
        "Dialog",
        Activity::new("Alert", as_channel_observer(&y)).with_patience(PATIENCE)
    ));
    // the newcomer is foregrounded at acquire time
    y.expect_change(FocusState::Foreground, MixingBehavior::Unrestricted);
    // the displaced primary is backgrounded but not yet stopped
    x.expect_change(FocusState::Background, MixingBehavior::MustPause);
    x.expect_no_change();

    // the grace window lapses with no further calls
    x.expect_change(FocusState::None, MixingBehavior::MustStop);
    x.expect_no_change();
    y.expect_no_change();
}
