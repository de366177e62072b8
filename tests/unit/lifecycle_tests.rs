//! Kernel lifecycle transitions.

use slack_kernel_relay::models::lifecycle::KernelState;

#[test]
fn happy_path_is_linear() {
    let path = [
        KernelState::NotStarted,
        KernelState::Launching,
        KernelState::AwaitingConnection,
        KernelState::Ready,
        KernelState::Serving,
        KernelState::Stopping,
        KernelState::Stopped,
    ];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
}

#[test]
fn steps_cannot_be_skipped() {
    assert!(!KernelState::NotStarted.can_transition_to(KernelState::Ready));
    assert!(!KernelState::Launching.can_transition_to(KernelState::Serving));
    assert!(!KernelState::Serving.can_transition_to(KernelState::Stopped));
}

#[test]
fn any_live_state_can_crash() {
    for state in [
        KernelState::Launching,
        KernelState::AwaitingConnection,
        KernelState::Ready,
        KernelState::Serving,
        KernelState::Stopping,
    ] {
        assert!(state.can_transition_to(KernelState::Crashed), "{state}");
    }
}

#[test]
fn terminal_states_are_final() {
    for terminal in [KernelState::Stopped, KernelState::Crashed] {
        assert!(terminal.is_terminal());
        assert!(!terminal.can_transition_to(KernelState::Launching));
        assert!(!terminal.can_transition_to(KernelState::Stopping));
    }
}

#[test]
fn names_are_snake_case() {
    assert_eq!(KernelState::NotStarted.to_string(), "not_started");
    assert_eq!(KernelState::AwaitingConnection.as_str(), "awaiting_connection");
    assert_eq!(KernelState::Serving.as_str(), "serving");
}
