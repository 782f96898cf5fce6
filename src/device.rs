//! The sequence of device identities presented to the host.
//!
//! ```text
//! Init -> Device0Connected -> Device0Ready -> Device0Disconnected
//!      -> Device1Connected -> Device1Ready -> Device1Disconnected
//!      -> Device2Connected
//! ```
//!
//! Every transition is a single step to the successor, so no state is
//! skipped and none is revisited within a run.

use crate::blueprint;
use crate::ch9::{ControlRequest, Speed};
use std::time::Duration;

/// Delay between a successful `SET_CONFIGURATION` and the disconnect.
pub const READY_DELAY: Duration = Duration::from_millis(200);
/// How long the device stays disconnected before presenting the next identity.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    Device0Connected,
    Device0Ready,
    Device0Disconnected,
    Device1Connected,
    Device1Ready,
    Device1Disconnected,
    Device2Connected,
}

impl State {
    /// The unique successor, `None` for the terminal state.
    pub fn successor(self) -> Option<State> {
        use State::*;
        match self {
            Init => Some(Device0Connected),
            Device0Connected => Some(Device0Ready),
            Device0Ready => Some(Device0Disconnected),
            Device0Disconnected => Some(Device1Connected),
            Device1Connected => Some(Device1Ready),
            Device1Ready => Some(Device1Disconnected),
            Device1Disconnected => Some(Device2Connected),
            Device2Connected => None,
        }
    }

    /// The identity presented over the wire in this state.
    pub fn identity(self) -> Option<Identity> {
        match self {
            State::Device0Connected => Some(Identity::Device0),
            State::Device1Connected => Some(Identity::Device1),
            State::Device2Connected => Some(Identity::Device2),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successor().is_none()
    }
}

/// One of the three personas presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    Device0,
    Device1,
    Device2,
}

impl Identity {
    /// `bNumConfigurations` reported by this identity.
    pub fn configuration_count(self) -> u8 {
        blueprint::table(self).len() as u8
    }

    /// Recovers the identity from a device descriptor read by a host.
    pub fn from_configuration_count(count: u8) -> Option<Identity> {
        [Identity::Device0, Identity::Device1, Identity::Device2]
            .iter()
            .copied()
            .find(|identity| identity.configuration_count() == count)
    }
}

/// What the controller has to do after the state timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Drop the pull-up and fire the timer again after `rearm`.
    Disconnect { rearm: Duration },
    /// Raise the pull-up, presenting the next identity.
    Connect,
}

#[derive(Debug)]
pub struct DeviceStateMachine {
    state: State,
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        DeviceStateMachine { state: State::Init }
    }
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Moves to the successor state.
    fn advance(&mut self) {
        if let Some(next) = self.state.successor() {
            log::debug!("state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// The first SETUP packet arrived. Returns whether this started a run.
    pub fn attach(&mut self) -> bool {
        if self.state == State::Init {
            self.advance();
            return true;
        }
        false
    }

    /// The host accepted `SET_CONFIGURATION`.
    ///
    /// Returns the delay after which the state timer has to fire, `None` if
    /// the current state does not react to configuration.
    pub fn configured(&mut self) -> Option<Duration> {
        match self.state {
            State::Device0Connected | State::Device1Connected => {
                self.advance();
                Some(READY_DELAY)
            }
            _ => None,
        }
    }

    /// The state timer fired.
    pub fn timer_expired(&mut self) -> Option<Action> {
        match self.state {
            State::Device0Ready | State::Device1Ready => {
                self.advance();
                Some(Action::Disconnect {
                    rearm: RECONNECT_DELAY,
                })
            }
            State::Device0Disconnected | State::Device1Disconnected => {
                self.advance();
                Some(Action::Connect)
            }
            state => {
                log::error!("state timer fired in invalid state {:?}", state);
                None
            }
        }
    }

    /// The host went away while an identity was presented; the run is lost.
    ///
    /// Returns whether anything was abandoned.
    pub fn restart(&mut self) -> bool {
        if self.state.identity().is_some() {
            log::warn!("host left during {:?}, starting over", self.state);
            self.state = State::Init;
            return true;
        }
        false
    }
}

/// Everything the core knows about the ongoing exchange with the host.
///
/// Owned by the control transfer engine; the responder and the state
/// machine only ever see it through references handed out by the engine.
#[derive(Debug)]
pub struct Session {
    pub machine: DeviceStateMachine,
    /// The request whose transfer is in flight.
    pub request: Option<ControlRequest>,
    /// Speed of the current link.
    pub speed: Speed,
    /// Address to apply once the status stage of `SET_ADDRESS` completes.
    pub pending_address: Option<u8>,
}

impl Session {
    pub fn new(speed: Speed) -> Self {
        Session {
            machine: DeviceStateMachine::new(),
            request: None,
            speed,
            pending_address: None,
        }
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the machine the way the engine does and records the states.
    fn full_run(machine: &mut DeviceStateMachine) -> Vec<State> {
        let mut trace = vec![machine.state()];
        assert!(machine.attach());
        trace.push(machine.state());
        for _ in 0..2 {
            assert_eq!(machine.configured(), Some(READY_DELAY));
            trace.push(machine.state());
            assert_eq!(
                machine.timer_expired(),
                Some(Action::Disconnect {
                    rearm: RECONNECT_DELAY
                })
            );
            trace.push(machine.state());
            assert_eq!(machine.timer_expired(), Some(Action::Connect));
            trace.push(machine.state());
        }
        trace
    }

    #[test]
    fn test_trace_follows_successors() {
        let mut machine = DeviceStateMachine::new();
        let trace = full_run(&mut machine);
        for pair in trace.windows(2) {
            assert_eq!(pair[0].successor(), Some(pair[1]));
        }
        assert_eq!(machine.state(), State::Device2Connected);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_terminal_needs_two_cycles() {
        let mut machine = DeviceStateMachine::new();
        machine.attach();
        machine.configured();
        machine.timer_expired();
        machine.timer_expired();
        assert_eq!(machine.state(), State::Device1Connected);

        machine.configured();
        machine.timer_expired();
        assert_eq!(machine.state(), State::Device1Disconnected);
        machine.timer_expired();
        assert_eq!(machine.state(), State::Device2Connected);
    }

    #[test]
    fn test_terminal_state_ignores_everything() {
        let mut machine = DeviceStateMachine::new();
        full_run(&mut machine);
        assert!(!machine.attach());
        assert_eq!(machine.configured(), None);
        assert_eq!(machine.timer_expired(), None);
        assert_eq!(machine.state(), State::Device2Connected);
    }

    #[test]
    fn test_spurious_events_do_not_move() {
        let mut machine = DeviceStateMachine::new();
        assert_eq!(machine.configured(), None);
        assert_eq!(machine.timer_expired(), None);
        assert_eq!(machine.state(), State::Init);

        machine.attach();
        assert!(!machine.attach());
        assert_eq!(machine.timer_expired(), None);
        assert_eq!(machine.state(), State::Device0Connected);

        machine.configured();
        assert_eq!(machine.configured(), None);
        assert_eq!(machine.state(), State::Device0Ready);
    }

    #[test]
    fn test_restart_only_while_presenting() {
        let mut machine = DeviceStateMachine::new();
        assert!(!machine.restart());

        machine.attach();
        machine.configured();
        assert!(!machine.restart());
        assert_eq!(machine.state(), State::Device0Ready);

        machine.timer_expired();
        machine.timer_expired();
        assert!(machine.restart());
        assert_eq!(machine.state(), State::Init);
    }

    #[test]
    fn test_identity_from_configuration_count() {
        assert_eq!(Identity::from_configuration_count(7), Some(Identity::Device0));
        assert_eq!(Identity::from_configuration_count(1), Some(Identity::Device1));
        assert_eq!(Identity::from_configuration_count(3), Some(Identity::Device2));
        assert_eq!(Identity::from_configuration_count(2), None);
    }
}
