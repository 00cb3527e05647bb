//! The shared lifecycle state machine for queues and partitions
//!
//! Both object kinds share one transition table. An event that lands on the
//! state the object is already in is silently accepted so callers can drive
//! transitions without checking first.

use chrono::{DateTime, Utc};

use crate::Error;

/// The lifecycle states of a scheduled object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// The object exists but has not been used yet
    New,
    /// The object takes part in scheduling
    Active,
    /// The object is being removed and only drains existing work
    Draining,
    /// The object takes no part in scheduling at all
    Stopped,
}

impl ObjectState {
    /// Get this state as a str for info exports
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::New => "New",
            ObjectState::Active => "Active",
            ObjectState::Draining => "Draining",
            ObjectState::Stopped => "Stopped",
        }
    }
}

/// The lifecycle events an object can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEvent {
    /// Put the object into active scheduling
    Start,
    /// Mark the object for removal and let it drain
    Remove,
    /// Take the object out of scheduling entirely
    Stop,
}

/// The transitions the shared table allows
const TRANSITIONS: [(ObjectState, ObjectEvent, ObjectState); 3] = [
    (ObjectState::New, ObjectEvent::Start, ObjectState::Active),
    (ObjectState::New, ObjectEvent::Remove, ObjectState::Draining),
    (ObjectState::Active, ObjectEvent::Remove, ObjectState::Draining),
];

/// The extra transitions that are legal from any state
const ANY_STATE: [(ObjectEvent, ObjectState); 1] = [(ObjectEvent::Stop, ObjectState::Stopped)];

/// A lifecycle state with the time of its last change
#[derive(Debug, Clone)]
pub struct StateMachine {
    /// The current state
    current: ObjectState,
    /// When the state last changed
    state_time: DateTime<Utc>,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

impl StateMachine {
    /// Create a new state machine in the New state
    #[must_use]
    pub fn new() -> Self {
        StateMachine {
            current: ObjectState::New,
            state_time: Utc::now(),
        }
    }

    /// Get the current state
    #[must_use]
    pub fn current(&self) -> ObjectState {
        self.current
    }

    /// Get the time the state last changed
    #[must_use]
    pub fn state_time(&self) -> DateTime<Utc> {
        self.state_time
    }

    /// Check if this object takes part in scheduling
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current == ObjectState::Active
    }

    /// Check if this object only drains existing work
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.current == ObjectState::Draining
    }

    /// Check if this object is out of scheduling entirely
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.current == ObjectState::Stopped
    }

    /// Drive a lifecycle event through the transition table
    ///
    /// An event that maps onto the current state is accepted without a
    /// change. An event with no transition from the current state fails.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to handle
    pub fn handle(&mut self, event: ObjectEvent) -> Result<(), Error> {
        // find the target state in the shared table
        let target = TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == self.current && *on == event)
            .map(|(_, _, to)| *to)
            .or_else(|| {
                ANY_STATE
                    .iter()
                    .find(|(on, _)| *on == event)
                    .map(|(_, to)| *to)
            });
        match target {
            Some(next) if next == self.current => Ok(()),
            Some(next) => {
                self.current = next;
                self.state_time = Utc::now();
                Ok(())
            }
            // a repeated event that already ran is a silent noop
            None if self.repeats(event) => Ok(()),
            None => Err(Error::State(format!(
                "no transition for {:?} from {:?}",
                event, self.current
            ))),
        }
    }

    /// Check if an event would only repeat the transition that led here
    ///
    /// # Arguments
    ///
    /// * `event` - The event to check
    fn repeats(&self, event: ObjectEvent) -> bool {
        matches!(
            (self.current, event),
            (ObjectState::Active, ObjectEvent::Start)
                | (ObjectState::Draining, ObjectEvent::Remove)
                | (ObjectState::Stopped, ObjectEvent::Stop)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut state = StateMachine::new();
        assert_eq!(state.current(), ObjectState::New);
        state.handle(ObjectEvent::Start).unwrap();
        assert!(state.is_running());
        state.handle(ObjectEvent::Remove).unwrap();
        assert!(state.is_draining());
        state.handle(ObjectEvent::Stop).unwrap();
        assert!(state.is_stopped());
    }

    #[test]
    fn repeated_events_are_idempotent() {
        let mut state = StateMachine::new();
        state.handle(ObjectEvent::Start).unwrap();
        state.handle(ObjectEvent::Start).unwrap();
        state.handle(ObjectEvent::Remove).unwrap();
        state.handle(ObjectEvent::Remove).unwrap();
        state.handle(ObjectEvent::Stop).unwrap();
        state.handle(ObjectEvent::Stop).unwrap();
        assert!(state.is_stopped());
    }

    #[test]
    fn stop_is_legal_from_any_state() {
        let mut state = StateMachine::new();
        state.handle(ObjectEvent::Stop).unwrap();
        assert!(state.is_stopped());
    }

    #[test]
    fn start_after_stop_is_rejected() {
        let mut state = StateMachine::new();
        state.handle(ObjectEvent::Stop).unwrap();
        assert!(state.handle(ObjectEvent::Start).is_err());
    }

    #[test]
    fn state_time_moves_on_transition() {
        let mut state = StateMachine::new();
        let before = state.state_time();
        state.handle(ObjectEvent::Start).unwrap();
        assert!(state.state_time() >= before);
    }
}
