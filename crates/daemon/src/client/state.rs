//! Client connection state machine

use super::ClientError;
use std::fmt;

/// Lifecycle of one client connection
///
/// ```text
/// Command ──Listen──▶ Listen
///    │
///    └─Connect──▶ Connecting1 ──fail──▶ Command
///                     │
///                     └─ok──▶ Connecting2 ──reply flushed──▶ Connected
/// ```
///
/// Every state except `Dead` may move to `Dead` when the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Waiting for a request
    Command,
    /// Receiving device notifications
    Listen,
    /// Connect request handed to the device manager, result pending
    Connecting1,
    /// Connect succeeded, result reply still flushing
    Connecting2,
    /// Socket I/O belongs to the device manager
    Connected,
    /// Being torn down
    Dead,
}

impl ClientState {
    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;

        matches!(
            (self, next),
            (Command, Listen)
                | (Command, Connecting1)
                | (Connecting1, Command)
                | (Connecting1, Connecting2)
                | (Connecting2, Connected)
        ) || (self != Dead && next == Dead)
    }

    /// Validated transition
    pub fn transition(self, next: ClientState) -> Result<ClientState, ClientError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ClientError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Command => "COMMAND",
            ClientState::Listen => "LISTEN",
            ClientState::Connecting1 => "CONNECTING1",
            ClientState::Connecting2 => "CONNECTING2",
            ClientState::Connected => "CONNECTED",
            ClientState::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientState::*;

    const ALL: [ClientState; 6] = [Command, Listen, Connecting1, Connecting2, Connected, Dead];

    #[test]
    fn test_connect_chains() {
        assert_eq!(Command.transition(Connecting1).unwrap(), Connecting1);
        assert_eq!(Connecting1.transition(Command).unwrap(), Command);
        assert_eq!(Connecting1.transition(Connecting2).unwrap(), Connecting2);
        assert_eq!(Connecting2.transition(Connected).unwrap(), Connected);
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(Command.transition(Connected).is_err());
        assert!(Command.transition(Connecting2).is_err());
        assert!(Listen.transition(Command).is_err());
        assert!(Listen.transition(Connecting1).is_err());
        assert!(Connected.transition(Command).is_err());
        assert!(Connecting2.transition(Command).is_err());

        let err = Connected.transition(Listen).unwrap_err();
        assert!(matches!(
            err,
            ClientError::IllegalTransition {
                from: Connected,
                to: Listen
            }
        ));
    }

    #[test]
    fn test_everything_can_die_once() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Dead), state != Dead, "{}", state);
        }
        for state in ALL {
            assert!(!Dead.can_transition_to(state));
        }
    }
}
