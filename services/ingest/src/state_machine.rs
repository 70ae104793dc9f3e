//! Wake lifecycle states and the legal transition table.
//!
//! The protocol drives every wake through
//! `hello_received → ack_sent → snap_sent → metadata_received → complete`,
//! with two side exits: `sleep_only` (unmapped or unapproved device, straight
//! from `hello_received`) and `failed` (from any in-flight state).  Any edge
//! not in the table is rejected loudly instead of being silently recorded.

use std::fmt;
use std::str::FromStr;

/// Protocol state of a wake event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    HelloReceived,
    AckSent,
    SnapSent,
    MetadataReceived,
    Complete,
    SleepOnly,
    Failed,
}

/// A transition not present in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal protocol transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ProtocolState,
    pub to: ProtocolState,
}

/// A state string in the store that no variant matches.
#[derive(Debug, thiserror::Error)]
#[error("unknown protocol state '{0}'")]
pub struct UnknownState(pub String);

impl ProtocolState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolState::HelloReceived => "hello_received",
            ProtocolState::AckSent => "ack_sent",
            ProtocolState::SnapSent => "snap_sent",
            ProtocolState::MetadataReceived => "metadata_received",
            ProtocolState::Complete => "complete",
            ProtocolState::SleepOnly => "sleep_only",
            ProtocolState::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProtocolState::Complete | ProtocolState::SleepOnly | ProtocolState::Failed
        )
    }

    /// Whether `self -> to` is in the transition table.
    pub fn can_advance_to(self, to: ProtocolState) -> bool {
        use ProtocolState::{
            AckSent, Complete, Failed, HelloReceived, MetadataReceived, SleepOnly, SnapSent,
        };
        matches!(
            (self, to),
            (HelloReceived, AckSent)
                | (HelloReceived, SleepOnly)
                | (AckSent, SnapSent)
                | (SnapSent, MetadataReceived)
                | (MetadataReceived, Complete)
                | (
                    HelloReceived | AckSent | SnapSent | MetadataReceived,
                    Failed
                )
        )
    }

    /// Validate and perform a transition.
    pub fn advance(self, to: ProtocolState) -> Result<ProtocolState, IllegalTransition> {
        if self.can_advance_to(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, UnknownState> {
        match s {
            "hello_received" => Ok(ProtocolState::HelloReceived),
            "ack_sent" => Ok(ProtocolState::AckSent),
            "snap_sent" => Ok(ProtocolState::SnapSent),
            "metadata_received" => Ok(ProtocolState::MetadataReceived),
            "complete" => Ok(ProtocolState::Complete),
            "sleep_only" => Ok(ProtocolState::SleepOnly),
            "failed" => Ok(ProtocolState::Failed),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolState::{
        AckSent, Complete, Failed, HelloReceived, MetadataReceived, SleepOnly, SnapSent,
    };

    #[test]
    fn happy_path_transitions_are_legal() {
        assert_eq!(HelloReceived.advance(AckSent).unwrap(), AckSent);
        assert_eq!(AckSent.advance(SnapSent).unwrap(), SnapSent);
        assert_eq!(SnapSent.advance(MetadataReceived).unwrap(), MetadataReceived);
        assert_eq!(MetadataReceived.advance(Complete).unwrap(), Complete);
    }

    #[test]
    fn unmapped_device_exits_from_hello_only() {
        assert!(HelloReceived.advance(SleepOnly).is_ok());
        assert!(AckSent.advance(SleepOnly).is_err());
        assert!(SnapSent.advance(SleepOnly).is_err());
        assert!(MetadataReceived.advance(SleepOnly).is_err());
    }

    #[test]
    fn any_in_flight_state_can_fail() {
        for s in [HelloReceived, AckSent, SnapSent, MetadataReceived] {
            assert!(s.advance(Failed).is_ok());
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for s in [Complete, SleepOnly, Failed] {
            assert!(s.is_terminal());
            for to in [HelloReceived, AckSent, SnapSent, MetadataReceived, Complete, SleepOnly, Failed] {
                assert!(s.advance(to).is_err());
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(HelloReceived.advance(SnapSent).is_err());
        assert!(AckSent.advance(MetadataReceived).is_err());
        assert!(SnapSent.advance(Complete).is_err());
    }

    #[test]
    fn state_strings_round_trip() {
        for s in [HelloReceived, AckSent, SnapSent, MetadataReceived, Complete, SleepOnly, Failed] {
            assert_eq!(s.as_str().parse::<super::ProtocolState>().unwrap(), s);
        }
        assert!("woke_up".parse::<super::ProtocolState>().is_err());
    }
}
