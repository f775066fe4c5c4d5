//! Presence client states and disconnect classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current state of a presence client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    #[default]
    Disconnected,
    Connecting,
    OccupancyCheck,
    Active,
    Disconnecting,
    Reconnecting,
}

impl PresenceState {
    /// Whether a connection handle may exist in this state.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::OccupancyCheck | Self::Active)
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::OccupancyCheck => "occupancy-check",
            Self::Active => "active",
            Self::Disconnecting => "disconnecting",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Why a connection ended. Drives the follow-up action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// An operator or owner asked the client to stop.
    RequestedStop,
    /// Torn down as part of an explicit reconnect.
    ReconnectRequested,
    /// The remote server removed the client.
    RemoteKick(String),
    /// The transport or protocol failed.
    RemoteError(String),
    /// Other participants were present.
    NotEmpty,
    /// Anything not classified above.
    Unknown(String),
}

/// What the client does after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Stay disconnected.
    None,
    /// Poll occupancy and rejoin once the server is empty.
    RejoinWhenEmpty,
    /// Reconnect after the configured delay.
    Reconnect,
}

impl DisconnectReason {
    /// Follow-up action under the given policy switches.
    #[must_use]
    pub fn follow_up(&self, reconnect_enabled: bool, occupancy_enabled: bool) -> FollowUp {
        match self {
            Self::RequestedStop | Self::ReconnectRequested => FollowUp::None,
            Self::NotEmpty if occupancy_enabled => FollowUp::RejoinWhenEmpty,
            Self::NotEmpty => FollowUp::None,
            _ if reconnect_enabled => FollowUp::Reconnect,
            _ => FollowUp::None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestedStop => f.write_str("requested stop"),
            Self::ReconnectRequested => f.write_str("reconnect"),
            Self::RemoteKick(detail) => write!(f, "kicked: {detail}"),
            Self::RemoteError(detail) => write!(f, "error: {detail}"),
            Self::NotEmpty => f.write_str("notEmpty"),
            Self::Unknown(detail) => f.write_str(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_stop_never_reconnects() {
        for reconnect in [true, false] {
            for occupancy in [true, false] {
                assert_eq!(
                    DisconnectReason::RequestedStop.follow_up(reconnect, occupancy),
                    FollowUp::None
                );
                assert_eq!(
                    DisconnectReason::ReconnectRequested.follow_up(reconnect, occupancy),
                    FollowUp::None
                );
            }
        }
    }

    #[test]
    fn not_empty_follows_occupancy_policy() {
        assert_eq!(
            DisconnectReason::NotEmpty.follow_up(false, true),
            FollowUp::RejoinWhenEmpty
        );
        assert_eq!(
            DisconnectReason::NotEmpty.follow_up(true, false),
            FollowUp::None
        );
    }

    #[test]
    fn other_reasons_follow_reconnect_policy() {
        let reasons = [
            DisconnectReason::RemoteKick("bye".to_string()),
            DisconnectReason::RemoteError("reset".to_string()),
            DisconnectReason::Unknown("?".to_string()),
        ];
        for reason in reasons {
            assert_eq!(reason.follow_up(true, false), FollowUp::Reconnect);
            assert_eq!(reason.follow_up(false, true), FollowUp::None);
        }
    }

    #[test]
    fn reason_display() {
        assert_eq!(DisconnectReason::NotEmpty.to_string(), "notEmpty");
        assert_eq!(
            DisconnectReason::RemoteKick("Server closed".to_string()).to_string(),
            "kicked: Server closed"
        );
    }

    #[test]
    fn connected_states() {
        assert!(PresenceState::Active.is_connected());
        assert!(PresenceState::OccupancyCheck.is_connected());
        assert!(!PresenceState::Reconnecting.is_connected());
        assert_eq!(PresenceState::default(), PresenceState::Disconnected);
    }
}
