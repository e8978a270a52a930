//! Call lifecycle: statuses, actions, and the transition table.
//!
//! ```text
//! initiated ──ring──▶ ringing ──accept──▶ connected ──hangup──▶ ended
//!     │                  │
//!     ├──accept──────────┼──────────────▶ connected
//!     ├──reject──────────┴──────────────▶ rejected
//!     └──hangup / timeout (either) ─────▶ missed
//! ```
//!
//! `ended`, `missed`, `rejected` and `busy` are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted call status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, invite sent.
    Initiated,
    /// Callee's device acknowledged the invite.
    Ringing,
    /// Both sides are in the call.
    Connected,
    /// A connected call was hung up.
    Ended,
    /// Never connected: timed out or abandoned.
    Missed,
    /// Callee declined.
    Rejected,
    /// Callee was busy.
    Busy,
}

impl CallStatus {
    /// Statuses that still hold a participant "in a call".
    pub const ACTIVE: [CallStatus; 3] = [Self::Initiated, Self::Ringing, Self::Connected];

    /// Whether no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Missed | Self::Rejected | Self::Busy)
    }

    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "ringing" => Ok(Self::Ringing),
            "connected" => Ok(Self::Connected),
            "ended" => Ok(Self::Ended),
            "missed" => Ok(Self::Missed),
            "rejected" => Ok(Self::Rejected),
            "busy" => Ok(Self::Busy),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// Which side of the call an actor is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Started the call.
    Caller,
    /// Was called.
    Callee,
}

/// Something that can happen to a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallAction {
    /// Callee's device is ringing.
    Ring,
    /// Callee picks up.
    Accept,
    /// Callee declines.
    Reject,
    /// Either side leaves.
    Hangup,
    /// Nobody answered in time (system-triggered).
    Timeout,
    /// Relay a signaling payload. Does not change status.
    Signal,
}

impl CallAction {
    /// Whether a participant in `role` may perform this action.
    /// `Timeout` is never performed by a participant.
    pub fn permits(self, role: Role) -> bool {
        match self {
            Self::Ring | Self::Accept | Self::Reject => role == Role::Callee,
            Self::Hangup | Self::Signal => true,
            Self::Timeout => false,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ring => "ring",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Hangup => "hangup",
            Self::Timeout => "time out",
            Self::Signal => "signal",
        }
    }
}

impl fmt::Display for CallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call left the active states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Caller hung up (or cancelled before an answer).
    CallerHangup,
    /// Callee hung up or declined.
    CalleeHangup,
    /// Nobody answered in time.
    Timeout,
}

impl EndReason {
    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallerHangup => "caller_hangup",
            Self::CalleeHangup => "callee_hangup",
            Self::Timeout => "timeout",
        }
    }

    /// The reason recorded when `role` hangs up.
    pub fn hangup_by(role: Role) -> Self {
        match role {
            Role::Caller => Self::CallerHangup,
            Role::Callee => Self::CalleeHangup,
        }
    }
}

impl FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller_hangup" => Ok(Self::CallerHangup),
            "callee_hangup" => Ok(Self::CalleeHangup),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown end reason: {other}")),
        }
    }
}

/// The transition table. Returns the next status, or `None` if `action` is
/// illegal from `from`.
pub fn transition(from: CallStatus, action: CallAction) -> Option<CallStatus> {
    use CallAction as A;
    use CallStatus as S;

    match (from, action) {
        (S::Initiated, A::Ring) => Some(S::Ringing),
        (S::Initiated | S::Ringing, A::Accept) => Some(S::Connected),
        (S::Initiated | S::Ringing, A::Reject) => Some(S::Rejected),
        (S::Connected, A::Hangup) => Some(S::Ended),
        (S::Initiated | S::Ringing, A::Hangup | A::Timeout) => Some(S::Missed),
        (S::Initiated | S::Ringing | S::Connected, A::Signal) => Some(from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [CallStatus; 7] = [
        CallStatus::Initiated,
        CallStatus::Ringing,
        CallStatus::Connected,
        CallStatus::Ended,
        CallStatus::Missed,
        CallStatus::Rejected,
        CallStatus::Busy,
    ];

    const ALL_ACTIONS: [CallAction; 6] = [
        CallAction::Ring,
        CallAction::Accept,
        CallAction::Reject,
        CallAction::Hangup,
        CallAction::Timeout,
        CallAction::Signal,
    ];

    #[test]
    fn terminal_statuses_reject_every_action() {
        for status in ALL_STATUSES.iter().filter(|s| s.is_terminal()) {
            for action in ALL_ACTIONS {
                assert_eq!(transition(*status, action), None, "{status} + {action}");
            }
        }
    }

    #[test]
    fn ring_only_from_initiated() {
        assert_eq!(
            transition(CallStatus::Initiated, CallAction::Ring),
            Some(CallStatus::Ringing)
        );
        assert_eq!(transition(CallStatus::Ringing, CallAction::Ring), None);
        assert_eq!(transition(CallStatus::Connected, CallAction::Ring), None);
    }

    #[test]
    fn hangup_outcome_depends_on_connection() {
        assert_eq!(
            transition(CallStatus::Connected, CallAction::Hangup),
            Some(CallStatus::Ended)
        );
        assert_eq!(
            transition(CallStatus::Ringing, CallAction::Hangup),
            Some(CallStatus::Missed)
        );
        assert_eq!(
            transition(CallStatus::Initiated, CallAction::Hangup),
            Some(CallStatus::Missed)
        );
    }

    #[test]
    fn timeout_not_allowed_once_connected() {
        assert_eq!(transition(CallStatus::Connected, CallAction::Timeout), None);
        assert_eq!(
            transition(CallStatus::Ringing, CallAction::Timeout),
            Some(CallStatus::Missed)
        );
    }

    #[test]
    fn signal_keeps_status() {
        for status in CallStatus::ACTIVE {
            assert_eq!(transition(status, CallAction::Signal), Some(status));
        }
    }

    #[test]
    fn only_active_statuses_have_outgoing_transitions() {
        for status in ALL_STATUSES {
            let any = ALL_ACTIONS.iter().any(|a| transition(status, *a).is_some());
            assert_eq!(any, CallStatus::ACTIVE.contains(&status));
        }
    }

    #[test]
    fn callee_only_actions() {
        for action in [CallAction::Ring, CallAction::Accept, CallAction::Reject] {
            assert!(action.permits(Role::Callee));
            assert!(!action.permits(Role::Caller));
        }
        assert!(CallAction::Hangup.permits(Role::Caller));
        assert!(CallAction::Signal.permits(Role::Callee));
        assert!(!CallAction::Timeout.permits(Role::Caller));
    }

    #[test]
    fn status_string_roundtrip() {
        for status in ALL_STATUSES {
            assert_eq!(status.as_str().parse::<CallStatus>().unwrap(), status);
        }
        assert!("dialing".parse::<CallStatus>().is_err());
    }

    #[test]
    fn end_reason_by_role() {
        assert_eq!(EndReason::hangup_by(Role::Caller), EndReason::CallerHangup);
        assert_eq!(EndReason::hangup_by(Role::Callee).as_str(), "callee_hangup");
        assert_eq!(
            serde_json::to_value(EndReason::Timeout).unwrap(),
            serde_json::json!("timeout")
        );
    }
}
