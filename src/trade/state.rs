//! Intent-level state machine, with this transition graph:
//!
//! ```text
//! NEW -> RISK_APPROVED -> SUBMITTING -> SUBMITTED -> PARTIALLY_FILLED -> FILLED
//!                               |             |              |
//!                          SUBMIT_UNKNOWN  CANCEL_PENDING -> CANCELLED
//!                               |
//!                          REJECTED (also reachable from NEW, SUBMITTING)
//! ```

use std::fmt;

/// Intent lifecycle state. Mirrors the reference's `repr(i16)` discipline so
/// the state is a small, orderable, directly-storable value rather than a
/// string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum IntentState {
    New = 0,
    RiskApproved = 10,
    Submitting = 20,
    Submitted = 30,
    PartiallyFilled = 35,
    SubmitUnknown = 40,
    CancelPending = 50,
    Filled = 100,
    Cancelled = 110,
    Rejected = -10,
}

impl IntentState {
    /// Terminal states: no transition leads out of them.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentState::Filled | IntentState::Cancelled | IntentState::Rejected)
    }

    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::New => "NEW",
            IntentState::RiskApproved => "RISK_APPROVED",
            IntentState::Submitting => "SUBMITTING",
            IntentState::Submitted => "SUBMITTED",
            IntentState::PartiallyFilled => "PARTIALLY_FILLED",
            IntentState::SubmitUnknown => "SUBMIT_UNKNOWN",
            IntentState::CancelPending => "CANCEL_PENDING",
            IntentState::Filled => "FILLED",
            IntentState::Cancelled => "CANCELLED",
            IntentState::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
