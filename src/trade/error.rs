//! Trade-domain error taxonomy, following the reference's flat
//! `thiserror` enum + stable `code()` idiom (`transfer/error.rs`).

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TradeError {
    #[error("intent not found: {0}")]
    IntentNotFound(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("lease for intent {intent_id} is held by {held_by}")]
    LeaseLost { intent_id: String, held_by: String },

    #[error("fill for order {order_id} conflicts with an existing fill sharing the same natural key (qty/price mismatch)")]
    FillConflict { order_id: String },

    #[error("reconciliation is ambiguous for intent {0}, no automated decision possible")]
    ReconcileAmbiguous(String),

    #[error("duplicate broker_order_id {0} observed for a different order")]
    DuplicateBrokerOrderId(String),

    #[error("invalid state transition on intent {intent_id}: {from} -> {attempted}")]
    InvalidTransition {
        intent_id: String,
        from: &'static str,
        attempted: &'static str,
    },

    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),
}

impl TradeError {
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::IntentNotFound(_) => "INTENT_NOT_FOUND",
            TradeError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            TradeError::LeaseLost { .. } => "LEASE_LOST",
            TradeError::FillConflict { .. } => "FILL_CONFLICT",
            TradeError::ReconcileAmbiguous(_) => "RECONCILE_AMBIGUOUS",
            TradeError::DuplicateBrokerOrderId(_) => "DUPLICATE_BROKER_ORDER_ID",
            TradeError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            TradeError::Bus(_) => "BUS_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(TradeError::IntentNotFound("I1".into()).code(), "INTENT_NOT_FOUND");
        assert_eq!(
            TradeError::FillConflict { order_id: "O1".into() }.code(),
            "FILL_CONFLICT"
        );
    }
}
