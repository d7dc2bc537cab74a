//! Crate-wide error types.

use thiserror::Error;

/// An error surfaced to the embedding router when an [`crate::action::Action`]
/// cannot be applied.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The action referenced a link handle that is no longer live.
    #[error("stale link handle")]
    StaleLink,

    /// A delivery tag exceeded [`crate::delivery::QDR_DELIVERY_TAG_MAX`].
    #[error("delivery tag of {0} bytes exceeds the maximum of {max}", max = crate::delivery::QDR_DELIVERY_TAG_MAX)]
    TagTooLong(usize),

    /// The core thread's action channel has been disconnected.
    #[error("action dispatcher is shut down")]
    Shutdown,
}

/// The standard AMQP error condition this crate is able to produce on its
/// own (forwarding decisions only -- everything else is the transport's
/// concern).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `amqp:not-found`
    NotFound,
}

impl Condition {
    /// The wire condition string, as it would appear in a `Disposition`'s
    /// error record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::NotFound => "amqp:not-found",
        }
    }
}

/// A local delivery error: a condition plus the human-readable text
/// attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    /// The wire condition.
    pub condition: Condition,
    /// Human readable description.
    pub description: String,
}

impl DeliveryError {
    /// The "deliveries cannot be sent to an unavailable address" rejection
    /// used by the `UNAVAILABLE` treatment branch.
    pub fn unavailable() -> Self {
        Self {
            condition: Condition::NotFound,
            description: "Deliveries cannot be sent to an unavailable address".to_string(),
        }
    }
}
