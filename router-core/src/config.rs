//! Construction-time configuration for a [`crate::core::Core`].
//!
//! Follows the crate's `*Builder` convention (see `link::builder::Builder`,
//! `session::builder::Builder` elsewhere in this codebase): knobs are
//! collected here and consumed once at `Core::new`, rather than threaded
//! through every call site.

use crate::address::Treatment;

/// Configuration for a [`crate::core::Core`] instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Credit granted back to an ingress link on a targeted-sender-with-no-path
    /// drop, and on a restricted (router-control-only) release. Usually 1;
    /// kept configurable here since nothing about the algorithm requires it
    /// to be.
    pub release_credit_refund: u32,

    /// Whether `to_addr` resolution should prepend the connection's
    /// tenant-space prefix before the hash lookup.
    pub tenant_space_enabled: bool,

    /// Capacity hint for the action channel; `0` means unbounded
    /// (`std::sync::mpsc::channel`), any other value uses
    /// `std::sync::mpsc::sync_channel` to apply backpressure to producers.
    pub action_queue_capacity: usize,

    /// Treatment applied when `to_addr` does not resolve to any known
    /// address.
    pub default_treatment: Treatment,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            release_credit_refund: 1,
            tenant_space_enabled: true,
            action_queue_capacity: 0,
            default_treatment: Treatment::Unavailable,
        }
    }
}
