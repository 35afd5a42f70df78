//! Error taxonomy for the hop-distance engine.
//!
//! Consistency violations indicate a queuing/invariant bug upstream and are
//! deliberately unrecoverable: the operation fails loudly rather than
//! silently correcting.  Storage-level failures are not represented here;
//! they belong to the storage crate and propagate unchanged.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HopError>;

#[derive(Debug, Error)]
pub enum HopError {
    /// An invariant the queuing discipline should have guaranteed does not
    /// hold, e.g. a freshly computed distance is worse than the stored one,
    /// or a row surfaced in the `Deleting` state during propagation.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A persisted death-mark code was not one of 'N', 'Q', 'D'.
    #[error("unrecognized death-mark code '{0}'")]
    BadDeathMark(char),

    /// A persisted link provenance code was not one of 'B', 'N', 'E'.
    #[error("unrecognized link-state code '{0}'")]
    BadLinkState(char),

    /// A cooperative cancellation check fired mid-pass.  Affected rows stay
    /// queued; re-running propagation later is always correct.
    #[error("propagation pass interrupted")]
    Interrupted,
}
