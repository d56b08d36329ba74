use common::PoolTx;

use crate::chain::StateOverlay;
use crate::error::ValidationError;

/// Application hook run against every transaction at admission and during
/// recheck. Implementations read the overlay for consumed state and write
/// back what the transaction would consume itself.
pub trait AnteValidator: Send + Sync + 'static {
    /// `simulate` is true when the caller probes viability of a single
    /// transaction and throws the overlay writes away afterwards.
    fn validate(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &PoolTx,
        simulate: bool,
    ) -> Result<(), ValidationError>;
}

impl<F> AnteValidator for F
where
    F: Fn(&mut StateOverlay<'_>, &PoolTx, bool) -> Result<(), ValidationError>
        + Send
        + Sync
        + 'static,
{
    fn validate(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &PoolTx,
        simulate: bool,
    ) -> Result<(), ValidationError> {
        self(overlay, tx, simulate)
    }
}

/// Accepts everything. Structural nonce, sequence and balance checks still
/// apply on top.
pub struct NoValidation;

impl AnteValidator for NoValidation {
    fn validate(
        &self,
        _overlay: &mut StateOverlay<'_>,
        _tx: &PoolTx,
        _simulate: bool,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}
