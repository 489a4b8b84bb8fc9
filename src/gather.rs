//! Scoped parameter gathering.
//!
//! Sharded training keeps only a slice of each parameter on every rank. Reading
//! the full base weight requires gathering it first and releasing it right
//! after, on every exit path. [`GatheredParams`] ties the release to scope exit.

use tracing::trace;

use crate::error::Result;

/// Collaborator that materializes the sharded parameters of a base layer `P`.
///
/// The layer being read is handed to both calls, so one collaborator can
/// serve every adapted layer of a model.
pub trait ParamGather<P: ?Sized> {
    /// Gather the full parameters of `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be materialized.
    fn gather(&self, params: &P) -> Result<()>;

    /// Release the parameters of `params`. Only called after a successful
    /// `gather` of the same layer.
    fn release(&self, params: &P);
}

/// Parameters that already live fully on this process; gathering is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalParams;

impl<P: ?Sized> ParamGather<P> for LocalParams {
    fn gather(&self, _params: &P) -> Result<()> {
        Ok(())
    }

    fn release(&self, _params: &P) {}
}

/// Guard holding gathered parameters until dropped.
#[must_use = "parameters are released as soon as the guard is dropped"]
pub struct GatheredParams<'a, P: ?Sized> {
    source: &'a dyn ParamGather<P>,
    params: &'a P,
}

impl<'a, P: ?Sized> GatheredParams<'a, P> {
    /// Gather the parameters of `params` from `source`, releasing them when
    /// the guard drops.
    ///
    /// # Errors
    ///
    /// Propagates the collaborator's error unchanged; nothing is released then.
    pub fn acquire(source: &'a dyn ParamGather<P>, params: &'a P) -> Result<Self> {
        source.gather(params)?;
        trace!("gathered base layer parameters");
        Ok(Self { source, params })
    }
}

impl<P: ?Sized> Drop for GatheredParams<'_, P> {
    fn drop(&mut self) {
        self.source.release(self.params);
        trace!("released base layer parameters");
    }
}
