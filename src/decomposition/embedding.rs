//! Embedding layer strategy.
//!
//! Embedding tables are stored `(vocab, features)`, transposed relative to a
//! dense weight, so the output channel is axis 1 and the norm reduces over the
//! vocabulary. The magnitude therefore has shape `(1, features)`.

use candle_core::Tensor;
use candle_nn::Embedding;
use tracing::trace;

use super::{LayerKind, LoraFactors, WeightDecomposition};
use crate::error::Result;

/// Column norms of a `(vocab, features)` table, shaped `(1, features)`.
pub(crate) fn weight_norm(weight: &Tensor) -> Result<Tensor> {
    let features = weight.dim(1)?;
    let mut dims = vec![1; weight.rank()];
    dims[0] = features;
    let norm = weight
        .transpose(0, 1)?
        .flatten_from(1)?
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .reshape(dims)?;
    Ok(norm.transpose(0, 1)?.contiguous()?)
}

/// Default lookup: gather rows of `table` for every id in `ids`.
///
/// Output shape is `ids.dims() ++ [table.dim(1)]`.
///
/// # Errors
///
/// Returns an error if `ids` is not an integer tensor or an id is out of range.
pub fn embedding_lookup(ids: &Tensor, table: &Tensor) -> candle_core::Result<Tensor> {
    let mut dims = ids.dims().to_vec();
    dims.push(table.dim(1)?);
    table.index_select(&ids.flatten_all()?, 0)?.reshape(dims)
}

impl WeightDecomposition {
    /// DoRA forward for an embedding layer.
    ///
    /// Returns `(scale, result)` where `scale = m / (||W'||_c + eps)` has shape
    /// `(1, features)` and `result = scale * (lookup(ids, up) @ down) * s`. The
    /// adapted output is `scale * base(ids) + result`; the caller usually has
    /// `base(ids)` already, so the scale is handed back for reuse.
    ///
    /// # Errors
    ///
    /// Returns an error if this decomposition is not an embedding, is
    /// uninitialized, or the lookup fails.
    pub fn forward_embedding<F>(
        &self,
        ids: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
        base: &Embedding,
        embed_fn: F,
    ) -> Result<(Tensor, Tensor)>
    where
        F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    {
        self.expect_kind(LayerKind::Embedding)?;

        let weight = base.embeddings().detach();
        let composed = self.composed_weight(&weight, factors, scaling)?;
        let scale = self.magnitude_scale(&composed)?;

        let up = factors.up.to_dtype(weight.dtype())?;
        let down = factors.down.to_dtype(weight.dtype())?;
        let lora = embed_fn(ids, &up)?.broadcast_matmul(&down)?;
        let result = lora.broadcast_mul(&scale)?.affine(scaling, 0.0)?;

        trace!(ids = ?ids.dims(), output = ?result.dims(), "dora embedding forward");
        Ok((scale, result))
    }
}
