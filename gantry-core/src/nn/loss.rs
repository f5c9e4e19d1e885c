//! Adversarial losses.

use candle_core::Tensor;

use crate::error::Result;

/// Probabilities are clamped into `[PROB_EPS, 1 - PROB_EPS]` before `ln`, so
/// saturated scores give a finite loss and a finite gradient.
const PROB_EPS: f64 = 1e-7;

/// Mean binary cross-entropy between probabilities and targets.
pub fn binary_cross_entropy(probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let log_p = probs.log()?;
    let log_not_p = probs.affine(-1.0, 1.0)?.log()?;
    let not_targets = targets.affine(-1.0, 1.0)?;
    let per_item = ((targets * log_p)? + (not_targets * log_not_p)?)?;
    Ok(per_item.neg()?.mean_all()?)
}

/// Generator loss: the discriminator's scores on fakes against all-ones.
pub fn generator_loss(fake_scores: &Tensor) -> Result<Tensor> {
    binary_cross_entropy(fake_scores, &fake_scores.ones_like()?)
}

/// The two discriminator terms and their combination.
#[derive(Debug, Clone)]
pub struct DiscriminatorLoss {
    /// `(real + fake) / 2`; the tensor gradients flow through.
    pub total: Tensor,
    pub real: Tensor,
    pub fake: Tensor,
}

/// Real scores against all-ones, fake scores against all-zeros, averaged.
pub fn discriminator_loss(real_scores: &Tensor, fake_scores: &Tensor) -> Result<DiscriminatorLoss> {
    let real = binary_cross_entropy(real_scores, &real_scores.ones_like()?)?;
    let fake = binary_cross_entropy(fake_scores, &fake_scores.zeros_like()?)?;
    let total = ((&real + &fake)? / 2.0)?;
    Ok(DiscriminatorLoss { total, real, fake })
}
