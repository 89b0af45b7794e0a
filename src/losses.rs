// --- File: src/losses.rs ---

//! DenoiSeg loss functions in graph paradigm.
//!
//! Loss functions here are regular Rust functions that take symbolic `Tensor`
//! descriptors and add the nodes necessary for computing the error value.
//!
//! The combined target tensor is laid out along the channel axis as
//! `[noisy target (c), N2V mask (c), one-hot classes (3)]` and the prediction as
//! `[denoised (c), class logits (3)]`, where `c` is the number of input channels.

use crate::asg::Value;
use crate::tensor::{name_scope, Tensor};
use ndarray::{arr1, ArrayD};

/// Number of segmentation classes: background, foreground, border.
pub const N_CLASSES: usize = 3;

/// Small constant keeping `log` finite.
const LOG_EPSILON: f32 = 1e-7;

/// Noise2Void masked MSE: squared error averaged over the masked pixels only.
///
/// Formula: `sum(mask * (target - pred)^2) / sum(mask)`.
pub fn n2v_masked_mse(target: &Tensor, mask: &Tensor, pred: &Tensor) -> Tensor {
    let error = (target - pred).square();
    let masked = mask * &error;
    &masked.mean() / &mask.mean()
}

/// Class-weighted categorical cross-entropy on softmax probabilities.
///
/// Formula: `-mean(sum_c w_c * y_c * log(p_c + eps))`.
pub fn weighted_categorical_crossentropy(
    onehot: &Tensor,
    logits: &Tensor,
    class_weights: &[f32],
) -> Tensor {
    let ctx = &logits.context;
    let weights: ArrayD<f32> = arr1(class_weights).into_dyn();
    let weights = Tensor::constant(ctx, "class_weights", Value::Tensor(weights));
    let eps = Tensor::constant(ctx, "Const", Value::ScalarF32(LOG_EPSILON));

    let log_probs = (&logits.softmax() + &eps).log();
    let weighted = &(onehot * &weights) * &log_probs;
    weighted.sum_channels().mean().scale(-1.0)
}

/// The three DenoiSeg loss terms.
#[derive(Debug, Clone)]
pub struct DenoiSegLoss {
    pub denoiseg: Tensor,
    pub denoise: Tensor,
    pub seg: Tensor,
}

/// Builds `denoiseg = alpha * denoise_loss + (1 - alpha) * seg_loss`.
///
/// # Arguments
///
/// * `y_true` - Combined target, `2 * n_channel_in + 3` channels.
/// * `y_pred` - Raw network head, `n_channel_in + 3` channels.
/// * `n_channel_in` - Number of image channels.
/// * `alpha` - Blending coefficient between denoising and segmentation.
/// * `relative_weights` - Class weights for background, foreground and border.
pub fn denoiseg_loss(
    y_true: &Tensor,
    y_pred: &Tensor,
    n_channel_in: usize,
    alpha: f32,
    relative_weights: &[f32],
) -> DenoiSegLoss {
    let c = n_channel_in;
    let ctx = &y_true.context;

    let denoise = name_scope(ctx, "denoise_loss", || {
        let target = y_true.slice_channels(0, c);
        let mask = y_true.slice_channels(c, 2 * c);
        let denoised = y_pred.slice_channels(0, c);
        n2v_masked_mse(&target, &mask, &denoised)
    });

    let seg = name_scope(ctx, "seg_loss", || {
        let onehot = y_true.slice_channels(2 * c, 2 * c + N_CLASSES);
        let logits = y_pred.slice_channels(c, c + N_CLASSES);
        weighted_categorical_crossentropy(&onehot, &logits, relative_weights)
    });

    let denoiseg = name_scope(ctx, "denoiseg", || {
        &denoise.scale(alpha) + &seg.scale(1.0 - alpha)
    });

    DenoiSegLoss { denoiseg, denoise, seg }
}
