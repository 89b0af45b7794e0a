//! U-Net backbone of the DenoiSeg model.
//!
//! Encoder: `unet_n_depth` levels of two convolution blocks followed by 2x2 max pooling.
//! Decoder: 2x upsampling, concatenation with the matching encoder level, two convolution
//! blocks. A final 1x1 convolution maps to `n_channel_out` channels.

use crate::model::config::DenoiSegConfig;
use crate::nn::{
    Activation, ActivationKind, BatchNormalization, Conv2d, Conv2dConfig, MaxPool2d, Module,
    UpSampling2d,
};
use crate::tensor::{name_scope, Tensor, Variable};

const CONVS_PER_DEPTH: usize = 2;

/// Layers of a built U-Net plus its raw output head.
pub struct UNet {
    pub convs: Vec<Conv2d>,
    pub batch_norms: Vec<BatchNormalization>,
    /// Output of the last activation layer (`activation_<k>/...`).
    pub head: Tensor,
}

impl UNet {
    /// Builds the network on `input` into the input's graph context.
    pub fn build(input: &Tensor, learning_phase: &Tensor, config: &DenoiSegConfig) -> Self {
        let mut builder = Builder {
            config,
            learning_phase,
            convs: Vec::new(),
            batch_norms: Vec::new(),
        };
        let head = builder.network(input);
        Self {
            convs: builder.convs,
            batch_norms: builder.batch_norms,
            head,
        }
    }

    /// All trainable variables in construction order.
    pub fn parameters(&self) -> Vec<Variable> {
        let convs = self.convs.iter().flat_map(|c| c.parameters());
        let norms = self.batch_norms.iter().flat_map(|b| b.parameters());
        convs.chain(norms).collect()
    }
}

struct Builder<'a> {
    config: &'a DenoiSegConfig,
    learning_phase: &'a Tensor,
    convs: Vec<Conv2d>,
    batch_norms: Vec<BatchNormalization>,
}

impl Builder<'_> {
    fn channels(x: &Tensor) -> usize {
        x.dims().last().copied().flatten().unwrap_or(1)
    }

    /// Conv -> (BatchNorm) -> activation.
    fn conv_block(&mut self, x: &Tensor, filters: usize, kernel: usize, activation: ActivationKind) -> Tensor {
        let ctx = &x.context;
        let conv = Conv2d::new(
            ctx,
            Conv2dConfig::new(Self::channels(x), filters, (kernel, kernel)),
        );
        let mut y = conv.forward(x);
        self.convs.push(conv);
        if self.config.batch_norm {
            let bn = BatchNormalization::new(ctx, filters, self.learning_phase);
            y = bn.forward(&y);
            self.batch_norms.push(bn);
        }
        Activation::new(ctx, activation).forward(&y)
    }

    fn network(&mut self, input: &Tensor) -> Tensor {
        let ctx = &input.context;
        let depth = self.config.unet_n_depth;
        let n_first = self.config.unet_n_first;
        let kern = self.config.unet_kern_size;
        let mut skips = Vec::with_capacity(depth);
        let mut x = input.clone();

        for level in 0..depth {
            for _ in 0..CONVS_PER_DEPTH {
                x = self.conv_block(&x, n_first * 2usize.pow(level as u32), kern, ActivationKind::Relu);
            }
            skips.push(x.clone());
            x = MaxPool2d::new(ctx, (2, 2)).forward(&x);
        }

        for _ in 0..CONVS_PER_DEPTH - 1 {
            x = self.conv_block(&x, n_first * 2usize.pow(depth as u32), kern, ActivationKind::Relu);
        }
        let bottom = n_first * 2usize.pow(depth.saturating_sub(1) as u32);
        x = self.conv_block(&x, bottom, kern, ActivationKind::Relu);

        for level in (0..depth).rev() {
            let up = UpSampling2d::new(ctx, (2, 2)).forward(&x);
            let concat_scope = ctx.borrow_mut().reserve_name("concatenate");
            x = name_scope(ctx, &concat_scope, || Tensor::concat(&[&up, &skips[level]]));
            for _ in 0..CONVS_PER_DEPTH - 1 {
                x = self.conv_block(&x, n_first * 2usize.pow(level as u32), kern, ActivationKind::Relu);
            }
            let filters = n_first * 2usize.pow(level.saturating_sub(1) as u32);
            x = self.conv_block(&x, filters, kern, ActivationKind::Relu);
        }

        let head = Conv2d::new(
            ctx,
            Conv2dConfig::new(Self::channels(&x), self.config.n_channel_out, (1, 1)),
        );
        let y = head.forward(&x);
        self.convs.push(head);
        Activation::new(ctx, self.config.unet_last_activation).forward(&y)
    }
}
