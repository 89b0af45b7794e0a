// --- File: src/nn/conv.rs ---

//! Module implementing the 2D convolution layer.

use crate::asg::Initializer;
use crate::nn::module::Module;
use crate::tensor::{name_scope, GraphContext, Tensor, Variable};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for Conv2d layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Use bias.
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            bias: true,
        }
    }
}

impl Conv2dConfig {
    /// Creates Conv2d configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            ..Default::default()
        }
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// 2D Convolutional layer over NHWC tensors with "same" padding.
///
/// The kernel has shape `[kH, kW, C_in, C_out]` and is Glorot-uniform initialized,
/// the bias has shape `[C_out]` and starts at zero.
///
/// # Example
///
/// ```rust,ignore
/// use denoiseg_graph::nn::{Conv2d, Conv2dConfig, Module};
///
/// let conv = Conv2d::new(&context, Conv2dConfig::new(1, 32, (3, 3)));
/// let output = conv.forward(&input);
/// ```
pub struct Conv2d {
    pub name: String,
    pub kernel: Variable,
    pub bias: Option<Variable>,
    pub config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: Conv2dConfig) -> Self {
        let name = context.borrow_mut().reserve_name("conv2d");
        let (kh, kw) = config.kernel_size;
        let (kernel, bias) = name_scope(context, &name, || {
            let kernel = Variable::weight(
                context,
                "kernel",
                &[kh, kw, config.in_channels, config.out_channels],
                Initializer::GlorotUniform,
            );
            let bias = config
                .bias
                .then(|| Variable::weight(context, "bias", &[config.out_channels], Initializer::Zeros));
            (kernel, bias)
        });
        Self { name, kernel, bias, config }
    }
}

impl Module for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &Tensor) -> Tensor {
        name_scope(&inputs.context, &self.name, || {
            inputs.conv2d(
                &self.kernel.read,
                self.bias.as_ref().map(|b| &b.read),
                self.config.out_channels,
            )
        })
    }

    fn parameters(&self) -> Vec<Variable> {
        let mut params = vec![self.kernel.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::DType;

    #[test]
    fn test_conv2d_names_and_shapes() {
        let ctx = GraphContext::shared();
        let x = Tensor::placeholder(&ctx, "input", vec![None, None, None, Some(1)], DType::F32);
        let conv1 = Conv2d::new(&ctx, Conv2dConfig::new(1, 8, (3, 3)));
        let conv2 = Conv2d::new(&ctx, Conv2dConfig::new(8, 4, (1, 1)).with_bias(false));

        assert_eq!(conv1.kernel.name(), "conv2d/kernel");
        assert_eq!(conv2.kernel.name(), "conv2d_1/kernel");
        assert_eq!(conv1.kernel.var.dims(), vec![Some(3), Some(3), Some(1), Some(8)]);
        assert_eq!(conv2.parameters().len(), 1);

        let y = conv2.forward(&conv1.forward(&x));
        assert_eq!(y.name(), "conv2d_1/Conv2D:0");
        assert_eq!(y.dims(), vec![None, None, None, Some(4)]);
    }
}
