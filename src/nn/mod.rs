//! # Neural Network Layers Module
//!
//! Building blocks for the DenoiSeg U-Net.
//!
//! Each layer reserves a Keras-style unique name (`conv2d`, `conv2d_1`, ...) in the
//! graph context when it is created. Its variables live in that scope
//! (`conv2d/kernel`, `conv2d/bias`) and `forward` adds its operation nodes there.
//!
//! ## Available Layers
//!
//! - [`Conv2d`]: 2D convolution, "same" padding, stride 1
//! - [`BatchNormalization`]: batch normalization with moving statistics
//! - [`MaxPool2d`], [`UpSampling2d`]: spatial down/up sampling
//! - [`Activation`]: linear / ReLU / softmax activation layer

pub mod activations;
pub mod batchnorm;
pub mod conv;
pub mod module;
pub mod pooling;

pub use activations::{Activation, ActivationKind};
pub use batchnorm::BatchNormalization;
pub use conv::{Conv2d, Conv2dConfig};
pub use module::Module;
pub use pooling::{MaxPool2d, UpSampling2d};
