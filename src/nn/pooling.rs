//! Spatial resampling layers used by the U-Net encoder and decoder.

use crate::nn::module::Module;
use crate::tensor::{name_scope, GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// 2D max pooling with stride equal to the pool size.
pub struct MaxPool2d {
    pub name: String,
    pub pool: (usize, usize),
}

impl MaxPool2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, pool: (usize, usize)) -> Self {
        let name = context.borrow_mut().reserve_name("max_pooling2d");
        Self { name, pool }
    }
}

impl Module for MaxPool2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &Tensor) -> Tensor {
        name_scope(&inputs.context, &self.name, || inputs.max_pool2d(self.pool))
    }
}

/// Nearest-neighbour 2D upsampling.
pub struct UpSampling2d {
    pub name: String,
    pub size: (usize, usize),
}

impl UpSampling2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, size: (usize, usize)) -> Self {
        let name = context.borrow_mut().reserve_name("up_sampling2d");
        Self { name, size }
    }
}

impl Module for UpSampling2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &Tensor) -> Tensor {
        name_scope(&inputs.context, &self.name, || inputs.upsample2d(self.size))
    }
}
