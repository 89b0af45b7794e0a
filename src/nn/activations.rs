//! Activation layer.
//!
//! Every activation layer produces a node named `activation_<k>/<Op>`, so the
//! model head can be addressed the way trainers expect (`activation_<k>/Identity`).

use crate::nn::module::Module;
use crate::tensor::{name_scope, GraphContext, Tensor};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Linear,
    Relu,
    Softmax,
}

pub struct Activation {
    pub name: String,
    pub kind: ActivationKind,
}

impl Activation {
    pub fn new(context: &Rc<RefCell<GraphContext>>, kind: ActivationKind) -> Self {
        let name = context.borrow_mut().reserve_name("activation");
        Self { name, kind }
    }
}

impl Module for Activation {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &Tensor) -> Tensor {
        name_scope(&inputs.context, &self.name, || match self.kind {
            ActivationKind::Linear => inputs.identity(),
            ActivationKind::Relu => inputs.relu(),
            ActivationKind::Softmax => inputs.softmax(),
        })
    }
}
