//! # denoiseg-graph: DenoiSeg graph export in Rust
//!
//! Builds a DenoiSeg model (Noise2Void denoising plus 3-class segmentation on a
//! U-Net) as an **Abstract Semantic Graph (ASG)**, materializes its training,
//! validation and prediction sub-graphs, aliases internal names to a small
//! public contract and writes two artifacts: the training graph definition and
//! a serving bundle.
//!
//! ## Usage Example
//!
//! ```no_run
//! use denoiseg_graph::export::GraphExporter;
//! use denoiseg_graph::model::{DenoiSeg, DenoiSegConfig};
//! use denoiseg_graph::tensor::GraphContext;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Explicit graph context
//! let context = GraphContext::shared();
//!
//! // 2. Build the model and all of its functions
//! let config = DenoiSegConfig::from_data(&[128, 64, 64, 1]);
//! let mut model = DenoiSeg::new(config, "denoiseg_model", None, &context)?;
//! model.prepare_for_training();
//! model.make_train_function()?;
//! model.make_test_function()?;
//! model.make_predict_function();
//!
//! // 3. Alias and serialize
//! let summary = GraphExporter::new("../resources").export(&model)?;
//! println!("{:?}", summary.public_names);
//! # Ok(())
//! # }
//! ```

pub mod asg;
pub mod export;
pub mod losses;
pub mod model;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
