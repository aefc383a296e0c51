pub mod activations;
pub mod error;
pub mod features;
pub mod initializer;
pub mod layers;
pub mod loss;
pub mod network;
pub mod normalize;
pub mod optimizer;
pub mod session;
pub mod storage;

pub use error::{Error, Result};

/// Dense values fed to and produced by networks.
pub type Tensor = ndarray::ArrayD<f32>;
