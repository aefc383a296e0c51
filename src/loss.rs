use crate::error::{Error, Result};
use crate::Tensor;

pub struct Loss {
    pub loss: f32,
    pub grads: Tensor,
}

pub trait LossFunc {
    fn eval(&self, val: &Tensor, target: &Tensor) -> Result<Loss>;
}

#[derive(Clone, Debug, Default)]
pub struct MeanSquared;

impl LossFunc for MeanSquared {
    fn eval(&self, val: &Tensor, target: &Tensor) -> Result<Loss> {
        if val.shape() != target.shape() {
            return Err(Error::Shape(format!(
                "Predictions have shape {:?} but targets have shape {:?}.",
                val.shape(),
                target.shape()
            )));
        }
        if val.is_empty() {
            return Err(Error::Value("Cannot evaluate a loss over no values.".to_owned()));
        }

        let recip = 1. / val.len() as f32;
        let diff = val - target;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() * recip;
        let grads = diff * (2. * recip);
        Ok(Loss { loss, grads })
    }
}
