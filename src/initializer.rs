use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

//I used this blog post as reference to the initialization methods ->
//https://towardsdatascience.com/weight-initialization-in-neural-networks-a-journey-from-the-basics-to-kaiming-954fb9b47c79

/// Initialization scheme of a parameter. Random schemes draw from the session's generator,
/// so resetting a session twice yields different values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    /// Should be used for layers with symetric activation functions such as sigmoid or tanh
    Xavier,
    /// Should be used for layers with asymetric activation functions such as relu
    Kaiming,
    Zeros,
    Ones,
    Constant(f32),
}

impl Init {
    /// Fill `out` with initial values. `fan_in` is the number of inputs of the unit the
    /// parameter belongs to.
    pub fn fill<R: Rng>(&self, rng: &mut R, fan_in: usize, out: &mut [f32]) {
        let fan_in = fan_in.max(1) as f32;
        match *self {
            Init::Xavier => {
                let scale = fan_in.sqrt().recip();
                for w in out {
                    *w = rng.sample::<f32, _>(StandardNormal) * scale;
                }
            }
            Init::Kaiming => {
                let scale = (2. / fan_in).sqrt();
                for w in out {
                    *w = rng.sample::<f32, _>(StandardNormal) * scale;
                }
            }
            Init::Zeros => out.iter_mut().for_each(|w| *w = 0.),
            Init::Ones => out.iter_mut().for_each(|w| *w = 1.),
            Init::Constant(c) => out.iter_mut().for_each(|w| *w = c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn constant_inits() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut buf = [5.; 4];
        Init::Zeros.fill(&mut rng, 3, &mut buf);
        assert_eq!(buf, [0.; 4]);
        Init::Constant(0.5).fill(&mut rng, 3, &mut buf);
        assert_eq!(buf, [0.5; 4]);
    }

    #[test]
    fn random_inits_differ_between_draws() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut a = [0.; 16];
        let mut b = [0.; 16];
        Init::Xavier.fill(&mut rng, 4, &mut a);
        Init::Xavier.fill(&mut rng, 4, &mut b);
        assert_ne!(a, b);
        assert!(a.iter().all(|x| x.is_finite()));
    }
}
