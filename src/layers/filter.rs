use std::f32::consts::PI;

use log::debug;
use ndarray::{Array3, Axis, Ix3};

use crate::{
    error::{Error, Result},
    initializer::Init,
    layers::{
        cache_mismatch, KwargsReader, Layer, LayerCache, LayerConfig, LayerKind, PrimaryParam,
        RunContext, TensorShape,
    },
    storage::{Allocator, Param, Storage},
    Tensor,
};

pub const DEFAULT_SAMPLING_RATE: f32 = 200.;
pub const DEFAULT_WINDOW: usize = 5;

/// Windowed-sinc lowpass filter applied along the time axis, with a Hamming window of
/// `2 * window + 1` taps. Time is axis 0 of rank 2 inputs and axis 1 of rank 3 inputs;
/// the signal's edges are replicated so the output keeps the input's length.
///
/// The cutoff frequency is stored as a parameter of the layer and may be trained.
#[derive(Debug, Clone)]
pub struct LowpassFilter {
    input: TensorShape,
    n_inputs: usize,
    cutoff_init: f32,
    sampling_rate: f32,
    window: usize,
    learnable: bool,

    cutoff: Param,
}

#[derive(Debug, Clone)]
pub struct FilterCache {
    in_shape: Vec<usize>,
    input: Array3<f32>,
    fc: f32,
}

/// Unnormalized taps for offsets `0..=window` and their derivatives w.r.t. the
/// normalized cutoff `fc`.
fn raw_taps(fc: f32, window: usize) -> (Vec<f32>, Vec<f32>) {
    (0..=window)
        .map(|k| {
            let w = 0.54 + 0.46 * (PI * k as f32 / window as f32).cos();
            if k == 0 {
                (w * 2. * fc, w * 2.)
            } else {
                let arg = 2. * PI * fc * k as f32;
                (w * arg.sin() / (PI * k as f32), w * 2. * arg.cos())
            }
        })
        .unzip()
}

/// Sum of the taps over the full symmetric window.
fn symmetric_sum(taps: &[f32]) -> f32 {
    taps[0] + 2. * taps[1..].iter().sum::<f32>()
}

/// Normalized taps, summing to one over the symmetric window.
pub fn lowpass_taps(fc: f32, window: usize) -> Vec<f32> {
    let (taps, _) = raw_taps(fc, window);
    let sum = symmetric_sum(&taps);
    taps.iter().map(|t| t / sum).collect()
}

fn to_sequences(x: &Tensor) -> Result<Array3<f32>> {
    let x = match x.ndim() {
        2 => x.view().insert_axis(Axis(0)),
        3 => x.view(),
        _ => {
            return Err(Error::Shape(format!(
                "Lowpass filter expects a rank 2 or 3 input, got shape {:?}.",
                x.shape()
            )))
        }
    };
    x.to_owned()
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::Shape(e.to_string()))
}

fn clamp(t: isize, len: usize) -> usize {
    t.max(0).min(len as isize - 1) as usize
}

impl LowpassFilter {
    pub fn new(
        input: &TensorShape,
        cutoff: f32,
        sampling_rate: f32,
        window: usize,
        learnable: bool,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let n_inputs = LayerKind::LowpassFilter.input_width(input)?;
        if sampling_rate <= 0. {
            return Err(Error::Value(format!(
                "'sampling_rate' must be positive, got {}.",
                sampling_rate
            )));
        }
        if !(cutoff > 0. && cutoff < sampling_rate / 2.) {
            return Err(Error::Value(format!(
                "'cutoff' must be in ]0, {}[, got {}.",
                sampling_rate / 2.,
                cutoff
            )));
        }
        if window == 0 {
            return Err(Error::Value("'window' must be positive.".to_owned()));
        }
        Ok(Self {
            input: input.clone(),
            n_inputs,
            cutoff_init: cutoff,
            sampling_rate,
            window,
            learnable,
            cutoff: alloc.allocate(&[1], Init::Constant(cutoff), 1),
        })
    }

    pub fn from_spec(
        input: &TensorShape,
        param: &PrimaryParam,
        mut kwargs: KwargsReader<'_>,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let cutoff = param.frequency("cutoff")?;
        let sampling_rate = kwargs
            .take_f32("sampling_rate")?
            .unwrap_or(DEFAULT_SAMPLING_RATE);
        let window = kwargs.take_usize("window")?.unwrap_or(DEFAULT_WINDOW);
        let learnable = kwargs.take_bool("learnable")?.unwrap_or(true);
        kwargs.finish()?;
        debug!(
            "Building lowpass filter: cutoff {} Hz at {} Hz",
            cutoff, sampling_rate
        );
        Self::new(input, cutoff, sampling_rate, window, learnable, alloc)
    }

    pub fn cutoff(&self) -> &Param {
        &self.cutoff
    }

    fn normalized_cutoff(&self, storage: &Storage) -> f32 {
        storage.get(self.cutoff.handle())[0] / self.sampling_rate
    }
}

impl Layer for LowpassFilter {
    fn kind(&self) -> LayerKind {
        LayerKind::LowpassFilter
    }

    fn configuration(&self) -> LayerConfig {
        LayerConfig::LowpassFilter {
            n_inputs: self.n_inputs,
            cutoff: self.cutoff_init,
            sampling_rate: self.sampling_rate,
            window: self.window,
            learnable: self.learnable,
        }
    }

    fn input_shape(&self) -> &TensorShape {
        &self.input
    }

    fn output_shape(&self) -> &TensorShape {
        &self.input
    }

    fn params(&self) -> Vec<(String, &Param)> {
        vec![("cutoff".to_owned(), &self.cutoff)]
    }

    fn weights(&self) -> Vec<&Param> {
        if self.learnable {
            vec![&self.cutoff]
        } else {
            Vec::new()
        }
    }

    fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, LayerCache)> {
        self.input.check(input.shape(), "input")?;
        let x = to_sequences(input)?;
        let fc = self.normalized_cutoff(ctx.storage);
        let taps = lowpass_taps(fc, self.window);
        let steps = x.len_of(Axis(1));
        let w = self.window as isize;

        let mut y = Array3::zeros(x.raw_dim());
        for t in 0..steps {
            let mut out = y.index_axis_mut(Axis(1), t);
            for k in -w..=w {
                let src = x.index_axis(Axis(1), clamp(t as isize + k, steps));
                out.scaled_add(taps[k.unsigned_abs()], &src);
            }
        }

        let output = y
            .into_shape(input.raw_dim())
            .map_err(|e| Error::Shape(e.to_string()))?;
        let cache = FilterCache {
            in_shape: input.shape().to_vec(),
            input: x,
            fc,
        };
        Ok((output, LayerCache::Filter(cache)))
    }

    fn backward(
        &self,
        cache: &LayerCache,
        out_grads: &Tensor,
        _storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        let cache = match cache {
            LayerCache::Filter(cache) => cache,
            _ => return Err(cache_mismatch()),
        };
        let g = to_sequences(out_grads)?;
        let x = &cache.input;
        let (taps, dtaps) = raw_taps(cache.fc, self.window);
        let sum = symmetric_sum(&taps);
        let dsum = symmetric_sum(&dtaps);
        let steps = x.len_of(Axis(1));
        let w = self.window as isize;

        let mut dx = Array3::zeros(x.raw_dim());
        // gradient w.r.t. each normalized tap
        let mut dh = vec![0.; self.window + 1];
        for t in 0..steps {
            let g_t = g.index_axis(Axis(1), t);
            for k in -w..=w {
                let m = k.unsigned_abs();
                let src = clamp(t as isize + k, steps);
                dx.index_axis_mut(Axis(1), src)
                    .scaled_add(taps[m] / sum, &g_t);
                dh[m] += (&g_t * &x.index_axis(Axis(1), src)).sum();
            }
        }

        if self.learnable {
            let dfc: f32 = dh
                .iter()
                .zip(taps.iter().zip(&dtaps))
                .map(|(d, (t, dt))| d * (dt * sum - t * dsum) / (sum * sum))
                .sum();
            grads.get_mut(self.cutoff.handle())[0] += dfc / self.sampling_rate;
        }

        dx.into_shape(cache.in_shape.as_slice())
            .map_err(|e| Error::Shape(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{tests::check_gradients, LayerType},
        session::{Session, SessionConfig},
    };
    use approx::assert_relative_eq;
    use rand::{rngs::SmallRng, SeedableRng};

    fn build(shape: Vec<Option<usize>>, learnable: bool) -> (LowpassFilter, Session) {
        let mut alloc = Allocator::new();
        let layer = LowpassFilter::new(&TensorShape::new(shape), 20., 200., 5, learnable, &mut alloc)
            .unwrap();
        let mut session = Session::new(SessionConfig::seeded(0));
        session.bind(alloc.len()).unwrap();
        session.initialize(std::iter::once(layer.cutoff()));
        (layer, session)
    }

    fn eval(layer: &LowpassFilter, session: &Session, x: &Tensor) -> Tensor {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ctx = RunContext {
            storage: session.storage(),
            rng: &mut rng,
            training: false,
            keep_prob: None,
        };
        layer.forward(x, &mut ctx).unwrap().0
    }

    #[test]
    fn taps_sum_to_one() {
        let taps = lowpass_taps(0.1, 5);
        assert_eq!(taps.len(), 6);
        assert_relative_eq!(symmetric_sum(&taps), 1., epsilon = 1e-6);
        assert!(taps[0] > taps[1]);
    }

    #[test]
    fn constant_signal_is_preserved() {
        let (layer, session) = build(vec![None, Some(2)], true);
        let x = Tensor::from_elem(vec![30, 2], 3.5);
        let y = eval(&layer, &session, &x);
        assert_eq!(y.shape(), x.shape());
        for v in y.iter() {
            assert_relative_eq!(*v, 3.5, epsilon = 1e-4);
        }
    }

    #[test]
    fn high_frequencies_are_attenuated() {
        let (layer, session) = build(vec![None, Some(1)], true);
        // alternating signal at the Nyquist frequency
        let x = Tensor::from_shape_fn(vec![40, 1], |idx| if idx[0] % 2 == 0 { 1. } else { -1. });
        let y = eval(&layer, &session, &x);
        let energy = |a: &Tensor| a.iter().skip(10).take(20).map(|v| v * v).sum::<f32>();
        assert!(energy(&y) < 0.05 * energy(&x));
    }

    #[test]
    fn invalid_cutoff() {
        let shape = TensorShape::new(vec![None, Some(2)]);
        for cutoff in [0., -5., 100., 150.] {
            let res = LowpassFilter::new(&shape, cutoff, 200., 5, true, &mut Allocator::new());
            assert!(matches!(res, Err(Error::Value(_))), "cutoff {}", cutoff);
        }
    }

    #[test]
    fn frozen_cutoff_is_not_a_weight() {
        let (layer, _) = build(vec![None, Some(2)], false);
        assert!(layer.weights().is_empty());
        assert_eq!(layer.params().len(), 1);
    }

    #[test]
    fn filter_backprop() {
        let (layer, session) = build(vec![None, None, Some(2)], true);
        let x = Tensor::from_shape_fn(vec![2, 12, 2], |idx| {
            ((idx[0] * 24 + idx[1] * 2 + idx[2]) as f32 * 0.7).sin()
        });
        check_gradients(&LayerType::from(layer), &session, &x);
    }
}
