#![allow(dead_code)]

use ac2art::network::{
    DeepNeuralNetwork, LayerSpec, MlpOptions, MultilayerPerceptron, NetworkConfig,
};
use ac2art::optimizer::AdamConfig;
use ac2art::session::{Session, SessionConfig};
use ac2art::Tensor;
use ndarray::Array2;

pub type Mlp = DeepNeuralNetwork<MultilayerPerceptron>;
pub type MlpConfig = NetworkConfig<MlpOptions>;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two dense hidden layers on 4 input features, predicting 2 targets.
pub fn dense_config() -> MlpConfig {
    NetworkConfig::new(
        vec![None, Some(4)],
        2,
        vec![
            LayerSpec::new("dense_layer", 8usize).kwarg("activation", "tanh"),
            LayerSpec::new("dense_layer", 6usize),
        ],
    )
    .options(MlpOptions {
        optimizer: AdamConfig::new().l_rate(0.01).into(),
    })
}

/// Recurrent network on sequences of 3 features, with a learnable lowpass filter.
pub fn recurrent_config() -> MlpConfig {
    NetworkConfig::new(
        vec![None, None, Some(3)],
        2,
        vec![
            LayerSpec::new("rnn_stack", vec![5usize]).kwarg("cell_type", "gru"),
            LayerSpec::new("lowpass_filter", 20f64).kwarg("window", 2),
            LayerSpec::new("dense_layer", 4usize),
        ],
    )
}

pub fn seeded(config: MlpConfig, seed: u64) -> Mlp {
    let mut net = Mlp::with_session(config, Session::new(SessionConfig::seeded(seed)))
        .expect("network should build");
    net.reset_model(false).expect("reset should succeed");
    net
}

/// Deterministic inputs in [-1, 1] and targets depending linearly on them.
pub fn regression_batch(rows: usize) -> (Tensor, Tensor) {
    let x = Array2::from_shape_fn((rows, 4), |(r, c)| ((r * 4 + c) as f32 * 0.37).sin());
    let y = Array2::from_shape_fn((rows, 2), |(r, c)| match c {
        0 => 0.5 * (x[[r, 0]] + x[[r, 1]]),
        _ => x[[r, 2]] - 0.25 * x[[r, 3]],
    });
    (x.into_dyn(), y.into_dyn())
}

pub fn sequences(batch: usize, time: usize, features: usize) -> Tensor {
    Tensor::from_shape_fn(vec![batch, time, features], |idx| {
        ((idx[0] * 31 + idx[1] * 7 + idx[2]) as f32 * 0.21).cos()
    })
}
