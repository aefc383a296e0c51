mod common;

use ac2art::network::{MlpOptions, Readout};
use ac2art::optimizer::GradDescConfig;
use ac2art::Error;
use approx::assert_relative_eq;
use ndarray::array;

use common::{dense_config, init, recurrent_config, regression_batch, seeded, sequences, Mlp};

#[test]
fn training_reduces_the_loss() -> anyhow::Result<()> {
    init();
    let mut net = seeded(dense_config(), 3);
    let (x, y) = regression_batch(32);

    let first = net.run_training_function(&x, &y, 1.)?;
    let mut last = first;
    for _ in 0..300 {
        last = net.run_training_function(&x, &y, 1.)?;
    }
    assert!(last.is_finite());
    assert!(last < first * 0.5, "loss went from {} to {}", first, last);

    let rmse = net.score(&x, &y)?;
    assert_eq!(rmse.len(), 2);
    assert!(rmse.iter().all(|e| e.is_finite() && *e >= 0.));
    Ok(())
}

#[test]
fn gradient_descent_reduces_the_loss() -> anyhow::Result<()> {
    let config = dense_config().options(MlpOptions {
        optimizer: GradDescConfig::new().l_rate(0.05).into(),
    });
    let mut net = seeded(config, 3);
    let (x, y) = regression_batch(32);

    let first = net.run_training_function(&x, &y, 1.)?;
    let mut last = first;
    for _ in 0..200 {
        last = net.run_training_function(&x, &y, 1.)?;
    }
    assert!(last.is_finite());
    assert!(last < first, "loss went from {} to {}", first, last);

    net.reset_model(false)?;
    assert!(net.run_training_function(&x, &y, 1.)?.is_finite());
    Ok(())
}

#[test]
fn dropout_training_step() -> anyhow::Result<()> {
    let mut net = seeded(dense_config(), 4);
    let (x, y) = regression_batch(16);
    let loss = net.run_training_function(&x, &y, 0.5)?;
    assert!(loss.is_finite());

    assert!(matches!(
        net.run_training_function(&x, &y, 0.),
        Err(Error::Value(_))
    ));
    assert!(matches!(
        net.run_training_function(&x, &y, 1.5),
        Err(Error::Value(_))
    ));
    Ok(())
}

#[test]
fn wrong_targets() -> anyhow::Result<()> {
    let mut net = Mlp::new(dense_config())?;
    let (x, _) = regression_batch(8);
    let y = ndarray::Array2::<f32>::zeros((8, 3)).into_dyn();
    assert!(matches!(
        net.run_training_function(&x, &y, 1.),
        Err(Error::Shape(_))
    ));
    assert!(matches!(net.score(&x, &y), Err(Error::Shape(_))));
    Ok(())
}

#[test]
fn recurrent_training_step() -> anyhow::Result<()> {
    let mut net = seeded(recurrent_config(), 8);
    let x = sequences(3, 10, 3);
    let y = sequences(3, 10, 2) * 0.5;
    let before = net.get_values()?;
    let loss = net.run_training_function(&x, &y, 0.9)?;
    assert!(loss.is_finite());
    assert_ne!(net.get_values()?, before);
    assert_eq!(net.predict(&x)?.shape(), [3, 10, 2]);
    Ok(())
}

#[test]
fn predictions_are_scaled_back() -> anyhow::Result<()> {
    let config = dense_config().norm_params(array![2., 0.5].into_dyn());
    let mut net = Mlp::new(config)?;
    let (x, _) = regression_batch(6);
    let raw = net.readout(Readout::Raw, &x)?;
    let prediction = net.predict(&x)?;
    assert_eq!(raw.shape(), [6, 2]);
    for (k, (r, p)) in raw.iter().zip(prediction.iter()).enumerate() {
        let scale = if k % 2 == 0 { 2. } else { 0.5 };
        assert_relative_eq!(*p, r * scale);
    }
    assert_eq!(Readout::from_name("prediction")?, Readout::Prediction);
    assert!(matches!(Readout::from_name("logits"), Err(Error::Lookup { .. })));
    Ok(())
}

#[test]
fn reset_keeps_architecture() -> anyhow::Result<()> {
    let mut net = Mlp::new(recurrent_config())?;
    let architecture = net.architecture();
    let before = net.get_values()?;
    net.reset_model(false)?;
    assert_eq!(net.architecture(), architecture);
    assert_ne!(net.get_values()?, before);
    Ok(())
}

#[test]
fn restarted_sessions_replay_initialization() -> anyhow::Result<()> {
    let mut net = seeded(dense_config(), 21);
    let (x, y) = regression_batch(8);

    net.reset_model(true)?;
    let first = net.get_values()?;
    net.run_training_function(&x, &y, 1.)?;
    assert_ne!(net.get_values()?, first);

    net.reset_model(true)?;
    assert_eq!(net.get_values()?, first);
    assert_eq!(net.session().config().seed, Some(21));
    Ok(())
}
