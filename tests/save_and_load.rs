mod common;

use ac2art::network::{load_dumped_model, LayerSpec, MlpOptions, ModelDump, MultilayerPerceptron};
use ac2art::optimizer::GradDescConfig;
use ac2art::Error;
use serde_json::{json, Value};

use common::{dense_config, init, recurrent_config, regression_batch, seeded, sequences, Mlp};

#[test]
fn save_and_load() -> anyhow::Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");

    let mut network = Mlp::new(dense_config())?;
    network.save_model(&path)?;

    let mut loaded = load_dumped_model::<MultilayerPerceptron, _>(&path, None)?
        .expect("a new network is returned");
    assert_eq!(loaded.architecture(), network.architecture());
    assert_eq!(loaded.config(), network.config());
    assert_eq!(loaded.get_values()?, network.get_values()?);

    let (x, _) = regression_batch(5);
    assert_eq!(
        loaded.predict(&x)?,
        network.predict(&x)?,
        "Network structure damaged during saving."
    );
    Ok(())
}

#[test]
fn restore_into_existing_network() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");

    let mut source = seeded(recurrent_config(), 11);
    source.save_model(&path)?;

    let mut target = seeded(recurrent_config(), 12);
    assert_ne!(target.get_values()?, source.get_values()?);
    assert!(load_dumped_model(&path, Some(&mut target))?.is_none());
    assert_eq!(target.get_values()?, source.get_values()?);

    let x = sequences(2, 9, 3);
    assert_eq!(target.predict(&x)?, source.predict(&x)?);
    Ok(())
}

#[test]
fn architecture_mismatch_writes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    Mlp::new(dense_config())?.save_model(&path)?;

    let mut config = dense_config();
    config.layers_config[1] = LayerSpec::new("dense_layer", 7usize);
    let mut other = Mlp::new(config)?;
    let before = other.get_values()?;
    assert!(matches!(
        other.restore_model(&path),
        Err(Error::ArchitectureMismatch)
    ));
    assert_eq!(other.get_values()?, before);
    Ok(())
}

#[test]
fn corrupted_values_write_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    Mlp::new(dense_config())?.save_model(&path)?;

    // The last layer's bias gets one value too many.
    let mut dump: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    dump["values"]["readout_layer"]["bias"] = json!({"v": 1, "dim": [3], "data": [0., 0., 0.]});
    std::fs::write(&path, dump.to_string())?;

    let mut net = Mlp::new(dense_config())?;
    let before = net.get_values()?;
    assert!(matches!(net.restore_model(&path), Err(Error::Shape(_))));
    assert_eq!(net.get_values()?, before);
    Ok(())
}

#[test]
fn class_mismatch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    Mlp::new(dense_config())?.save_model(&path)?;

    let mut dump = ModelDump::load(&path)?;
    dump.class = "ac2art::network::Classifier".to_owned();
    dump.save(&path)?;

    match load_dumped_model::<MultilayerPerceptron, _>(&path, None) {
        Err(Error::ClassMismatch { found, .. }) => assert_eq!(found, "ac2art::network::Classifier"),
        other => panic!("unexpected result: {:?}", other.err()),
    }
    Ok(())
}

#[test]
fn missing_dump() {
    let dir = tempfile::tempdir().unwrap();
    let res = load_dumped_model::<MultilayerPerceptron, _>(dir.path().join("nothing.json"), None);
    assert!(matches!(res, Err(Error::FileNotFound(_))));
}

#[test]
fn explicit_session_is_recorded() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let implicit = dir.path().join("implicit.json");
    let explicit = dir.path().join("explicit.json");

    Mlp::new(dense_config())?.save_model(&implicit)?;
    let dump = ModelDump::load(&implicit)?;
    assert!(dump.rebuild_init.is_none());
    assert_eq!(dump.class, "ac2art::network::MultilayerPerceptron");

    let network = seeded(dense_config(), 5);
    network.save_model(&explicit)?;
    let dump = ModelDump::load(&explicit)?;
    let hints = dump.rebuild_init.expect("session hint is recorded");
    assert_eq!(hints["session"], json!({"seed": 5}));
    assert_eq!(dump.init["input_shape"], json!([null, 4]));

    let loaded = load_dumped_model::<MultilayerPerceptron, _>(&explicit, None)?
        .expect("a new network is returned");
    assert_eq!(loaded.session().config().seed, Some(5));
    assert_eq!(loaded.get_values()?, network.get_values()?);
    Ok(())
}

#[test]
fn optimizer_choice_is_saved() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    let config = dense_config().options(MlpOptions {
        optimizer: GradDescConfig::new().l_rate(0.25).into(),
    });
    Mlp::new(config.clone())?.save_model(&path)?;

    let dump = ModelDump::load(&path)?;
    assert_eq!(dump.init["optimizer"], json!({"algorithm": "gradient_descent", "l_rate": 0.25}));
    let loaded = load_dumped_model::<MultilayerPerceptron, _>(&path, None)?
        .expect("a new network is returned");
    assert_eq!(loaded.config(), &config);
    Ok(())
}
