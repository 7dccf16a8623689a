//! Loading layer configurations from JSON.

use convgate::autograd::Tensor;
use convgate::custom_grad::CustomGradConfig;
use convgate::nn::{
    conv2d_v2, Activation, BatchNormConfig, Conv2dConfig, Dilation, FilterSize, Initializer,
    Normalizer, Padding, Regularizer, VarStore,
};

#[test]
fn empty_object_gives_defaults() {
    let cfg: Conv2dConfig = serde_json::from_str("{}").expect("parse");
    assert_eq!(cfg, Conv2dConfig::default());
    assert_eq!(cfg.name, "conv2d");
    assert_eq!(cfg.b_init, Some(Initializer::Constant { value: 0.0 }));
}

#[test]
fn full_conv_config_from_json() {
    let json = r#"{
        "filter_size": {"height": 3, "width": 1},
        "dilation": {"height": 2, "width": 1},
        "padding": "left",
        "activation": "relu",
        "normalizer": {"batch_norm": {"decay": 0.9}},
        "w_init": {"kaiming_uniform": {"seed": 7}},
        "b_init": null,
        "w_regularizer": {"l2": {"scale": 0.01}},
        "name": "causal"
    }"#;
    let cfg: Conv2dConfig = serde_json::from_str(json).expect("parse");

    assert_eq!(cfg.filter_size, Some(FilterSize::from((3, 1))));
    assert_eq!(cfg.dilation, Dilation::from((2, 1)));
    assert_eq!(cfg.padding, Padding::Left);
    assert_eq!(cfg.activation, Activation::Relu);
    assert_eq!(
        cfg.normalizer,
        Some(Normalizer::BatchNorm(BatchNormConfig {
            decay: 0.9,
            epsilon: 1e-3
        }))
    );
    assert_eq!(cfg.w_init, Initializer::KaimingUniform { seed: Some(7) });
    assert_eq!(cfg.b_init, None);
    assert_eq!(cfg.w_regularizer, Some(Regularizer::L2 { scale: 0.01 }));
    assert!(cfg.trainable);
    assert_eq!(cfg.name, "causal");
}

#[test]
fn loaded_config_builds_a_layer() {
    let json = r#"{"filter_size": {"height": 3, "width": 3}, "padding": "left", "name": "from_json",
                   "w_regularizer": {"l1": {"scale": 0.5}}}"#;
    let cfg: Conv2dConfig = serde_json::from_str(json).expect("parse");

    let store = VarStore::new();
    let y = conv2d_v2(&store.root(), &Tensor::ones(&[1, 4, 4, 2]), 3, true, false, &cfg)
        .expect("conv");
    assert_eq!(y.shape(), &[1, 4, 4, 3]);
    assert!(store.get("from_json/weights").is_some());
    assert!(store.regularization_loss().is_some());
}

#[test]
fn serialized_config_reloads_equal() {
    let cfg = Conv2dConfig::conv2d_gru()
        .with_dilation(2)
        .with_normalizer(Some(Normalizer::LayerNorm))
        .with_activation(Activation::SaturatingSigmoid);
    let json = serde_json::to_string(&cfg).expect("serialize");
    let back: Conv2dConfig = serde_json::from_str(&json).expect("parse");
    assert_eq!(back, cfg);
}

#[test]
fn unknown_padding_is_rejected() {
    let err = serde_json::from_str::<Conv2dConfig>(r#"{"padding": "full"}"#);
    assert!(err.is_err());
}

#[test]
fn custom_grad_config_from_json() {
    let cfg: CustomGradConfig =
        serde_json::from_str(r#"{"use_global_vars": true, "key": "attn"}"#).expect("parse");
    assert!(cfg.use_global_vars);
    assert_eq!(cfg.key.as_deref(), Some("attn"));

    let default: CustomGradConfig = serde_json::from_str("{}").expect("parse");
    assert_eq!(default, CustomGradConfig::default());
}
