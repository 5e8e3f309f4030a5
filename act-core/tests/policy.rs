use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use act_core::{
    chunk_actions,
    models::{
        detr_vae::{DetrVae, ForwardMode},
        SplitVarBuilder,
    },
    ActConfig, ActPolicy, PositionEmbeddingType, LATENT_DIM,
};

fn tiny_config() -> ActConfig {
    ActConfig {
        hidden_dim: 32,
        nheads: 4,
        dim_feedforward: 64,
        enc_layers: 1,
        dec_layers: 1,
        num_queries: 5,
        state_dim: 3,
        action_dim: 2,
        camera_names: vec!["top".to_string(), "wrist".to_string()],
        ..Default::default()
    }
}

struct Inputs {
    qpos: Tensor,
    image: Tensor,
    actions: Tensor,
    is_pad: Tensor,
}

fn inputs(cfg: &ActConfig, batch: usize) -> Inputs {
    let dev = Device::Cpu;
    let (_, is_pad) = chunk_actions(
        &Tensor::zeros((batch, cfg.action_dim), DType::F32, &dev).unwrap(),
        cfg.num_queries,
    )
    .unwrap();
    Inputs {
        qpos: Tensor::randn(0f32, 1f32, (batch, cfg.state_dim), &dev).unwrap(),
        image: Tensor::rand(
            0f32,
            1f32,
            (batch, cfg.camera_names.len(), 3, 32, 32),
            &dev,
        )
        .unwrap(),
        actions: Tensor::randn(0f32, 1f32, (batch, cfg.num_queries, cfg.action_dim), &dev)
            .unwrap(),
        is_pad,
    }
}

fn model(cfg: &ActConfig) -> (DetrVae, VarMap, VarMap) {
    let (params, buffers) = (VarMap::new(), VarMap::new());
    let vb = SplitVarBuilder {
        params: VarBuilder::from_varmap(&params, DType::F32, &Device::Cpu),
        buffers: VarBuilder::from_varmap(&buffers, DType::F32, &Device::Cpu),
    };
    let model = DetrVae::new(cfg, vb).unwrap();
    (model, params, buffers)
}

#[test]
fn training_loss_is_finite() {
    let cfg = tiny_config();
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 2);
    let terms = policy
        .compute_loss(&x.qpos, &x.image, &x.actions, &x.is_pad)
        .unwrap();
    let l1 = terms.l1.to_scalar::<f32>().unwrap();
    let kl = terms.kl.to_scalar::<f32>().unwrap();
    let loss = terms.loss.to_scalar::<f32>().unwrap();
    assert!(l1.is_finite() && l1 >= 0.);
    assert!(kl.is_finite() && kl >= 0.);
    assert!((loss - (l1 + cfg.kl_weight as f32 * kl)).abs() < 1e-3 * loss.max(1.));
}

#[test]
fn padded_steps_do_not_contribute_to_l1() {
    let cfg = ActConfig {
        no_encoder: true,
        dropout: 0.,
        ..tiny_config()
    };
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 3);
    let pad = x
        .is_pad
        .to_dtype(DType::F32)
        .unwrap()
        .unsqueeze(2)
        .unwrap();
    assert!(pad.sum_all().unwrap().to_scalar::<f32>().unwrap() > 0.);
    let noise = Tensor::randn(0f32, 100f32, x.actions.dims(), &Device::Cpu).unwrap();
    let l1 = |actions: &Tensor| {
        policy
            .compute_loss(&x.qpos, &x.image, actions, &x.is_pad)
            .unwrap()
            .l1
            .to_scalar::<f32>()
            .unwrap()
    };

    let base = l1(&x.actions);
    let at_pad = (&x.actions + noise.broadcast_mul(&pad).unwrap()).unwrap();
    assert!((base - l1(&at_pad)).abs() < 1e-5);

    let not_pad = pad.affine(-1., 1.).unwrap();
    let at_valid = (&x.actions + noise.broadcast_mul(&not_pad).unwrap()).unwrap();
    assert!((base - l1(&at_valid)).abs() > 1e-2);
}

#[test]
fn predicted_chunk_shape() {
    let cfg = tiny_config();
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 3);
    let actions = policy.predict(&x.qpos, &x.image).unwrap();
    assert_eq!(actions.dims(), &[3, cfg.num_queries, cfg.action_dim]);

    // Dropout is off at inference, so prediction is deterministic.
    let again = policy.predict(&x.qpos, &x.image).unwrap();
    let diff = (actions - again)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert_eq!(diff, 0.);
}

#[test]
fn inference_latent_is_zero() {
    let cfg = tiny_config();
    let (model, _, _) = model(&cfg);
    for batch in [1, 4] {
        let qpos = Tensor::randn(0f32, 1f32, (batch, cfg.state_dim), &Device::Cpu).unwrap();
        let latent = model.encode(&qpos, &ForwardMode::Inference).unwrap();
        assert!(latent.distribution.is_none());
        assert_eq!(latent.latent_sample.dims(), &[batch, LATENT_DIM]);
        let max = latent
            .latent_sample
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(max, 0.);
    }
}

#[test]
fn training_latent_has_a_distribution() {
    let cfg = tiny_config();
    let (model, _, _) = model(&cfg);
    let x = inputs(&cfg, 2);
    let mode = ForwardMode::Training {
        actions: &x.actions,
        is_pad: &x.is_pad,
    };
    let latent = model.encode(&x.qpos, &mode).unwrap();
    let dist = latent.distribution.unwrap();
    assert_eq!(dist.mu.dims(), &[2, LATENT_DIM]);
    assert_eq!(dist.logvar.dims(), &[2, LATENT_DIM]);
    assert_eq!(latent.latent_input.dims(), &[2, cfg.hidden_dim]);
}

#[test]
fn without_encoder_training_uses_zero_latent() {
    let cfg = ActConfig {
        no_encoder: true,
        ..tiny_config()
    };
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 2);
    let terms = policy
        .compute_loss(&x.qpos, &x.image, &x.actions, &x.is_pad)
        .unwrap();
    assert_eq!(terms.kl.to_scalar::<f32>().unwrap(), 0.);
}

#[test]
fn action_length_must_match_queries() {
    let cfg = tiny_config();
    let (model, _, _) = model(&cfg);
    let x = inputs(&cfg, 2);
    let actions = x.actions.narrow(1, 0, 4).unwrap();
    let is_pad = x.is_pad.narrow(1, 0, 4).unwrap();
    let mode = ForwardMode::Training {
        actions: &actions,
        is_pad: &is_pad,
    };
    assert!(model.encode(&x.qpos, &mode).is_err());
}

#[test]
fn camera_count_is_checked() {
    let cfg = tiny_config();
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 2);
    let one_camera = x.image.i((.., 0..1)).unwrap();
    assert!(policy.predict(&x.qpos, &one_camera).is_err());
    let qpos = x.qpos.i(0..1).unwrap();
    assert!(policy.predict(&qpos, &x.image).is_err());
}

#[test]
fn learned_positions_and_intermediate_layers() {
    let cfg = ActConfig {
        position_embedding: PositionEmbeddingType::Learned,
        return_interm_layers: true,
        pre_norm: true,
        ..tiny_config()
    };
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let x = inputs(&cfg, 2);
    let actions = policy.predict(&x.qpos, &x.image).unwrap();
    assert_eq!(actions.dims(), &[2, cfg.num_queries, cfg.action_dim]);
}

#[test]
fn optimizer_step_moves_parameters() {
    let cfg = ActConfig {
        dropout: 0.,
        ..tiny_config()
    };
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let groups = policy.param_groups().unwrap();
    let mut opt = AdamW::new(
        groups.rest.clone(),
        ParamsAdamW {
            lr: 1e-2,
            ..Default::default()
        },
    )
    .unwrap();
    let before = groups
        .rest
        .iter()
        .map(|v| v.as_tensor().copy().unwrap())
        .collect::<Vec<_>>();

    let x = inputs(&cfg, 2);
    let terms = policy
        .compute_loss(&x.qpos, &x.image, &x.actions, &x.is_pad)
        .unwrap();
    opt.backward_step(&terms.loss).unwrap();

    let moved = groups
        .rest
        .iter()
        .zip(&before)
        .filter(|(v, b)| {
            (v.as_tensor() - *b)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
                > 0.
        })
        .count();
    assert!(moved > 0);
}

#[test]
fn save_and_load_restore_predictions() {
    let cfg = tiny_config();
    let policy = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    let path = std::env::temp_dir().join(format!("act-policy-{}.safetensors", std::process::id()));
    policy.save(&path).unwrap();

    let restored = ActPolicy::new(&cfg, &Device::Cpu).unwrap();
    restored.load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let x = inputs(&cfg, 1);
    let a = policy.predict(&x.qpos, &x.image).unwrap();
    let b = restored.predict(&x.qpos, &x.image).unwrap();
    let diff = (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-6);
}
