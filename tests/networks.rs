use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::*;
use burn::tensor::{Distribution, Tolerance};
use smit_burn::model::assembler::{assemble_generator, assemble_mapper};
use smit_burn::model::pipeline::NormSpec;
use smit_burn::{
    build_discriminator_pyramid, build_generator, build_style_encoder, BuildPlan, DataParallel,
    FeatureFlag, NetworkConfig, NetworkError,
};

type TestBackend = NdArray<f32>;

fn small(image_size: usize, flags: Vec<FeatureFlag>) -> NetworkConfig {
    NetworkConfig::new(image_size, 3, 4, 8)
        .with_g_conv_dim(8)
        .with_d_conv_dim(8)
        .with_g_repeat_num(2)
        .with_d_repeat_num(4)
        .with_mlp_dim(32)
        .with_flags(flags)
}

fn condition(batch: usize) -> Tensor<TestBackend, 2> {
    Tensor::ones([batch, 4], &Default::default())
}

#[test]
fn adain_generator_at_128() {
    let device = Default::default();
    let generator = build_generator::<TestBackend>(&small(128, vec![FeatureFlag::AdaIn]), &device)
        .unwrap();
    assert!(generator.adain_param_count() > 0);

    let image = Tensor::random([2, 3, 128, 128], Distribution::Uniform(-1.0, 1.0), &device);
    let output = generator.forward(image, condition(2), None, false).unwrap();
    assert_eq!(output.image.dims(), [2, 3, 128, 128]);
    assert!(output.mask.is_none());
}

#[test]
fn output_matches_input_at_every_supported_size() {
    let device = Default::default();
    for size in [8, 16, 32, 64, 128, 256] {
        for flags in [vec![], vec![FeatureFlag::AdaIn, FeatureFlag::Attention]] {
            let generator = build_generator::<TestBackend>(&small(size, flags.clone()), &device)
                .unwrap_or_else(|err| panic!("{size} {flags:?}: {err}"));
            let image = Tensor::random([1, 3, size, size], Distribution::Default, &device);
            let output = generator.forward(image, condition(1), None, false).unwrap();
            assert_eq!(output.image.dims(), [1, 3, size, size], "{size} {flags:?}");
        }
    }
}

#[test]
fn single_label_per_label_style_runs_end_to_end() {
    let device = Default::default();
    let config = NetworkConfig::new(32, 3, 1, 8)
        .with_g_conv_dim(8)
        .with_g_repeat_num(2)
        .with_mlp_dim(32)
        .with_flags(vec![
            FeatureFlag::AdaIn,
            FeatureFlag::PerLabelStyle,
            FeatureFlag::InterStyleConcatLabels,
        ]);
    let generator = build_generator::<TestBackend>(&config, &device).unwrap();
    let image = Tensor::random([2, 3, 32, 32], Distribution::Default, &device);
    let output = generator
        .forward(image, Tensor::ones([2, 1], &device), None, false)
        .unwrap();
    assert_eq!(output.image.dims(), [2, 3, 32, 32]);
}

#[test]
fn plain_generator_returns_only_the_image() {
    let device = Default::default();
    let generator = build_generator::<TestBackend>(&small(32, vec![]), &device).unwrap();
    assert_eq!(generator.adain_param_count(), 0);
    assert!(generator.style_encoder().is_none());

    let image = Tensor::ones([1, 3, 32, 32], &device);
    let output = generator.forward(image, condition(1), None, false).unwrap();
    assert_eq!(output.image.dims(), [1, 3, 32, 32]);
    assert!(output.mask.is_none());
    assert!(output.content.is_none());
}

#[test]
fn attention_output_blends_source_and_generated() {
    let device = Default::default();
    let generator =
        build_generator::<TestBackend>(&small(32, vec![FeatureFlag::Attention]), &device).unwrap();
    let source = Tensor::<TestBackend, 4>::full([2, 3, 32, 32], 0.5, &device);
    let output = generator
        .forward(source.clone(), condition(2), None, false)
        .unwrap();
    let mask = output.mask.unwrap();
    assert_eq!(mask.dims(), [2, 1, 32, 32]);
    let generated = output.generated.unwrap();

    let mask = mask.repeat_dim(1, 3);
    let expected = mask
        .clone()
        .mul(source)
        .add(mask.neg().add_scalar(1.0).mul(generated));
    output
        .image
        .into_data()
        .assert_approx_eq::<f32>(&expected.into_data(), Tolerance::default());
}

#[test]
fn masks_stay_in_unit_interval() {
    let device = Default::default();
    for flags in [
        vec![FeatureFlag::Attention],
        vec![FeatureFlag::AttentionBranches],
        vec![FeatureFlag::AttentionEarly],
    ] {
        let generator = build_generator::<TestBackend>(&small(32, flags), &device).unwrap();
        let image = Tensor::random([2, 3, 32, 32], Distribution::Normal(0.0, 5.0), &device);
        let mask = generator
            .forward(image, condition(2), None, false)
            .unwrap()
            .mask
            .unwrap()
            .into_data();
        assert!(mask.iter::<f32>().all(|v| (0.0..=1.0).contains(&v)));
    }
}

#[test]
fn pyramid_inputs_halve_per_scale() {
    let device = Default::default();
    let config = small(64, vec![FeatureFlag::MultiScaleDiscriminator]);
    let pyramid = build_discriminator_pyramid::<TestBackend>(&config, &device).unwrap();
    let sizes: Vec<usize> = pyramid
        .scales()
        .iter()
        .map(|scale| scale.topology().input_size)
        .collect();
    assert_eq!(sizes, vec![64, 32, 16]);

    let output = pyramid
        .forward(Tensor::random([2, 3, 64, 64], Distribution::Default, &device))
        .unwrap();
    assert_eq!(output.realness.len(), 3);
    for (scale, realness) in output.realness.iter().enumerate() {
        // Three stride-2 convs per scale.
        assert_eq!(realness.dims(), [2, 1, 8 >> scale, 8 >> scale]);
    }
}

#[test]
fn builds_are_idempotent() {
    let config = small(
        64,
        vec![
            FeatureFlag::AdaIn,
            FeatureFlag::Attention,
            FeatureFlag::InterLabels,
            FeatureFlag::ContentLoss,
        ],
    );
    let plan = BuildPlan::resolve(&config).unwrap();
    assert_eq!(
        assemble_generator(&plan).unwrap(),
        assemble_generator(&BuildPlan::resolve(&config).unwrap()).unwrap()
    );
}

#[test]
fn registry_width_matches_mapper_for_every_adain_variant() {
    let variants = [
        vec![FeatureFlag::AdaIn],
        vec![FeatureFlag::AdaInFullBottleneck],
        vec![FeatureFlag::AdaIn, FeatureFlag::Attention],
        vec![FeatureFlag::AdaIn, FeatureFlag::AttentionBranches],
        vec![FeatureFlag::AdaIn, FeatureFlag::AttentionEarly],
        vec![FeatureFlag::AdaIn, FeatureFlag::InterLabels],
        vec![FeatureFlag::AdaIn, FeatureFlag::InterStyleLabels],
        vec![FeatureFlag::AdaIn, FeatureFlag::Deterministic],
        vec![FeatureFlag::AdaIn, FeatureFlag::InterStyleConcatLabels],
    ];
    for flags in variants {
        let plan = BuildPlan::resolve(&small(64, flags.clone())).unwrap();
        let topology = assemble_generator(&plan).unwrap();
        let mapper = assemble_mapper(&plan, topology.registry.param_count()).unwrap();
        let last = mapper.stages.last().unwrap();
        assert_eq!(last.out_channels, topology.registry.param_count(), "{flags:?}");
        let discovered: usize = topology
            .stages()
            .flat_map(|stage| stage.blocks.iter())
            .flat_map(|block| block.norms())
            .filter_map(|norm| match norm {
                NormSpec::Adaptive { channels, .. } => Some(2 * channels),
                _ => None,
            })
            .sum();
        assert_eq!(discovered, topology.registry.param_count(), "{flags:?}");
    }
}

#[test]
fn style_encoder_feeds_the_generator() {
    let device = Default::default();
    let config = small(32, vec![FeatureFlag::AdaIn, FeatureFlag::PerLabelStyle]);
    let encoder = build_style_encoder::<TestBackend>(&config, &device).unwrap();
    let generator = build_generator::<TestBackend>(&config, &device).unwrap();
    let image = Tensor::random([2, 3, 32, 32], Distribution::Default, &device);
    let style = encoder.forward(image.clone()).unwrap();
    assert_eq!(style.dims(), [2, 4, 8]);
    let output = generator
        .forward(image, condition(2), Some(style), false)
        .unwrap();
    assert_eq!(output.image.dims(), [2, 3, 32, 32]);
}

#[test]
fn conflicting_flags_fail_at_construction() {
    let device = Default::default();
    let config = small(32, vec![FeatureFlag::AdaIn, FeatureFlag::Drit]);
    assert!(matches!(
        build_generator::<TestBackend>(&config, &device),
        Err(NetworkError::Configuration(_))
    ));
}

#[test]
fn data_parallel_matches_single_device() {
    let device = Default::default();
    let config = small(32, vec![FeatureFlag::AdaIn, FeatureFlag::Attention]);
    let generator = build_generator::<TestBackend>(&config, &device).unwrap();
    let image = Tensor::random([3, 3, 32, 32], Distribution::Default, &device);
    let style = generator.random_style(3, &device);

    let single = generator
        .forward(image.clone(), condition(3), Some(style.clone()), false)
        .unwrap();
    let parallel = DataParallel::<TestBackend>::new(vec![Default::default(); 2])
        .unwrap()
        .generator(&generator, image, condition(3), Some(style), false)
        .unwrap();
    assert_eq!(parallel.image.dims(), [3, 3, 32, 32]);
    parallel
        .image
        .into_data()
        .assert_approx_eq::<f32>(&single.image.into_data(), Tolerance::default());
    parallel
        .mask
        .unwrap()
        .into_data()
        .assert_approx_eq::<f32>(&single.mask.unwrap().into_data(), Tolerance::default());

    let pyramid = build_discriminator_pyramid::<TestBackend>(&config, &device).unwrap();
    let fake = Tensor::random([3, 3, 32, 32], Distribution::Default, &device);
    let single = pyramid.forward(fake.clone()).unwrap();
    let parallel = DataParallel::<TestBackend>::new(vec![Default::default(); 2])
        .unwrap()
        .discriminator(&pyramid, fake)
        .unwrap();
    parallel.class_logits[0]
        .clone()
        .into_data()
        .assert_approx_eq::<f32>(&single.class_logits[0].clone().into_data(), Tolerance::default());
}

#[test]
fn config_loads_from_json() {
    let json = r#"{
        "image_size": 64,
        "color_dim": 3,
        "c_dim": 5,
        "style_dim": 8,
        "flags": ["AdaIn", "Attention"]
    }"#;
    let config: NetworkConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.g_conv_dim, 64);
    assert_eq!(config.mlp_blocks, 3);
    assert!(config.has(FeatureFlag::AdaIn));
    assert!(!config.has(FeatureFlag::Drit));
}

#[test]
fn sample_config_builds_every_network() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/adain_attention.json");
    let config = NetworkConfig::load(&path).unwrap();
    assert_eq!(config.discriminator_scales, 3);
    let plan = BuildPlan::resolve(&config).unwrap();
    let generator = assemble_generator(&plan).unwrap();
    assert!(generator.has_content());
    assert!(generator.mask.is_some());
    assert!(generator.registry.param_count() > 0);
}
