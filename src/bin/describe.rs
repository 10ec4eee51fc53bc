use anyhow::{Context, Result};
use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use smit_burn::model::assembler::{assemble_discriminator, assemble_generator, assemble_style_encoder};
use smit_burn::model::pipeline::StageSpec;
use smit_burn::plan::BuildPlan;
use smit_burn::report::{report_discriminator, report_generator, report_style_encoder, ShapeReporter};
use smit_burn::{DiscriminatorPyramid, Generator, NetworkConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Print the networks assembled from a configuration")]
struct Args {
    /// JSON network configuration.
    #[arg(long)]
    config: PathBuf,
    /// Run a forward pass on the CPU backend and print output shapes.
    #[arg(long, default_value_t = false)]
    probe: bool,
    #[arg(long, default_value_t = 1)]
    batch: usize,
}

struct PrintReporter;

impl ShapeReporter for PrintReporter {
    fn stage(&mut self, network: &str, stage: &StageSpec) {
        println!(
            "{network:<18} {:<18} {:>2} blocks  {:>4}x{:<3} -> {:>4}x{:<3}",
            stage.name.to_string(),
            stage.blocks.len(),
            stage.in_channels,
            stage.in_size,
            stage.out_channels,
            stage.out_size
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = NetworkConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let plan = BuildPlan::resolve(&config).context("invalid flag combination")?;
    println!("flags: {:?}", config.flags);
    println!(
        "output {:?}, style {:?}, conditioning {:?}, content split {:?}, upsample norm {:?}",
        plan.output, plan.style, plan.conditioning, plan.content_split, plan.upsample_norm
    );

    let mut reporter = PrintReporter;
    let generator = assemble_generator(&plan).context("failed to assemble generator")?;
    report_generator(&generator, &mut reporter);
    println!(
        "adain layers: {}, adain parameters: {}",
        generator.registry.len(),
        generator.registry.param_count()
    );
    if plan.uses_style() {
        let encoder = assemble_style_encoder(&plan).context("failed to assemble style encoder")?;
        report_style_encoder(&encoder, &mut reporter);
    }
    for scale in 0..plan.discriminator_scales {
        let discriminator = assemble_discriminator(&plan, scale)
            .with_context(|| format!("failed to assemble discriminator scale {scale}"))?;
        report_discriminator(&discriminator, &mut reporter);
    }

    if args.probe {
        probe(&plan, args.batch)?;
    }
    Ok(())
}

fn probe(plan: &BuildPlan, batch: usize) -> Result<()> {
    type Backend = NdArray<f32>;
    let device = Default::default();
    let dims = plan.dims;

    let generator = Generator::<Backend>::new(plan, &device)?;
    let discriminator = DiscriminatorPyramid::<Backend>::new(plan, &device)?;
    let image = Tensor::<Backend, 4>::random(
        [batch, dims.color_dim, dims.image_size, dims.image_size],
        Distribution::Uniform(-1.0, 1.0),
        &device,
    );
    let condition = Tensor::<Backend, 2>::ones([batch, dims.c_dim], &device);

    let want_content = generator.topology().has_content();
    let output = generator
        .forward(image, condition, None, want_content)
        .context("generator forward failed")?;
    println!("generator image: {:?}", output.image.dims());
    if let Some(mask) = &output.mask {
        println!("generator mask: {:?}", mask.dims());
    }
    if let Some(content) = &output.content {
        println!("generator content: {:?}", content.dims());
    }

    let scores = discriminator
        .forward(output.image)
        .context("discriminator forward failed")?;
    for (scale, (realness, class)) in scores.realness.iter().zip(&scores.class_logits).enumerate() {
        println!(
            "discriminator {scale}: realness {:?}, classes {:?}",
            realness.dims(),
            class.dims()
        );
    }
    Ok(())
}
