pub mod adain;
pub mod assembler;
pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod pipeline;
pub mod style_encoder;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::plan::BuildPlan;
use burn::prelude::*;

pub use adain::{AdaInController, AdaInParams, CondParams};
pub use assembler::{assemble, Role, Topology};
pub use discriminator::{DiscriminatorOutput, DiscriminatorPyramid, DiscriminatorScale};
pub use generator::{Generator, GeneratorOutput};
pub use pipeline::{AdaInRegistry, PipelineSpec, StageName, StageSpec};
pub use style_encoder::{StyleDescriptor, StyleEncoder};

pub fn build_generator<B: Backend>(config: &NetworkConfig, device: &B::Device) -> Result<Generator<B>> {
    Generator::new(&BuildPlan::resolve(config)?, device)
}

pub fn build_discriminator_pyramid<B: Backend>(
    config: &NetworkConfig,
    device: &B::Device,
) -> Result<DiscriminatorPyramid<B>> {
    DiscriminatorPyramid::new(&BuildPlan::resolve(config)?, device)
}

pub fn build_style_encoder<B: Backend>(
    config: &NetworkConfig,
    device: &B::Device,
) -> Result<StyleEncoder<B>> {
    StyleEncoder::new(&BuildPlan::resolve(config)?, device)
}
