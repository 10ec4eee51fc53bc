//! Flag-driven topology assembly.
//!
//! Every function here is a pure function of the [`BuildPlan`]: no tensors,
//! no randomness. Topologies are validated before they are returned.

use super::pipeline::{
    ActivationSpec, AdaInRegistry, BlockSpec, NormSpec, PipelineSpec, StageBuilder, StageName,
    StageSpec,
};
use crate::error::{NetworkError, Result};
use crate::plan::{AdaInCoverage, BuildPlan, ContentSplit, OutputMode, Splice, StyleHead, UpsampleNorm};
use std::ops::Range;
use tracing::debug;

/// Hidden width of the fully connected style heads.
const FC_HIDDEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Generator,
    StyleEncoder,
    Discriminator { scale: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    Generator(GeneratorTopology),
    StyleEncoder(StyleEncoderTopology),
    Discriminator(DiscriminatorTopology),
}

/// Mask branch of an attention generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskBranch {
    /// Number of trunk stages run before the fork; 0 forks right after the splice.
    pub fork_after: usize,
    pub body: PipelineSpec,
    pub head: StageSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorTopology {
    pub input_channels: usize,
    pub image_size: usize,
    /// Stages producing the content tensor; empty without a content branch.
    pub content: PipelineSpec,
    pub splice: Splice,
    pub splice_channels: usize,
    pub trunk: PipelineSpec,
    pub image_head: StageSpec,
    pub mask: Option<MaskBranch>,
    pub registry: AdaInRegistry,
}

impl GeneratorTopology {
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Content tensor shape as `(channels, size)`.
    pub fn content_shape(&self) -> (usize, usize) {
        self.content
            .output_shape(self.input_channels, self.image_size)
    }

    /// Trunk input shape after the splice.
    pub fn trunk_input_shape(&self) -> (usize, usize) {
        let (channels, size) = self.content_shape();
        (channels + self.splice_channels, size)
    }

    /// Every stage in traversal order: content, trunk, image head, mask branch.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        let mask = self
            .mask
            .iter()
            .flat_map(|mask| mask.body.stages.iter().chain(std::iter::once(&mask.head)));
        self.content
            .stages
            .iter()
            .chain(self.trunk.stages.iter())
            .chain(std::iter::once(&self.image_head))
            .chain(mask)
    }

    pub fn validate(&self) -> Result<()> {
        self.content.validate(self.input_channels, self.image_size)?;
        let (channels, size) = self.trunk_input_shape();
        self.trunk.validate(channels, size)?;
        let (out_channels, out_size) = self.trunk.output_shape(channels, size);
        validate_head(&self.image_head, out_channels, out_size)?;
        if let Some(mask) = &self.mask {
            let (fork_channels, fork_size) = match mask.fork_after {
                0 => (channels, size),
                n => {
                    let stage = self.trunk.stages.get(n - 1).ok_or_else(|| {
                        NetworkError::config(format!("mask branch forks after missing trunk stage {n}"))
                    })?;
                    (stage.out_channels, stage.out_size)
                }
            };
            mask.body.validate(fork_channels, fork_size)?;
            let (body_channels, body_size) = mask.body.output_shape(fork_channels, fork_size);
            validate_head(&mask.head, body_channels, body_size)?;
        }
        let slots: Vec<usize> = self.stages().flat_map(StageSpec::adain_slots).collect();
        if slots != (0..self.registry.len()).collect::<Vec<_>>() {
            return Err(NetworkError::config(format!(
                "adaptive norms {slots:?} do not follow the order of the {} registered slots",
                self.registry.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleEncoderTopology {
    pub input_channels: usize,
    pub image_size: usize,
    pub pipeline: PipelineSpec,
    /// Flat width of the produced style descriptor.
    pub output_width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscriminatorTopology {
    pub scale: usize,
    pub input_channels: usize,
    /// Spatial size of this scale's input.
    pub input_size: usize,
    pub trunk: PipelineSpec,
    pub realness: StageSpec,
    pub class: StageSpec,
    pub style: Option<StageSpec>,
}

impl DiscriminatorTopology {
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.trunk
            .stages
            .iter()
            .chain([&self.realness, &self.class])
            .chain(self.style.iter())
    }
}

/// Assemble the topology for `role`.
pub fn assemble(plan: &BuildPlan, role: Role) -> Result<Topology> {
    match role {
        Role::Generator => assemble_generator(plan).map(Topology::Generator),
        Role::StyleEncoder => assemble_style_encoder(plan).map(Topology::StyleEncoder),
        Role::Discriminator { scale } => {
            assemble_discriminator(plan, scale).map(Topology::Discriminator)
        }
    }
}

/// Number of stride-2 steps in the generator's downsampling stage.
pub fn generator_down_steps(image_size: usize) -> usize {
    if image_size > 64 {
        image_size.trailing_zeros() as usize - 5
    } else {
        2
    }
}

pub fn assemble_generator(plan: &BuildPlan) -> Result<GeneratorTopology> {
    let dims = plan.dims;
    let steps = generator_down_steps(dims.image_size);
    let bottleneck_size = dims.image_size >> steps;
    if bottleneck_size < 2 {
        return Err(NetworkError::config(format!(
            "image_size {} leaves a {bottleneck_size}x{bottleneck_size} bottleneck, at least 2x2 is required",
            dims.image_size
        )));
    }
    if plan.splice.tiles_style() && bottleneck_size % dims.style_dim != 0 {
        return Err(NetworkError::config(format!(
            "style_dim {} does not tile the {bottleneck_size}-pixel content height",
            dims.style_dim
        )));
    }

    let mut registry = AdaInRegistry::default();
    let input_channels = plan.generator_input_channels();

    let mut stem = StageSpec::builder(StageName::Stem, input_channels, dims.image_size);
    stem.push(
        BlockSpec::conv(input_channels, dims.g_conv_dim, 7, 1, 3)
            .with_norm(NormSpec::Instance(dims.g_conv_dim))
            .with_activation(ActivationSpec::Relu),
    )?;
    let stem = stem.finish();

    let mut down = StageSpec::builder(StageName::Downsample, stem.out_channels, stem.out_size);
    for _ in 0..steps {
        let c = down.channels();
        down.push(
            BlockSpec::conv(c, c * 2, 4, 2, 1)
                .with_norm(NormSpec::Instance(c * 2))
                .with_activation(ActivationSpec::Relu),
        )?;
    }
    let down = down.finish();
    let (down_channels, down_size) = (down.out_channels, down.out_size);

    let coverage = plan.adain().map(|(coverage, _)| coverage);
    let half = dims.g_repeat_num / 2;
    let adaptive = |index: usize| match coverage {
        Some(AdaInCoverage::FullBottleneck) => true,
        Some(AdaInCoverage::HalfBottleneck) => index >= half,
        None => false,
    };
    let splice_channels = plan.splice.channels(dims.c_dim);

    let (content, mut trunk) = match plan.content_split {
        ContentSplit::MidBottleneck => {
            let first = bottleneck(
                StageName::ContentBottleneck,
                (down_channels, down_size),
                0..half,
                &adaptive,
                &mut registry,
            )?;
            let rest = bottleneck(
                StageName::Bottleneck,
                (first.out_channels + splice_channels, first.out_size),
                half..dims.g_repeat_num,
                &adaptive,
                &mut registry,
            )?;
            (vec![stem, down, first], vec![rest])
        }
        ContentSplit::AfterDownsample => {
            let rest = bottleneck(
                StageName::Bottleneck,
                (down_channels, down_size),
                0..dims.g_repeat_num,
                &adaptive,
                &mut registry,
            )?;
            (vec![stem, down], vec![rest])
        }
        ContentSplit::None => {
            let rest = bottleneck(
                StageName::Bottleneck,
                (down_channels, down_size),
                0..dims.g_repeat_num,
                &adaptive,
                &mut registry,
            )?;
            (vec![], vec![stem, down, rest])
        }
    };

    let bottleneck_index = trunk.len();
    let (channels, size) = last_shape(&trunk);
    let up = upsample(StageName::Upsample, plan, (channels, size), steps, &mut registry)?;
    trunk.push(up);
    let (channels, size) = last_shape(&trunk);

    let mut image_head = StageSpec::builder(StageName::ImageHead, channels, size);
    image_head.push(
        BlockSpec::conv(channels, dims.color_dim, 7, 1, 3).with_activation(ActivationSpec::Tanh),
    )?;
    let image_head = image_head.finish();

    let mask = match plan.output {
        OutputMode::Direct => None,
        OutputMode::BlendShared => Some(MaskBranch {
            fork_after: trunk.len(),
            body: PipelineSpec::default(),
            head: mask_head((channels, size))?,
        }),
        OutputMode::BlendBranches => {
            let body = upsample(
                StageName::MaskUpsample,
                plan,
                last_shape(&trunk[..bottleneck_index]),
                steps,
                &mut registry,
            )?;
            let head = mask_head((body.out_channels, body.out_size))?;
            Some(MaskBranch {
                fork_after: bottleneck_index,
                body: PipelineSpec::new(vec![body]),
                head,
            })
        }
        OutputMode::BlendEarly => {
            let mask_bottleneck = bottleneck(
                StageName::MaskBottleneck,
                last_shape(&content),
                0..dims.g_repeat_num,
                &adaptive,
                &mut registry,
            )?;
            let mask_up = upsample(
                StageName::MaskUpsample,
                plan,
                (mask_bottleneck.out_channels, mask_bottleneck.out_size),
                steps,
                &mut registry,
            )?;
            let head = mask_head((mask_up.out_channels, mask_up.out_size))?;
            Some(MaskBranch {
                fork_after: 0,
                body: PipelineSpec::new(vec![mask_bottleneck, mask_up]),
                head,
            })
        }
    };

    let topology = GeneratorTopology {
        input_channels,
        image_size: dims.image_size,
        content: PipelineSpec::new(content),
        splice: plan.splice,
        splice_channels,
        trunk: PipelineSpec::new(trunk),
        image_head,
        mask,
        registry,
    };
    topology.validate()?;
    debug!(
        stages = topology.stages().count(),
        adain_slots = topology.registry.len(),
        adain_params = topology.registry.param_count(),
        "assembled generator"
    );
    Ok(topology)
}

pub fn assemble_style_encoder(plan: &BuildPlan) -> Result<StyleEncoderTopology> {
    let dims = plan.dims;
    let floor_log2 = plan.style_floor.trailing_zeros() as usize;
    let size_log2 = dims.image_size.trailing_zeros() as usize;
    if size_log2 <= floor_log2 {
        return Err(NetworkError::config(format!(
            "image_size {} is too small for a {}x{} style floor",
            dims.image_size, plan.style_floor, plan.style_floor
        )));
    }
    // The repeated blocks are followed by one more stride-2 conv.
    let repeat = size_log2 - floor_log2 - 1;
    let input_channels = plan.style_channels();
    let conv_dim = (dims.g_conv_dim / 2).max(1);
    let output_width = plan.style_width();

    let mut stem = StageSpec::builder(StageName::Stem, input_channels, dims.image_size);
    stem.push(
        BlockSpec::conv(input_channels, conv_dim, 7, 1, 3)
            .with_bias(true)
            .with_activation(ActivationSpec::Relu),
    )?;
    let stem = stem.finish();

    let mut down = StageSpec::builder(StageName::Downsample, stem.out_channels, stem.out_size);
    for _ in 0..repeat {
        let c = down.channels();
        down.push(
            BlockSpec::conv(c, c * 2, 4, 2, 1)
                .with_bias(true)
                .with_activation(ActivationSpec::Relu),
        )?;
    }
    let c = down.channels();
    down.push(BlockSpec::conv(c, c * 2, 4, 2, 1))?;
    let down = down.finish();
    let (channels, size) = (down.out_channels, down.out_size);

    let mut stages = vec![stem, down];
    match plan.style_head {
        StyleHead::Pooled => {
            let mut pool = StageSpec::builder(StageName::Pool, channels, size);
            pool.push(BlockSpec::GlobalPool)?;
            let mut head = StageSpec::builder(StageName::StyleHead, channels, 1);
            head.push(BlockSpec::conv(channels, output_width, 1, 1, 0).with_bias(true))?;
            stages.push(pool.finish());
            stages.push(head.finish());
        }
        StyleHead::FullyConnected => {
            let fc = fully_connected(StageName::FullyConnected, (channels, size))?;
            let mut head = StageSpec::builder(StageName::StyleHead, FC_HIDDEN, 1);
            head.push(BlockSpec::linear(FC_HIDDEN, output_width))?;
            stages.push(fc.finish());
            stages.push(head.finish());
        }
    }

    let pipeline = PipelineSpec::new(stages);
    pipeline.validate(input_channels, dims.image_size)?;
    debug!(floor = plan.style_floor, output_width, "assembled style encoder");
    Ok(StyleEncoderTopology {
        input_channels,
        image_size: dims.image_size,
        pipeline,
        output_width,
    })
}

/// Discriminator for pyramid scale `scale`, whose input is downsampled by `2^scale`.
pub fn assemble_discriminator(plan: &BuildPlan, scale: usize) -> Result<DiscriminatorTopology> {
    let dims = plan.dims;
    if scale >= plan.discriminator_scales {
        return Err(NetworkError::config(format!(
            "discriminator scale {scale} outside the {}-scale pyramid",
            plan.discriminator_scales
        )));
    }
    let depth = if plan.multi_scale {
        dims.d_repeat_num - 1
    } else {
        dims.d_repeat_num
    };
    if depth == 0 {
        return Err(NetworkError::config(
            "multi-scale discriminators need d_repeat_num of at least 2",
        ));
    }
    let size_log2 = dims.image_size.trailing_zeros() as usize;
    if scale + depth > size_log2 {
        return Err(NetworkError::config(format!(
            "discriminator scale {scale} with {depth} stride-2 convs leaves no feature map at image_size {}",
            dims.image_size
        )));
    }
    let input_size = dims.image_size >> scale;
    let input_channels = plan.discriminator_channels();

    let mut trunk = StageSpec::builder(StageName::Downsample, input_channels, input_size);
    for index in 0..depth {
        let c = trunk.channels();
        let out = if index == 0 { dims.d_conv_dim } else { c * 2 };
        trunk.push(
            BlockSpec::conv(c, out, 4, 2, 1)
                .with_bias(true)
                .with_activation(ActivationSpec::LeakyRelu),
        )?;
    }
    let trunk = trunk.finish();
    let (channels, size) = (trunk.out_channels, trunk.out_size);

    let mut realness = StageSpec::builder(StageName::RealnessHead, channels, size);
    realness.push(BlockSpec::conv(channels, 1, 3, 1, 1))?;

    // Valid conv over the whole remaining map: coarser scales get smaller kernels.
    let mut class = StageSpec::builder(StageName::ClassHead, channels, size);
    class.push(BlockSpec::conv(channels, dims.c_dim, size, 1, 0))?;

    let style = if plan.style_discriminator {
        let mut head = fully_connected(StageName::StyleHead, (channels, size))?;
        head.push(BlockSpec::linear(FC_HIDDEN, plan.style_width()))?;
        Some(head.finish())
    } else {
        None
    };

    let topology = DiscriminatorTopology {
        scale,
        input_channels,
        input_size,
        trunk: PipelineSpec::new(vec![trunk]),
        realness: realness.finish(),
        class: class.finish(),
        style,
    };
    topology.trunk.validate(input_channels, input_size)?;
    debug!(scale, input_size, final_size = size, "assembled discriminator scale");
    Ok(topology)
}

/// Feed-forward mapper from the mixed style to `param_count` AdaIN parameters.
pub fn assemble_mapper(plan: &BuildPlan, param_count: usize) -> Result<PipelineSpec> {
    let dims = plan.dims;
    if param_count == 0 {
        return Err(NetworkError::config(
            "the AdaIN mapper needs at least one adaptive norm layer",
        ));
    }
    let input = plan.mapper_input_width();
    let mut mapper = StageSpec::builder(StageName::Mapper, input, 1);
    mapper.push(BlockSpec::linear(input, dims.mlp_dim).with_activation(ActivationSpec::Relu))?;
    for _ in 0..dims.mlp_blocks - 2 {
        mapper.push(
            BlockSpec::linear(dims.mlp_dim, dims.mlp_dim).with_activation(ActivationSpec::Relu),
        )?;
    }
    mapper.push(BlockSpec::linear(dims.mlp_dim, param_count))?;
    let pipeline = PipelineSpec::new(vec![mapper.finish()]);
    pipeline.validate(input, 1)?;
    Ok(pipeline)
}

fn last_shape(stages: &[StageSpec]) -> (usize, usize) {
    let stage = &stages[stages.len() - 1];
    (stage.out_channels, stage.out_size)
}

fn validate_head(head: &StageSpec, channels: usize, size: usize) -> Result<()> {
    PipelineSpec::new(vec![head.clone()]).validate(channels, size)
}

fn bottleneck(
    name: StageName,
    (channels, size): (usize, usize),
    blocks: Range<usize>,
    adaptive: &dyn Fn(usize) -> bool,
    registry: &mut AdaInRegistry,
) -> Result<StageSpec> {
    let mut stage = StageSpec::builder(name, channels, size);
    for index in blocks {
        let norms = if adaptive(index) {
            [
                registry.register(name, channels),
                registry.register(name, channels),
            ]
        } else {
            [NormSpec::Instance(channels), NormSpec::Instance(channels)]
        };
        stage.push(BlockSpec::Residual { channels, norms })?;
    }
    Ok(stage.finish())
}

fn upsample(
    name: StageName,
    plan: &BuildPlan,
    (channels, size): (usize, usize),
    steps: usize,
    registry: &mut AdaInRegistry,
) -> Result<StageSpec> {
    let mut stage = StageSpec::builder(name, channels, size);
    for _ in 0..steps {
        let c = stage.channels();
        let out = c / 2;
        if out == 0 {
            return Err(NetworkError::config(format!(
                "upsampling halves {c} channels to zero"
            )));
        }
        let norm = match plan.upsample_norm {
            UpsampleNorm::Instance => NormSpec::Instance(out),
            UpsampleNorm::Layer => NormSpec::Layer(out),
            UpsampleNorm::Adaptive => registry.register(name, out),
        };
        stage.push(BlockSpec::Upsample {
            in_channels: c,
            out_channels: out,
            mode: plan.upsample,
            norm,
            activation: ActivationSpec::Relu,
        })?;
    }
    Ok(stage.finish())
}

fn mask_head((channels, size): (usize, usize)) -> Result<StageSpec> {
    let mut head = StageSpec::builder(StageName::MaskHead, channels, size);
    head.push(BlockSpec::conv(channels, 1, 7, 1, 3).with_activation(ActivationSpec::Sigmoid))?;
    Ok(head.finish())
}

/// Flatten followed by two dropout-regularized linear layers.
fn fully_connected(name: StageName, (channels, size): (usize, usize)) -> Result<StageBuilder> {
    let mut fc = StageSpec::builder(name, channels, size);
    fc.push(BlockSpec::linear(channels * size * size, FC_HIDDEN).with_dropout(true))?;
    fc.push(BlockSpec::linear(FC_HIDDEN, FC_HIDDEN).with_dropout(true))?;
    Ok(fc)
}
