//! Backend-free description of assembled networks.
//!
//! A [`PipelineSpec`] is an ordered list of named stages; each stage is an
//! ordered list of [`BlockSpec`]s with its channel width and spatial size
//! tracked at both ends. Specs are instantiated into burn modules by
//! [`crate::model::layers`].

use crate::error::{NetworkError, Result};
use crate::plan::UpsampleMode;
use std::fmt;

/// Stable stage identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Stem,
    Downsample,
    ContentBottleneck,
    Bottleneck,
    Upsample,
    ImageHead,
    MaskBottleneck,
    MaskUpsample,
    MaskHead,
    Pool,
    FullyConnected,
    StyleHead,
    RealnessHead,
    ClassHead,
    Mapper,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormSpec {
    None,
    Instance(usize),
    /// Per-sample normalization over channels and space with a per-channel affine.
    Layer(usize),
    /// Adaptive instance norm fed from slot `slot` of the AdaIN registry.
    Adaptive { slot: usize, channels: usize },
}

impl NormSpec {
    /// Registry slot of an adaptive norm.
    pub fn adain_slot(self) -> Option<usize> {
        match self {
            NormSpec::Adaptive { slot, .. } => Some(slot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSpec {
    None,
    Relu,
    /// Negative slope 0.01.
    LeakyRelu,
    Tanh,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSpec {
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        norm: NormSpec,
        activation: ActivationSpec,
    },
    /// Doubles the spatial size.
    Upsample {
        in_channels: usize,
        out_channels: usize,
        mode: UpsampleMode,
        norm: NormSpec,
        activation: ActivationSpec,
    },
    Residual {
        channels: usize,
        norms: [NormSpec; 2],
    },
    GlobalPool,
    /// Flattens its input before the linear map; the output is `(batch, out, 1, 1)`.
    Linear {
        in_features: usize,
        out_features: usize,
        activation: ActivationSpec,
        dropout: bool,
    },
}

impl BlockSpec {
    /// Convolution without bias, norm or activation.
    pub fn conv(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        BlockSpec::Conv {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            bias: false,
            norm: NormSpec::None,
            activation: ActivationSpec::None,
        }
    }

    /// Linear layer without activation or dropout.
    pub fn linear(in_features: usize, out_features: usize) -> Self {
        BlockSpec::Linear {
            in_features,
            out_features,
            activation: ActivationSpec::None,
            dropout: false,
        }
    }

    pub fn with_bias(mut self, value: bool) -> Self {
        if let BlockSpec::Conv { bias, .. } = &mut self {
            *bias = value;
        }
        self
    }

    pub fn with_norm(mut self, value: NormSpec) -> Self {
        if let BlockSpec::Conv { norm, .. } | BlockSpec::Upsample { norm, .. } = &mut self {
            *norm = value;
        }
        self
    }

    pub fn with_activation(mut self, value: ActivationSpec) -> Self {
        match &mut self {
            BlockSpec::Conv { activation, .. }
            | BlockSpec::Upsample { activation, .. }
            | BlockSpec::Linear { activation, .. } => *activation = value,
            BlockSpec::Residual { .. } | BlockSpec::GlobalPool => {}
        }
        self
    }

    pub fn with_dropout(mut self, value: bool) -> Self {
        if let BlockSpec::Linear { dropout, .. } = &mut self {
            *dropout = value;
        }
        self
    }

    /// Output `(channels, size)` for an input of `(channels, size)`.
    pub fn output_shape(&self, channels: usize, size: usize) -> Result<(usize, usize)> {
        let expect = |expected: usize| {
            if expected == channels {
                Ok(())
            } else {
                Err(NetworkError::config(format!(
                    "block {self:?} expects {expected} input channels, got {channels}"
                )))
            }
        };
        match *self {
            BlockSpec::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                ..
            } => {
                expect(in_channels)?;
                if size + 2 * padding < kernel {
                    return Err(NetworkError::config(format!(
                        "feature map of size {size} is smaller than kernel {kernel}"
                    )));
                }
                Ok((out_channels, conv_out(size, kernel, stride, padding)))
            }
            BlockSpec::Upsample {
                in_channels,
                out_channels,
                ..
            } => {
                expect(in_channels)?;
                Ok((out_channels, size * 2))
            }
            BlockSpec::Residual { channels: c, .. } => {
                expect(c)?;
                Ok((c, size))
            }
            BlockSpec::GlobalPool => Ok((channels, 1)),
            BlockSpec::Linear {
                in_features,
                out_features,
                ..
            } => {
                if in_features != channels * size * size {
                    return Err(NetworkError::config(format!(
                        "linear block expects {in_features} features, got {channels}x{size}x{size}"
                    )));
                }
                Ok((out_features, 1))
            }
        }
    }

    /// Norms in execution order; residual blocks carry two.
    pub fn norms(&self) -> Vec<NormSpec> {
        match *self {
            BlockSpec::Conv { norm, .. } | BlockSpec::Upsample { norm, .. } => vec![norm],
            BlockSpec::Residual { norms, .. } => norms.to_vec(),
            BlockSpec::GlobalPool | BlockSpec::Linear { .. } => vec![],
        }
    }
}

/// One named stage with its boundary shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: StageName,
    pub in_channels: usize,
    pub in_size: usize,
    pub out_channels: usize,
    pub out_size: usize,
    pub blocks: Vec<BlockSpec>,
}

impl StageSpec {
    /// Start an empty stage whose output shape equals its input shape.
    pub fn builder(name: StageName, in_channels: usize, in_size: usize) -> StageBuilder {
        StageBuilder {
            stage: StageSpec {
                name,
                in_channels,
                in_size,
                out_channels: in_channels,
                out_size: in_size,
                blocks: Vec::new(),
            },
        }
    }

    /// Adaptive norm slots in block order.
    pub fn adain_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.norms())
            .filter_map(NormSpec::adain_slot)
    }

    /// Recompute the output shape from the blocks.
    fn check(&self) -> Result<()> {
        let (channels, size) = self.blocks.iter().try_fold(
            (self.in_channels, self.in_size),
            |(channels, size), block| block.output_shape(channels, size),
        )?;
        if (channels, size) != (self.out_channels, self.out_size) {
            return Err(NetworkError::config(format!(
                "stage {} declares output {}x{}, blocks produce {}x{}",
                self.name, self.out_channels, self.out_size, channels, size
            )));
        }
        Ok(())
    }
}

/// Accumulates blocks for one stage, tracking the running output shape.
pub struct StageBuilder {
    stage: StageSpec,
}

impl StageBuilder {
    /// Output channels of the last pushed block.
    pub fn channels(&self) -> usize {
        self.stage.out_channels
    }

    pub fn size(&self) -> usize {
        self.stage.out_size
    }

    /// Append a block fed by the current output; fails when the block's input
    /// width disagrees or the map would collapse to zero size.
    pub fn push(&mut self, block: BlockSpec) -> Result<&mut Self> {
        let (channels, size) = block.output_shape(self.stage.out_channels, self.stage.out_size)?;
        if size == 0 {
            return Err(NetworkError::config(format!(
                "stage {} collapses the feature map to zero size",
                self.stage.name
            )));
        }
        self.stage.out_channels = channels;
        self.stage.out_size = size;
        self.stage.blocks.push(block);
        Ok(self)
    }

    pub fn finish(self) -> StageSpec {
        self.stage
    }
}

/// Ordered stages where each stage consumes the previous stage's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, name: StageName) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Index of the named stage.
    pub fn position(&self, name: StageName) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    /// Output shape for the given input shape, or the input shape when empty.
    pub fn output_shape(&self, in_channels: usize, in_size: usize) -> (usize, usize) {
        self.stages
            .last()
            .map(|stage| (stage.out_channels, stage.out_size))
            .unwrap_or((in_channels, in_size))
    }

    /// Check that every stage is consistent and chains into the next one.
    pub fn validate(&self, in_channels: usize, in_size: usize) -> Result<()> {
        let mut expected = (in_channels, in_size);
        for stage in &self.stages {
            stage.check()?;
            if (stage.in_channels, stage.in_size) != expected {
                return Err(NetworkError::config(format!(
                    "stage {} expects {}x{} input, previous stage produces {}x{}",
                    stage.name, stage.in_channels, stage.in_size, expected.0, expected.1
                )));
            }
            expected = (stage.out_channels, stage.out_size);
        }
        Ok(())
    }

    pub fn adain_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.stages.iter().flat_map(StageSpec::adain_slots)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaInSlot {
    pub stage: StageName,
    pub channels: usize,
}

/// Adaptive norm layers in discovery order.
///
/// Slots are appended while the assembler creates adaptive norms; the slot
/// index stored in each norm is its position here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaInRegistry {
    slots: Vec<AdaInSlot>,
}

impl AdaInRegistry {
    pub fn register(&mut self, stage: StageName, channels: usize) -> NormSpec {
        let slot = self.slots.len();
        self.slots.push(AdaInSlot { stage, channels });
        NormSpec::Adaptive { slot, channels }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[AdaInSlot] {
        &self.slots
    }

    /// Total width of the adaptive parameter vector, `2 x channels` per slot.
    pub fn param_count(&self) -> usize {
        self.slots.iter().map(|slot| 2 * slot.channels).sum()
    }
}

pub fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
