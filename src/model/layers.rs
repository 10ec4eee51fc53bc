//! Burn modules instantiated from [`PipelineSpec`]s.

use super::adain::{AdaInParams, CondParams};
use super::pipeline::{ActivationSpec, BlockSpec, NormSpec, PipelineSpec, StageName, StageSpec};
use crate::error::{NetworkError, Result};
use crate::plan::UpsampleMode;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::interpolate::{Interpolate2d, Interpolate2dConfig, InterpolateMode};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{
    Dropout, DropoutConfig, GroupNorm, GroupNormConfig, InstanceNorm, InstanceNormConfig, Linear,
    LinearConfig, PaddingConfig2d,
};
use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu, sigmoid};

const NORM_EPSILON: f64 = 1e-5;

/// Instance normalization whose per-sample scale and shift come from the AdaIN mapper.
#[derive(Module, Clone, Debug)]
pub struct AdaptiveInstanceNorm {
    #[module(ignore)]
    slot: usize,
    #[module(ignore)]
    channels: usize,
    #[module(ignore)]
    epsilon: f64,
}

impl AdaptiveInstanceNorm {
    pub fn new(slot: usize, channels: usize) -> Self {
        Self {
            slot,
            channels,
            epsilon: NORM_EPSILON,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Normalize each sample's channels and apply `(batch, channels)` scale and shift.
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>, params: &CondParams<B>) -> Result<Tensor<B, 4>> {
        let [batch, channels, _, _] = x.dims();
        let expected = [batch, self.channels];
        if channels != self.channels {
            return Err(NetworkError::shape("adaptive norm input", self.channels, channels));
        }
        if params.scale.dims() != expected || params.shift.dims() != expected {
            return Err(NetworkError::shape(
                "adaptive norm parameters",
                expected,
                params.scale.dims(),
            ));
        }

        let mean = x.clone().mean_dims(&[2, 3]);
        let var = x.clone().sub(mean.clone()).square().mean_dims(&[2, 3]);
        let norm = (x - mean).div((var + self.epsilon).sqrt());

        let scale = params.scale.clone().reshape([batch, channels, 1, 1]);
        let shift = params.shift.clone().reshape([batch, channels, 1, 1]);
        Ok(norm.mul(scale).add(shift))
    }
}

#[derive(Module, Debug)]
pub enum Norm<B: Backend> {
    Instance(InstanceNorm<B>),
    /// Group norm with a single group: per-sample statistics, per-channel affine.
    Layer(GroupNorm<B>),
    Adaptive(AdaptiveInstanceNorm),
}

impl<B: Backend> Norm<B> {
    fn init(spec: NormSpec, device: &B::Device) -> Option<Self> {
        match spec {
            NormSpec::None => None,
            NormSpec::Instance(channels) => Some(Norm::Instance(
                InstanceNormConfig::new(channels)
                    .with_epsilon(NORM_EPSILON)
                    .init(device),
            )),
            NormSpec::Layer(channels) => Some(Norm::Layer(
                GroupNormConfig::new(1, channels)
                    .with_epsilon(NORM_EPSILON)
                    .init(device),
            )),
            NormSpec::Adaptive { slot, channels } => {
                Some(Norm::Adaptive(AdaptiveInstanceNorm::new(slot, channels)))
            }
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        match self {
            Norm::Instance(norm) => Ok(norm.forward(x)),
            Norm::Layer(norm) => Ok(norm.forward(x)),
            Norm::Adaptive(norm) => {
                let params = params.ok_or(NetworkError::AdaInParameterMismatch {
                    expected: norm.slot() + 1,
                    actual: 0,
                })?;
                norm.forward(x, params.slot(norm.slot())?)
            }
        }
    }
}

fn activate<B: Backend, const D: usize>(x: Tensor<B, D>, activation: ActivationSpec) -> Tensor<B, D> {
    match activation {
        ActivationSpec::None => x,
        ActivationSpec::Relu => relu(x),
        ActivationSpec::LeakyRelu => leaky_relu(x, 0.01),
        ActivationSpec::Tanh => x.tanh(),
        ActivationSpec::Sigmoid => sigmoid(x),
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias)
        .init(device)
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<Norm<B>>,
    activation: Ignored<ActivationSpec>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        let mut x = self.conv.forward(x);
        if let Some(norm) = &self.norm {
            x = norm.forward(x, params)?;
        }
        Ok(activate(x, *self.activation))
    }
}

/// Doubles the spatial size, either with a 4x4 transposed conv or a bilinear
/// resize followed by a 3x3 conv.
#[derive(Module, Debug)]
pub struct UpsampleBlock<B: Backend> {
    transposed: Option<ConvTranspose2d<B>>,
    resize: Option<Interpolate2d>,
    conv: Option<Conv2d<B>>,
    norm: Option<Norm<B>>,
    activation: Ignored<ActivationSpec>,
}

impl<B: Backend> UpsampleBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        let mut x = match (&self.transposed, &self.resize, &self.conv) {
            (Some(transposed), _, _) => transposed.forward(x),
            (None, Some(resize), Some(conv)) => conv.forward(resize.forward(x)),
            _ => x,
        };
        if let Some(norm) = &self.norm {
            x = norm.forward(x, params)?;
        }
        Ok(activate(x, *self.activation))
    }
}

/// `x + norm(conv(relu(norm(conv(x)))))` with 3x3 convs.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: Option<Norm<B>>,
    conv2: Conv2d<B>,
    norm2: Option<Norm<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        let mut h = self.conv1.forward(x.clone());
        if let Some(norm) = &self.norm1 {
            h = norm.forward(h, params)?;
        }
        h = relu(h);
        h = self.conv2.forward(h);
        if let Some(norm) = &self.norm2 {
            h = norm.forward(h, params)?;
        }
        Ok(x + h)
    }
}

/// Linear layer on the flattened input; the result is kept as `(batch, features, 1, 1)`.
#[derive(Module, Debug)]
pub struct LinearBlock<B: Backend> {
    linear: Linear<B>,
    dropout: Option<Dropout>,
    activation: Ignored<ActivationSpec>,
}

impl<B: Backend> LinearBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let flat = x.reshape([batch, channels * height * width]);
        let mut y = activate(self.linear.forward(flat), *self.activation);
        if let Some(dropout) = &self.dropout {
            y = dropout.forward(y);
        }
        let features = y.dims()[1];
        y.reshape([batch, features, 1, 1])
    }
}

#[derive(Module, Debug)]
pub enum Block<B: Backend> {
    Conv(ConvBlock<B>),
    Upsample(UpsampleBlock<B>),
    Residual(ResidualBlock<B>),
    GlobalPool(AdaptiveAvgPool2d),
    Linear(LinearBlock<B>),
}

impl<B: Backend> Block<B> {
    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        match self {
            Block::Conv(block) => block.forward(x, params),
            Block::Upsample(block) => block.forward(x, params),
            Block::Residual(block) => block.forward(x, params),
            Block::GlobalPool(pool) => Ok(pool.forward(x)),
            Block::Linear(block) => Ok(block.forward(x)),
        }
    }
}

impl BlockSpec {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Block<B> {
        match *self {
            BlockSpec::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                bias,
                norm,
                activation,
            } => Block::Conv(ConvBlock {
                conv: conv(in_channels, out_channels, kernel, stride, padding, bias, device),
                norm: Norm::init(norm, device),
                activation: Ignored(activation),
            }),
            BlockSpec::Upsample {
                in_channels,
                out_channels,
                mode,
                norm,
                activation,
            } => {
                let (transposed, resize, conv) = match mode {
                    UpsampleMode::Transposed => (
                        Some(
                            ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
                                .with_stride([2, 2])
                                .with_padding([1, 1])
                                .with_bias(false)
                                .init(device),
                        ),
                        None,
                        None,
                    ),
                    UpsampleMode::Resize => (
                        None,
                        Some(
                            Interpolate2dConfig::new()
                                .with_scale_factor(Some([2.0, 2.0]))
                                .with_mode(InterpolateMode::Linear)
                                .init(),
                        ),
                        Some(conv(in_channels, out_channels, 3, 1, 1, false, device)),
                    ),
                };
                Block::Upsample(UpsampleBlock {
                    transposed,
                    resize,
                    conv,
                    norm: Norm::init(norm, device),
                    activation: Ignored(activation),
                })
            }
            BlockSpec::Residual { channels, norms } => Block::Residual(ResidualBlock {
                conv1: conv(channels, channels, 3, 1, 1, false, device),
                norm1: Norm::init(norms[0], device),
                conv2: conv(channels, channels, 3, 1, 1, false, device),
                norm2: Norm::init(norms[1], device),
            }),
            BlockSpec::GlobalPool => {
                Block::GlobalPool(AdaptiveAvgPool2dConfig::new([1, 1]).init())
            }
            BlockSpec::Linear {
                in_features,
                out_features,
                activation,
                dropout,
            } => Block::Linear(LinearBlock {
                linear: LinearConfig::new(in_features, out_features).init(device),
                dropout: dropout.then(|| DropoutConfig::new(0.5).init()),
                activation: Ignored(activation),
            }),
        }
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<Block<B>>,
    name: Ignored<StageName>,
}

impl<B: Backend> Stage<B> {
    pub fn name(&self) -> StageName {
        *self.name
    }

    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        self.blocks
            .iter()
            .try_fold(x, |x, block| block.forward(x, params))
    }
}

impl StageSpec {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Stage<B> {
        Stage {
            blocks: self.blocks.iter().map(|block| block.init(device)).collect(),
            name: Ignored(self.name),
        }
    }
}

/// Stages executed in order.
#[derive(Module, Debug)]
pub struct Pipeline<B: Backend> {
    stages: Vec<Stage<B>>,
}

impl<B: Backend> Pipeline<B> {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn forward(&self, x: Tensor<B, 4>, params: Option<&AdaInParams<B>>) -> Result<Tensor<B, 4>> {
        self.forward_range(x, 0..self.stages.len(), params)
    }

    /// Run only the stages in `range`; used to fork branches off the trunk.
    pub fn forward_range(
        &self,
        x: Tensor<B, 4>,
        range: std::ops::Range<usize>,
        params: Option<&AdaInParams<B>>,
    ) -> Result<Tensor<B, 4>> {
        self.stages[range]
            .iter()
            .try_fold(x, |x, stage| stage.forward(x, params))
    }
}

impl PipelineSpec {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Pipeline<B> {
        Pipeline {
            stages: self.stages.iter().map(|stage| stage.init(device)).collect(),
        }
    }
}
