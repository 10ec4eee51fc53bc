use super::assembler::{assemble_style_encoder, StyleEncoderTopology};
use super::layers::Pipeline;
use crate::error::{NetworkError, Result};
use crate::plan::BuildPlan;
use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::Distribution;

/// Style tensor of shape `(batch, slots, style_dim)`.
///
/// The shared layout uses a single slot; the per-label layout uses one slot
/// per condition label.
#[derive(Clone, Debug)]
pub struct StyleDescriptor<B: Backend> {
    tensor: Tensor<B, 3>,
}

impl<B: Backend> StyleDescriptor<B> {
    pub fn new(tensor: Tensor<B, 3>, slots: usize, style_dim: usize) -> Result<Self> {
        let [batch, actual_slots, actual_dim] = tensor.dims();
        if (actual_slots, actual_dim) != (slots, style_dim) {
            return Err(NetworkError::shape(
                "style descriptor",
                [batch, slots, style_dim],
                tensor.dims(),
            ));
        }
        Ok(Self { tensor })
    }

    /// Reshape a flat `(batch, slots * style_dim)` tensor.
    pub fn from_flat(flat: Tensor<B, 2>, slots: usize, style_dim: usize) -> Result<Self> {
        let [batch, width] = flat.dims();
        if width != slots * style_dim {
            return Err(NetworkError::shape(
                "flat style",
                [batch, slots * style_dim],
                [batch, width],
            ));
        }
        Ok(Self {
            tensor: flat.reshape([batch, slots, style_dim]),
        })
    }

    /// Standard normal style, the generator's prior.
    pub fn random(batch: usize, slots: usize, style_dim: usize, device: &B::Device) -> Self {
        Self {
            tensor: Tensor::random([batch, slots, style_dim], Distribution::Normal(0.0, 1.0), device),
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.tensor.dims()
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn tensor(&self) -> &Tensor<B, 3> {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor<B, 3> {
        self.tensor
    }

    pub fn flatten(&self) -> Tensor<B, 2> {
        let [batch, slots, style_dim] = self.tensor.dims();
        self.tensor.clone().reshape([batch, slots * style_dim])
    }

    /// Broadcast the flattened style over an `size x size` map.
    pub fn broadcast(&self, size: usize) -> Tensor<B, 4> {
        let flat = self.flatten();
        let [batch, width] = flat.dims();
        flat.reshape([batch, width, 1, 1])
            .repeat_dim(2, size)
            .repeat_dim(3, size)
    }

    /// Tile each slot's style along the height axis and broadcast along the width.
    ///
    /// Produces `(batch, slots, size, size)`; `size` must be a multiple of `style_dim`.
    pub fn tile(&self, size: usize) -> Tensor<B, 4> {
        let [_, _, style_dim] = self.tensor.dims();
        self.tensor
            .clone()
            .repeat_dim(2, size / style_dim)
            .unsqueeze_dim::<4>(3)
            .repeat_dim(3, size)
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            tensor: self.tensor.clone().slice_dim(0, range),
        }
    }

    pub fn to_device(&self, device: &B::Device) -> Self {
        Self {
            tensor: self.tensor.clone().to_device(device),
        }
    }

    pub fn cat(parts: Vec<Self>) -> Self {
        Self {
            tensor: Tensor::cat(parts.into_iter().map(Self::into_tensor).collect(), 0),
        }
    }
}

/// Convolutional encoder from an image to its style descriptor.
#[derive(Module, Debug)]
pub struct StyleEncoder<B: Backend> {
    pipeline: Pipeline<B>,
    topology: Ignored<StyleEncoderTopology>,
    #[module(ignore)]
    color_dim: usize,
    #[module(ignore)]
    gray: bool,
    #[module(ignore)]
    slots: usize,
    #[module(ignore)]
    style_dim: usize,
}

impl<B: Backend> StyleEncoder<B> {
    pub fn new(plan: &BuildPlan, device: &B::Device) -> Result<Self> {
        let topology = assemble_style_encoder(plan)?;
        Ok(Self {
            pipeline: topology.pipeline.init(device),
            topology: Ignored(topology),
            color_dim: plan.dims.color_dim,
            gray: plan.gray_style,
            slots: plan.style_slots(),
            style_dim: plan.dims.style_dim,
        })
    }

    pub fn topology(&self) -> &StyleEncoderTopology {
        &self.topology
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> Result<StyleDescriptor<B>> {
        let [batch, channels, height, width] = image.dims();
        let size = self.topology.image_size;
        if (channels, height, width) != (self.color_dim, size, size) {
            return Err(NetworkError::shape(
                "style encoder input",
                [batch, self.color_dim, size, size],
                image.dims(),
            ));
        }
        let x = if self.gray {
            image.mean_dim(1)
        } else {
            image
        };
        let style = self.pipeline.forward(x, None)?;
        StyleDescriptor::from_flat(
            style.reshape([batch, self.slots * self.style_dim]),
            self.slots,
            self.style_dim,
        )
    }
}
