//! Style-to-normalization parameter mapping.
//!
//! [`AdaInController::apply`] maps a style descriptor (optionally mixed with
//! the condition label) to an [`AdaInParams`] value holding one scale/shift
//! pair per registered adaptive norm. Pipelines with adaptive norms refuse to
//! run without it, so the parameters always exist before the generator runs.

use super::assembler::assemble_mapper;
use super::layers::Pipeline;
use super::pipeline::AdaInRegistry;
use super::style_encoder::StyleDescriptor;
use crate::error::{NetworkError, Result};
use crate::plan::{BuildPlan, LabelMix, StyleLayout};
use burn::module::Ignored;
use burn::prelude::*;

/// Scale/shift parameters for one adaptive norm, each `(batch, channels)`.
#[derive(Clone, Debug)]
pub struct CondParams<B: Backend> {
    pub scale: Tensor<B, 2>,
    pub shift: Tensor<B, 2>,
}

/// Adaptive norm parameters for one forward pass, indexed by registry slot.
#[derive(Clone, Debug)]
pub struct AdaInParams<B: Backend> {
    slots: Vec<CondParams<B>>,
}

impl<B: Backend> AdaInParams<B> {
    pub fn new(slots: Vec<CondParams<B>>) -> Self {
        Self { slots }
    }

    /// Slice a `(batch, param_count)` vector into per-slot parameters.
    ///
    /// Chunks of `2 x channels` are taken in registry order; the first half of
    /// each chunk is the shift and the second half the scale.
    pub fn from_vector(vector: Tensor<B, 2>, registry: &AdaInRegistry) -> Result<Self> {
        let [_, width] = vector.dims();
        if width != registry.param_count() {
            return Err(NetworkError::AdaInParameterMismatch {
                expected: registry.param_count(),
                actual: width,
            });
        }
        let mut offset = 0;
        let slots = registry
            .slots()
            .iter()
            .map(|slot| {
                let c = slot.channels;
                let shift = vector.clone().slice_dim(1, offset..offset + c);
                let scale = vector.clone().slice_dim(1, offset + c..offset + 2 * c);
                offset += 2 * c;
                CondParams { scale, shift }
            })
            .collect();
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Result<&CondParams<B>> {
        self.slots
            .get(index)
            .ok_or(NetworkError::AdaInParameterMismatch {
                expected: index + 1,
                actual: self.slots.len(),
            })
    }

    /// Check slot count and widths against the registry.
    pub fn check(&self, registry: &AdaInRegistry) -> Result<()> {
        if self.slots.len() != registry.len() {
            return Err(NetworkError::AdaInParameterMismatch {
                expected: registry.len(),
                actual: self.slots.len(),
            });
        }
        for (params, slot) in self.slots.iter().zip(registry.slots()) {
            let [_, scale] = params.scale.dims();
            let [_, shift] = params.shift.dims();
            if scale != slot.channels || shift != slot.channels {
                return Err(NetworkError::shape(
                    "adaptive norm parameters",
                    slot.channels,
                    (scale, shift),
                ));
            }
        }
        Ok(())
    }
}

/// Feed-forward mapper from style (and label) to adaptive norm parameters.
#[derive(Module, Debug)]
pub struct AdaInController<B: Backend> {
    mlp: Pipeline<B>,
    registry: Ignored<AdaInRegistry>,
    label_mix: Ignored<LabelMix>,
    layout: Ignored<StyleLayout>,
    #[module(ignore)]
    c_dim: usize,
    #[module(ignore)]
    input_width: usize,
}

impl<B: Backend> AdaInController<B> {
    /// Build a mapper whose output width is the registry's parameter count.
    pub fn build(plan: &BuildPlan, registry: &AdaInRegistry, device: &B::Device) -> Result<Self> {
        let label_mix = plan
            .adain()
            .map(|(_, mix)| mix)
            .ok_or_else(|| NetworkError::config("AdaIN controller requested without AdaIn"))?;
        let mapper = assemble_mapper(plan, registry.param_count())?;
        Ok(Self {
            mlp: mapper.init(device),
            registry: Ignored(registry.clone()),
            label_mix: Ignored(label_mix),
            layout: Ignored(plan.style_layout),
            c_dim: plan.dims.c_dim,
            input_width: plan.mapper_input_width(),
        })
    }

    pub fn param_count(&self) -> usize {
        self.registry.param_count()
    }

    pub fn registry(&self) -> &AdaInRegistry {
        &self.registry
    }

    /// Compute this pass's adaptive parameters.
    pub fn apply(&self, style: &StyleDescriptor<B>, label: Tensor<B, 2>) -> Result<AdaInParams<B>> {
        let [batch, slots, style_dim] = style.dims();
        if label.dims() != [batch, self.c_dim] {
            return Err(NetworkError::shape(
                "condition",
                [batch, self.c_dim],
                label.dims(),
            ));
        }

        let expected_slots = match *self.layout {
            StyleLayout::Shared => 1,
            StyleLayout::PerLabel => self.c_dim,
        };
        if slots != expected_slots {
            return Err(NetworkError::shape(
                "style",
                [batch, expected_slots, style_dim],
                style.dims(),
            ));
        }

        let mixed = match (*self.label_mix, *self.layout) {
            (LabelMix::None, _) => style.flatten(),
            (LabelMix::Concat, StyleLayout::Shared) => Tensor::cat(vec![style.flatten(), label], 1),
            (LabelMix::Concat, StyleLayout::PerLabel) => {
                let label = label.unsqueeze_dim::<3>(2).repeat_dim(2, style_dim);
                Tensor::cat(vec![style.tensor().clone(), label], 2)
                    .reshape([batch, 2 * slots * style_dim])
            }
            (LabelMix::Multiply, _) => {
                let label = label.unsqueeze_dim::<3>(2).repeat_dim(2, style_dim);
                style
                    .tensor()
                    .clone()
                    .mul(label)
                    .reshape([batch, slots * style_dim])
            }
        };

        let [_, width] = mixed.dims();
        if width != self.input_width {
            return Err(NetworkError::shape(
                "mixed style",
                self.input_width,
                width,
            ));
        }
        let vector = self
            .mlp
            .forward(mixed.reshape([batch, width, 1, 1]), None)?
            .reshape([batch, self.param_count()]);
        AdaInParams::from_vector(vector, &self.registry)
    }
}
