use super::assembler::{assemble_discriminator, DiscriminatorTopology};
use super::layers::{Pipeline, Stage};
use crate::error::{NetworkError, Result};
use crate::plan::BuildPlan;
use burn::module::Ignored;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use tracing::info;

/// Per-scale discriminator outputs, ordered from full resolution to coarsest.
#[derive(Clone, Debug)]
pub struct DiscriminatorOutput<B: Backend> {
    /// Patch realness maps, `(batch, 1, h, w)`.
    pub realness: Vec<Tensor<B, 4>>,
    /// Class logits, `(batch, c_dim)`.
    pub class_logits: Vec<Tensor<B, 2>>,
    /// Regressed style, `(batch, style width)`, with a style head.
    pub style: Option<Vec<Tensor<B, 2>>>,
}

/// One pyramid level: strided conv trunk with realness, class and optional style heads.
#[derive(Module, Debug)]
pub struct DiscriminatorScale<B: Backend> {
    trunk: Pipeline<B>,
    realness: Stage<B>,
    class: Stage<B>,
    style: Option<Stage<B>>,
    topology: Ignored<DiscriminatorTopology>,
}

impl<B: Backend> DiscriminatorScale<B> {
    pub fn new(plan: &BuildPlan, scale: usize, device: &B::Device) -> Result<Self> {
        let topology = assemble_discriminator(plan, scale)?;
        Ok(Self {
            trunk: topology.trunk.init(device),
            realness: topology.realness.init(device),
            class: topology.class.init(device),
            style: topology.style.as_ref().map(|style| style.init(device)),
            topology: Ignored(topology),
        })
    }

    pub fn topology(&self) -> &DiscriminatorTopology {
        &self.topology
    }

    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 2>, Option<Tensor<B, 2>>)> {
        let [batch, channels, height, width] = x.dims();
        let (expected_channels, size) = (self.topology.input_channels, self.topology.input_size);
        if (channels, height, width) != (expected_channels, size, size) {
            return Err(NetworkError::shape(
                "discriminator scale input",
                [batch, expected_channels, size, size],
                x.dims(),
            ));
        }
        let h = self.trunk.forward(x, None)?;
        let realness = self.realness.forward(h.clone(), None)?;
        let class = self.class.forward(h.clone(), None)?;
        let class = class.reshape([batch, self.topology.class.out_channels]);
        let style = match &self.style {
            Some(head) => {
                let style = head.forward(h, None)?;
                let [_, width, _, _] = style.dims();
                Some(style.reshape([batch, width]))
            }
            None => None,
        };
        Ok((realness, class, style))
    }
}

/// Independent discriminators on progressively average-pooled inputs.
#[derive(Module, Debug)]
pub struct DiscriminatorPyramid<B: Backend> {
    scales: Vec<DiscriminatorScale<B>>,
    downsample: AvgPool2d,
    #[module(ignore)]
    color_dim: usize,
    #[module(ignore)]
    image_size: usize,
    #[module(ignore)]
    gray: bool,
}

impl<B: Backend> DiscriminatorPyramid<B> {
    pub fn new(plan: &BuildPlan, device: &B::Device) -> Result<Self> {
        let scales = (0..plan.discriminator_scales)
            .map(|scale| DiscriminatorScale::new(plan, scale, device))
            .collect::<Result<Vec<_>>>()?;
        info!(
            scales = scales.len(),
            gray = plan.gray_discriminator,
            style_head = plan.style_discriminator,
            "built discriminator pyramid"
        );
        Ok(Self {
            scales,
            downsample: AvgPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_count_include_pad(false)
                .init(),
            color_dim: plan.dims.color_dim,
            image_size: plan.dims.image_size,
            gray: plan.gray_discriminator,
        })
    }

    pub fn scales(&self) -> &[DiscriminatorScale<B>] {
        &self.scales
    }

    /// Score `image` at every scale; scale `i` sees the input pooled `i` times.
    pub fn forward(&self, image: Tensor<B, 4>) -> Result<DiscriminatorOutput<B>> {
        let [batch, channels, height, width] = image.dims();
        if (channels, height, width) != (self.color_dim, self.image_size, self.image_size) {
            return Err(NetworkError::shape(
                "discriminator input",
                [batch, self.color_dim, self.image_size, self.image_size],
                image.dims(),
            ));
        }
        let mut x = if self.gray {
            image.mean_dim(1)
        } else {
            image
        };

        let mut realness = Vec::with_capacity(self.scales.len());
        let mut class_logits = Vec::with_capacity(self.scales.len());
        let mut styles = Vec::with_capacity(self.scales.len());
        for (index, scale) in self.scales.iter().enumerate() {
            let (real, class, style) = scale.forward(x.clone())?;
            realness.push(real);
            class_logits.push(class);
            styles.extend(style);
            if index + 1 < self.scales.len() {
                x = self.downsample.forward(x);
            }
        }
        let style = (!styles.is_empty()).then_some(styles);
        Ok(DiscriminatorOutput {
            realness,
            class_logits,
            style,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlag, NetworkConfig};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn pyramid(flags: Vec<FeatureFlag>) -> DiscriminatorPyramid<TestBackend> {
        let config = NetworkConfig::new(32, 3, 4, 8)
            .with_d_conv_dim(4)
            .with_d_repeat_num(3)
            .with_flags(flags);
        DiscriminatorPyramid::new(&BuildPlan::resolve(&config).unwrap(), &Default::default())
            .unwrap()
    }

    #[test]
    fn single_scale_without_flag() {
        let device = Default::default();
        let pyramid = pyramid(vec![]);
        assert_eq!(pyramid.scales().len(), 1);
        let output = pyramid
            .forward(Tensor::random([2, 3, 32, 32], Distribution::Default, &device))
            .unwrap();
        assert_eq!(output.realness[0].dims(), [2, 1, 4, 4]);
        assert_eq!(output.class_logits[0].dims(), [2, 4]);
        assert!(output.style.is_none());
    }

    #[test]
    fn multi_scale_halves_each_level() {
        let device = Default::default();
        let pyramid = pyramid(vec![
            FeatureFlag::MultiScaleDiscriminator,
            FeatureFlag::GrayDiscriminator,
            FeatureFlag::StyleDiscriminator,
        ]);
        let sizes: Vec<usize> = pyramid
            .scales()
            .iter()
            .map(|scale| scale.topology().input_size)
            .collect();
        assert_eq!(sizes, vec![32, 16, 8]);

        let output = pyramid
            .forward(Tensor::ones([1, 3, 32, 32], &device))
            .unwrap();
        let realness: Vec<[usize; 4]> = output.realness.iter().map(|r| r.dims()).collect();
        assert_eq!(realness, vec![[1, 1, 8, 8], [1, 1, 4, 4], [1, 1, 2, 2]]);
        for logits in &output.class_logits {
            assert_eq!(logits.dims(), [1, 4]);
        }
        let style = output.style.unwrap();
        assert_eq!(style.len(), 3);
        assert_eq!(style[0].dims(), [1, 8]);
    }

    #[test]
    fn wrong_resolution_is_rejected() {
        let device = Default::default();
        assert!(matches!(
            pyramid(vec![]).forward(Tensor::ones([1, 3, 16, 16], &device)),
            Err(NetworkError::ShapeMismatch { .. })
        ));
    }
}
