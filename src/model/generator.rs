use super::adain::{AdaInController, AdaInParams};
use super::assembler::{assemble_generator, GeneratorTopology};
use super::layers::{Pipeline, Stage};
use super::style_encoder::{StyleDescriptor, StyleEncoder};
use crate::error::{NetworkError, Result};
use crate::plan::{BuildPlan, Splice, StyleInjectionMode};
use burn::module::Ignored;
use burn::prelude::*;
use tracing::info;

/// Outputs of one generator pass.
#[derive(Clone, Debug)]
pub struct GeneratorOutput<B: Backend> {
    /// Translated image; blended with the source when a mask head exists.
    pub image: Tensor<B, 4>,
    /// Attention mask `(batch, 1, H, W)` in `[0, 1]`.
    pub mask: Option<Tensor<B, 4>>,
    /// Image head output before blending; present with a mask.
    pub generated: Option<Tensor<B, 4>>,
    /// Content branch output, when requested.
    pub content: Option<Tensor<B, 4>>,
}

/// Conditional generator assembled from a [`BuildPlan`].
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    content: Pipeline<B>,
    trunk: Pipeline<B>,
    image_head: Stage<B>,
    mask_body: Option<Pipeline<B>>,
    mask_head: Option<Stage<B>>,
    style_encoder: Option<StyleEncoder<B>>,
    adain: Option<AdaInController<B>>,
    topology: Ignored<GeneratorTopology>,
    plan: Ignored<BuildPlan>,
}

impl<B: Backend> Generator<B> {
    pub fn new(plan: &BuildPlan, device: &B::Device) -> Result<Self> {
        let topology = assemble_generator(plan)?;
        let style_encoder = match plan.uses_style() {
            true => Some(StyleEncoder::new(plan, device)?),
            false => None,
        };
        let adain = match plan.adain() {
            Some(_) => Some(AdaInController::build(plan, &topology.registry, device)?),
            None => None,
        };
        let (mask_body, mask_head) = match &topology.mask {
            Some(mask) => (Some(mask.body.init(device)), Some(mask.head.init(device))),
            None => (None, None),
        };
        info!(
            output = ?plan.output,
            style = ?plan.style,
            conditioning = ?plan.conditioning,
            adain_params = topology.registry.param_count(),
            "built generator"
        );
        Ok(Self {
            content: topology.content.init(device),
            trunk: topology.trunk.init(device),
            image_head: topology.image_head.init(device),
            mask_body,
            mask_head,
            style_encoder,
            adain,
            topology: Ignored(topology),
            plan: Ignored(plan.clone()),
        })
    }

    pub fn topology(&self) -> &GeneratorTopology {
        &self.topology
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    pub fn style_encoder(&self) -> Option<&StyleEncoder<B>> {
        self.style_encoder.as_ref()
    }

    /// Width of the adaptive parameter vector; zero without AdaIN.
    pub fn adain_param_count(&self) -> usize {
        self.topology.registry.param_count()
    }

    /// Translate `image` under `condition`.
    ///
    /// When the plan consumes a style and none is given, it is encoded from
    /// `image`. AdaIN parameters are computed before any stage runs.
    pub fn forward(
        &self,
        image: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        style: Option<StyleDescriptor<B>>,
        want_content: bool,
    ) -> Result<GeneratorOutput<B>> {
        self.check_inputs(&image, &condition)?;
        let style = self.resolve_style(&image, style)?;
        let params = match (&self.adain, &style) {
            (Some(adain), Some(style)) => Some(adain.apply(style, condition.clone())?),
            _ => None,
        };
        self.run(image, condition, style.as_ref(), params.as_ref(), want_content)
    }

    /// Forward pass with caller-supplied adaptive norm parameters.
    pub fn forward_with_params(
        &self,
        image: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        style: Option<StyleDescriptor<B>>,
        params: &AdaInParams<B>,
        want_content: bool,
    ) -> Result<GeneratorOutput<B>> {
        self.check_inputs(&image, &condition)?;
        self.check_style(&image, style.as_ref())?;
        params.check(&self.topology.registry)?;
        let style = match self.needs_spliced_style() {
            true => self.resolve_style(&image, style)?,
            false => None,
        };
        self.run(image, condition, style.as_ref(), Some(params), want_content)
    }

    /// Run only the content branch.
    pub fn content(
        &self,
        image: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        style: Option<StyleDescriptor<B>>,
    ) -> Result<Tensor<B, 4>> {
        self.check_inputs(&image, &condition)?;
        self.check_style(&image, style.as_ref())?;
        self.require_content()?;
        let style = match self.plan.style == StyleInjectionMode::ConcatChannel {
            true => self.resolve_style(&image, style)?,
            false => None,
        };
        let x = self.input(image, &condition, style.as_ref());
        self.content.forward(x, None)
    }

    /// Sample a style from the standard normal prior.
    pub fn random_style(&self, batch: usize, device: &B::Device) -> StyleDescriptor<B> {
        StyleDescriptor::random(
            batch,
            self.plan.style_slots(),
            self.plan.dims.style_dim,
            device,
        )
    }

    fn run(
        &self,
        image: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        style: Option<&StyleDescriptor<B>>,
        params: Option<&AdaInParams<B>>,
        want_content: bool,
    ) -> Result<GeneratorOutput<B>> {
        if want_content {
            self.require_content()?;
        }
        let x = self.input(image.clone(), &condition, style);
        let content = self.content.forward(x, params)?;
        let x = self.splice(content.clone(), &condition, style)?;

        let trunk_len = self.trunk.len();
        let fork_after = self
            .topology
            .mask
            .as_ref()
            .map_or(trunk_len, |mask| mask.fork_after);
        let fork = self.trunk.forward_range(x, 0..fork_after, params)?;
        let features = self
            .trunk
            .forward_range(fork.clone(), fork_after..trunk_len, params)?;
        let generated = self.image_head.forward(features, params)?;

        let mask = match (&self.mask_body, &self.mask_head) {
            (Some(body), Some(head)) => Some(head.forward(body.forward(fork, params)?, params)?),
            _ => None,
        };
        let (output, generated) = match &mask {
            Some(mask) => (blend(image, generated.clone(), mask.clone()), Some(generated)),
            None => (generated, None),
        };
        Ok(GeneratorOutput {
            image: output,
            mask,
            generated,
            content: want_content.then_some(content),
        })
    }

    /// Build the network input: the image plus broadcast labels and style as routed.
    fn input(
        &self,
        image: Tensor<B, 4>,
        condition: &Tensor<B, 2>,
        style: Option<&StyleDescriptor<B>>,
    ) -> Tensor<B, 4> {
        let size = self.plan.dims.image_size;
        let mut parts = vec![image];
        if self.plan.labels_at_input() {
            parts.push(broadcast(condition.clone(), size));
        }
        if let (StyleInjectionMode::ConcatChannel, Some(style)) = (self.plan.style, style) {
            parts.push(style.broadcast(size));
        }
        match parts.len() {
            1 => parts.remove(0),
            _ => Tensor::cat(parts, 1),
        }
    }

    /// Concatenate spliced channels onto the content tensor.
    fn splice(
        &self,
        content: Tensor<B, 4>,
        condition: &Tensor<B, 2>,
        style: Option<&StyleDescriptor<B>>,
    ) -> Result<Tensor<B, 4>> {
        let splice = self.topology.splice;
        if splice == Splice::None {
            return Ok(content);
        }
        let size = content.dims()[2];
        let tiled = || {
            style
                .map(|style| style.tile(size))
                .ok_or_else(|| NetworkError::config("style splice requested without a style"))
        };
        let mut parts = vec![content];
        match splice {
            Splice::None => {}
            Splice::Labels => parts.push(broadcast(condition.clone(), size)),
            Splice::Style => parts.push(tiled()?),
            Splice::LabelsAndStyle => {
                parts.push(broadcast(condition.clone(), size));
                parts.push(tiled()?);
            }
            Splice::StyleModulatedLabels => {
                parts.push(tiled()?.mul(broadcast(condition.clone(), size)));
            }
        }
        Ok(Tensor::cat(parts, 1))
    }

    fn needs_spliced_style(&self) -> bool {
        self.topology.splice.tiles_style() || self.plan.style == StyleInjectionMode::ConcatChannel
    }

    /// Use the supplied style, or encode one from `image` when the plan consumes a style.
    fn resolve_style(
        &self,
        image: &Tensor<B, 4>,
        style: Option<StyleDescriptor<B>>,
    ) -> Result<Option<StyleDescriptor<B>>> {
        self.check_style(image, style.as_ref())?;
        match (&self.style_encoder, style) {
            (None, _) => Ok(None),
            (Some(_), Some(style)) => Ok(Some(style)),
            (Some(encoder), None) => encoder.forward(image.clone()).map(Some),
        }
    }

    /// A supplied style must match the configured layout, and is rejected
    /// outright when the plan consumes no style.
    fn check_style(&self, image: &Tensor<B, 4>, style: Option<&StyleDescriptor<B>>) -> Result<()> {
        let Some(style) = style else {
            return Ok(());
        };
        if self.style_encoder.is_none() {
            return Err(NetworkError::ShapeMismatch {
                what: "style",
                expected: "no style input".into(),
                actual: format!("{:?}", style.dims()),
            });
        }
        let expected = [image.dims()[0], self.plan.style_slots(), self.plan.dims.style_dim];
        if style.dims() != expected {
            return Err(NetworkError::shape("style", expected, style.dims()));
        }
        Ok(())
    }

    fn require_content(&self) -> Result<()> {
        match self.topology.has_content() {
            true => Ok(()),
            false => Err(NetworkError::config(
                "content output requested from a generator without a content branch",
            )),
        }
    }

    fn check_inputs(&self, image: &Tensor<B, 4>, condition: &Tensor<B, 2>) -> Result<()> {
        let dims = self.plan.dims;
        let [batch, channels, height, width] = image.dims();
        if (channels, height, width) != (dims.color_dim, dims.image_size, dims.image_size) {
            return Err(NetworkError::shape(
                "image",
                [batch, dims.color_dim, dims.image_size, dims.image_size],
                image.dims(),
            ));
        }
        if condition.dims() != [batch, dims.c_dim] {
            return Err(NetworkError::shape(
                "condition",
                [batch, dims.c_dim],
                condition.dims(),
            ));
        }
        Ok(())
    }
}

/// `mask * source + (1 - mask) * generated`, with the mask shared across channels.
pub fn blend<B: Backend>(source: Tensor<B, 4>, generated: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = source.dims()[1];
    let mask = mask.repeat_dim(1, channels);
    let inverse = mask.clone().neg().add_scalar(1.0);
    source.mul(mask).add(generated.mul(inverse))
}

fn broadcast<B: Backend>(labels: Tensor<B, 2>, size: usize) -> Tensor<B, 4> {
    let [batch, c_dim] = labels.dims();
    labels
        .reshape([batch, c_dim, 1, 1])
        .repeat_dim(2, size)
        .repeat_dim(3, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlag, NetworkConfig};
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, Tolerance};
    use FeatureFlag::*;

    type TestBackend = NdArray<f32>;

    fn generator(flags: Vec<FeatureFlag>) -> Generator<TestBackend> {
        let config = NetworkConfig::new(32, 3, 4, 8)
            .with_g_conv_dim(4)
            .with_g_repeat_num(2)
            .with_mlp_dim(16)
            .with_flags(flags);
        Generator::new(&BuildPlan::resolve(&config).unwrap(), &Default::default()).unwrap()
    }

    fn inputs(batch: usize) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        (
            Tensor::random([batch, 3, 32, 32], Distribution::Uniform(-1.0, 1.0), &device),
            Tensor::ones([batch, 4], &device),
        )
    }

    #[test]
    fn blend_follows_the_mask() {
        let device = Default::default();
        let source = Tensor::<TestBackend, 4>::full([1, 3, 2, 2], 1.0, &device);
        let generated = Tensor::<TestBackend, 4>::full([1, 3, 2, 2], -1.0, &device);
        let mask = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.25, &device);
        blend(source, generated, mask).into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 4>::full([1, 3, 2, 2], -0.5, &device).into_data(),
            Tolerance::default(),
        );
    }

    #[test]
    fn every_route_preserves_image_shape() {
        let variants = [
            vec![],
            vec![AdaIn],
            vec![AdaIn, Attention],
            vec![AttentionBranches],
            vec![AttentionEarly, AdaIn],
            vec![InterLabels, AdaIn],
            vec![InterStyleLabels],
            vec![Drit, InterLabels],
            vec![Drit],
            vec![DritZ],
            vec![AdaIn, PerLabelStyle, InterStyleMulLabels],
            vec![AdaInFullBottleneck, InterStyleConcatLabels, ResizeUpsample],
        ];
        for flags in variants {
            let generator = generator(flags.clone());
            let (image, condition) = inputs(2);
            let output = generator
                .forward(image, condition, None, false)
                .unwrap_or_else(|err| panic!("{flags:?}: {err}"));
            assert_eq!(output.image.dims(), [2, 3, 32, 32], "{flags:?}");
            assert_eq!(output.mask.is_some(), generator.plan().output.has_mask());
        }
    }

    #[test]
    fn content_is_returned_on_request() {
        let generator = generator(vec![ContentLoss]);
        let (image, condition) = inputs(1);
        let output = generator
            .forward(image.clone(), condition.clone(), None, true)
            .unwrap();
        let content = output.content.unwrap();
        assert_eq!(content.dims(), [1, 16, 8, 8]);
        let only = generator.content(image, condition, None).unwrap();
        only.into_data()
            .assert_approx_eq::<f32>(&content.into_data(), Tolerance::default());
    }

    #[test]
    fn content_without_branch_fails() {
        let generator = generator(vec![]);
        let (image, condition) = inputs(1);
        assert!(matches!(
            generator.forward(image, condition, None, true),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn shape_errors_come_before_computation() {
        let device = Default::default();
        let generator = generator(vec![AdaIn]);
        let (image, _) = inputs(2);
        let condition = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        assert!(matches!(
            generator.forward(image.clone(), condition, None, false),
            Err(NetworkError::ShapeMismatch { what: "condition", .. })
        ));
        let style = StyleDescriptor::new(Tensor::zeros([2, 1, 4], &device), 1, 4).unwrap();
        assert!(matches!(
            generator.forward(image, Tensor::ones([2, 4], &device), Some(style), false),
            Err(NetworkError::ShapeMismatch { what: "style", .. })
        ));
    }

    #[test]
    fn style_is_rejected_when_nothing_consumes_it() {
        let device = Default::default();
        let plain = generator(vec![]);
        assert!(plain.style_encoder().is_none());
        let (image, condition) = inputs(7);
        let style = StyleDescriptor::new(Tensor::zeros([7, 9, 3], &device), 9, 3).unwrap();
        assert!(matches!(
            plain.forward(image.clone(), condition.clone(), Some(style.clone()), false),
            Err(NetworkError::ShapeMismatch { what: "style", .. })
        ));

        let with_content = generator(vec![ContentLoss]);
        assert!(matches!(
            with_content.content(image, condition, Some(style)),
            Err(NetworkError::ShapeMismatch { what: "style", .. })
        ));
    }

    #[test]
    fn supplied_style_is_used() {
        let device = Default::default();
        let generator = generator(vec![AdaIn]);
        let (image, condition) = inputs(2);
        let style = generator.random_style(2, &device);
        let first = generator
            .forward(image.clone(), condition.clone(), Some(style.clone()), false)
            .unwrap();
        let second = generator
            .forward(image, condition, Some(style), false)
            .unwrap();
        first
            .image
            .into_data()
            .assert_approx_eq::<f32>(&second.image.into_data(), Tolerance::default());
    }

    #[test]
    fn forward_with_params_checks_the_registry() {
        let device = Default::default();
        let generator = generator(vec![AdaIn]);
        let (image, condition) = inputs(1);
        let params = AdaInParams::new(vec![]);
        assert!(matches!(
            generator.forward_with_params(image.clone(), condition.clone(), None, &params, false),
            Err(NetworkError::AdaInParameterMismatch { .. })
        ));

        let vector = Tensor::ones([1, generator.adain_param_count()], &device);
        let params = AdaInParams::from_vector(vector, &generator.topology().registry).unwrap();
        let output = generator
            .forward_with_params(image, condition, None, &params, false)
            .unwrap();
        assert_eq!(output.image.dims(), [1, 3, 32, 32]);
    }
}
