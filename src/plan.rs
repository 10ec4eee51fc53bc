//! Resolution of a flag set into a normalized build plan.
//!
//! Every precedence rule between flags lives in [`BuildPlan::resolve`]; the
//! assembler only ever looks at the tagged variants produced here.

use crate::config::{FeatureFlag, NetworkConfig};
use crate::error::{NetworkError, Result};
use std::collections::BTreeSet;

/// How the generator produces its output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Single tanh image head.
    Direct,
    /// Image and mask heads on the same trunk features.
    BlendShared,
    /// Image and mask get their own upsampling stages after the bottleneck.
    BlendBranches,
    /// Image and mask get their own bottleneck and upsampling after downsampling.
    BlendEarly,
}

impl OutputMode {
    pub fn has_mask(self) -> bool {
        !matches!(self, OutputMode::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaInCoverage {
    HalfBottleneck,
    FullBottleneck,
}

/// How the condition label is mixed into the style before the AdaIN mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMix {
    None,
    Concat,
    Multiply,
}

/// Where style information enters the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleInjectionMode {
    None,
    AdaptiveNorm {
        coverage: AdaInCoverage,
        label_mix: LabelMix,
    },
    /// Style vector broadcast and concatenated with the input image.
    ConcatChannel,
    /// Per-label style maps spliced in after the content branch.
    Disentangled,
}

/// Where the condition label enters the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditioningRoute {
    /// Broadcast and concatenated with the input image.
    Input,
    /// Broadcast and concatenated after the content branch.
    Content,
    /// Multiplied with the per-label style and concatenated after the content branch.
    StyleModulated,
    /// Only reaches the AdaIN mapper.
    MapperOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSplit {
    None,
    AfterDownsample,
    MidBottleneck,
}

/// Channels concatenated to the content branch output before the remainder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splice {
    None,
    Labels,
    StyleModulatedLabels,
    Style,
    LabelsAndStyle,
}

impl Splice {
    pub fn channels(self, c_dim: usize) -> usize {
        match self {
            Splice::None => 0,
            Splice::Labels | Splice::StyleModulatedLabels | Splice::Style => c_dim,
            Splice::LabelsAndStyle => 2 * c_dim,
        }
    }

    /// Whether the spliced channels tile the per-label style along the height axis.
    pub fn tiles_style(self) -> bool {
        matches!(
            self,
            Splice::StyleModulatedLabels | Splice::Style | Splice::LabelsAndStyle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleLayout {
    /// `(batch, style_dim)`
    Shared,
    /// `(batch, c_dim, style_dim)`
    PerLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsampleNorm {
    Instance,
    Layer,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsampleMode {
    Transposed,
    Resize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleHead {
    Pooled,
    FullyConnected,
}

/// Scalar dimensions copied out of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub image_size: usize,
    pub color_dim: usize,
    pub c_dim: usize,
    pub style_dim: usize,
    pub g_conv_dim: usize,
    pub d_conv_dim: usize,
    pub g_repeat_num: usize,
    pub d_repeat_num: usize,
    pub mlp_dim: usize,
    pub mlp_blocks: usize,
}

/// Normalized, conflict-free description of what to assemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub dims: Dims,
    pub output: OutputMode,
    pub style: StyleInjectionMode,
    pub conditioning: ConditioningRoute,
    pub content_split: ContentSplit,
    pub splice: Splice,
    pub style_layout: StyleLayout,
    pub upsample_norm: UpsampleNorm,
    pub upsample: UpsampleMode,
    pub style_head: StyleHead,
    /// Spatial size of the style encoder's last feature map (2 or 4).
    pub style_floor: usize,
    pub gray_style: bool,
    pub gray_discriminator: bool,
    pub style_discriminator: bool,
    pub multi_scale: bool,
    pub discriminator_scales: usize,
}

impl BuildPlan {
    /// Resolve a configuration into a build plan.
    ///
    /// Precedence rules:
    /// - `Deterministic` forces instance norm in upsampling.
    /// - `AdaInFullBottleneck` implies `AdaIn`.
    /// - `InterStyleLabels` drops `Drit` and `DritZ`.
    /// - Attention branch variants use layer norm in upsampling even with `AdaIn`.
    /// - Label route: `InterStyleLabels` > `InterLabels` > `InterStyleConcatLabels` > input.
    /// - `Drit` and `InterStyleLabels` imply `PerLabelStyle`.
    /// - `ContentLoss` splits after downsampling when no mid-bottleneck split applies.
    /// - Without `MultiScaleDiscriminator` the pyramid has a single scale.
    pub fn resolve(config: &NetworkConfig) -> Result<Self> {
        let flags: BTreeSet<FeatureFlag> = config.flags.iter().copied().collect();
        let has = |flag: FeatureFlag| flags.contains(&flag);

        let dims = Dims {
            image_size: config.image_size,
            color_dim: config.color_dim,
            c_dim: config.c_dim,
            style_dim: config.style_dim,
            g_conv_dim: config.g_conv_dim,
            d_conv_dim: config.d_conv_dim,
            g_repeat_num: config.g_repeat_num,
            d_repeat_num: config.d_repeat_num,
            mlp_dim: config.mlp_dim,
            mlp_blocks: config.mlp_blocks,
        };
        check_dims(&dims)?;

        let inter_style_labels = has(FeatureFlag::InterStyleLabels);
        let drit = has(FeatureFlag::Drit) && !inter_style_labels;
        let drit_z = has(FeatureFlag::DritZ) && !inter_style_labels;
        let adain = has(FeatureFlag::AdaIn) || has(FeatureFlag::AdaInFullBottleneck);

        let attention: Vec<_> = [
            (FeatureFlag::Attention, OutputMode::BlendShared),
            (FeatureFlag::AttentionBranches, OutputMode::BlendBranches),
            (FeatureFlag::AttentionEarly, OutputMode::BlendEarly),
        ]
        .into_iter()
        .filter(|(flag, _)| has(*flag))
        .collect();
        let output = match attention.as_slice() {
            [] => OutputMode::Direct,
            [(_, mode)] => *mode,
            _ => {
                return Err(NetworkError::config(format!(
                    "at most one attention variant may be active, got {:?}",
                    attention.iter().map(|(flag, _)| flag).collect::<Vec<_>>()
                )))
            }
        };

        let label_mix = match (
            has(FeatureFlag::InterStyleConcatLabels),
            has(FeatureFlag::InterStyleMulLabels),
        ) {
            (true, true) => {
                return Err(NetworkError::config(
                    "InterStyleConcatLabels and InterStyleMulLabels are mutually exclusive",
                ))
            }
            (true, false) => LabelMix::Concat,
            (false, true) => LabelMix::Multiply,
            (false, false) => LabelMix::None,
        };
        if label_mix != LabelMix::None && !adain {
            return Err(NetworkError::config(
                "label mixing before the AdaIN mapper requires AdaIn",
            ));
        }

        let style = if adain {
            if drit || drit_z {
                return Err(NetworkError::config(
                    "Drit/DritZ style splicing cannot be combined with AdaIn",
                ));
            }
            let coverage = if has(FeatureFlag::AdaInFullBottleneck) {
                AdaInCoverage::FullBottleneck
            } else {
                AdaInCoverage::HalfBottleneck
            };
            StyleInjectionMode::AdaptiveNorm {
                coverage,
                label_mix,
            }
        } else {
            match (drit, drit_z) {
                (true, true) => {
                    return Err(NetworkError::config("Drit and DritZ are mutually exclusive"))
                }
                (false, true) => StyleInjectionMode::ConcatChannel,
                (true, false) => StyleInjectionMode::Disentangled,
                (false, false) => StyleInjectionMode::None,
            }
        };

        let conditioning = if inter_style_labels {
            ConditioningRoute::StyleModulated
        } else if has(FeatureFlag::InterLabels) {
            ConditioningRoute::Content
        } else if label_mix == LabelMix::Concat {
            ConditioningRoute::MapperOnly
        } else {
            ConditioningRoute::Input
        };

        let style_layout = if has(FeatureFlag::PerLabelStyle) || drit || inter_style_labels {
            StyleLayout::PerLabel
        } else {
            StyleLayout::Shared
        };
        if style == StyleInjectionMode::ConcatChannel && style_layout == StyleLayout::PerLabel {
            return Err(NetworkError::config(
                "DritZ concatenates a single style vector and needs the shared style layout",
            ));
        }
        if label_mix == LabelMix::Multiply && style_layout == StyleLayout::Shared {
            return Err(NetworkError::config(
                "InterStyleMulLabels needs one style vector per label (PerLabelStyle)",
            ));
        }

        let mid_split = matches!(
            conditioning,
            ConditioningRoute::Content | ConditioningRoute::StyleModulated
        ) || style == StyleInjectionMode::Disentangled;
        let content_split = if mid_split {
            if matches!(
                style,
                StyleInjectionMode::AdaptiveNorm {
                    coverage: AdaInCoverage::FullBottleneck,
                    ..
                }
            ) {
                return Err(NetworkError::config(
                    "AdaInFullBottleneck cannot be combined with a mid-bottleneck content split",
                ));
            }
            if output == OutputMode::BlendEarly {
                return Err(NetworkError::config(
                    "AttentionEarly cannot be combined with a mid-bottleneck content split",
                ));
            }
            if dims.g_repeat_num < 2 {
                return Err(NetworkError::config(format!(
                    "a mid-bottleneck split needs at least 2 residual blocks, got {}",
                    dims.g_repeat_num
                )));
            }
            ContentSplit::MidBottleneck
        } else if output == OutputMode::BlendEarly || has(FeatureFlag::ContentLoss) {
            ContentSplit::AfterDownsample
        } else {
            ContentSplit::None
        };

        let splice = match (content_split, conditioning, style) {
            (ContentSplit::MidBottleneck, ConditioningRoute::StyleModulated, _) => {
                Splice::StyleModulatedLabels
            }
            (ContentSplit::MidBottleneck, ConditioningRoute::Content, StyleInjectionMode::Disentangled) => {
                Splice::LabelsAndStyle
            }
            (ContentSplit::MidBottleneck, ConditioningRoute::Content, _) => Splice::Labels,
            (ContentSplit::MidBottleneck, _, StyleInjectionMode::Disentangled) => Splice::Style,
            _ => Splice::None,
        };

        let upsample_norm = if has(FeatureFlag::Deterministic) {
            UpsampleNorm::Instance
        } else if matches!(output, OutputMode::BlendBranches | OutputMode::BlendEarly) {
            UpsampleNorm::Layer
        } else if adain {
            UpsampleNorm::Adaptive
        } else {
            UpsampleNorm::Instance
        };

        let multi_scale = has(FeatureFlag::MultiScaleDiscriminator);
        let discriminator_scales = if multi_scale {
            if config.discriminator_scales < 2 {
                return Err(NetworkError::config(format!(
                    "MultiScaleDiscriminator needs at least 2 scales, got {}",
                    config.discriminator_scales
                )));
            }
            config.discriminator_scales
        } else {
            1
        };

        Ok(Self {
            dims,
            output,
            style,
            conditioning,
            content_split,
            splice,
            style_layout,
            upsample_norm,
            upsample: if has(FeatureFlag::ResizeUpsample) {
                UpsampleMode::Resize
            } else {
                UpsampleMode::Transposed
            },
            style_head: if has(FeatureFlag::FullyConnectedStyle) {
                StyleHead::FullyConnected
            } else {
                StyleHead::Pooled
            },
            style_floor: if has(FeatureFlag::CompactStyleFloor) { 2 } else { 4 },
            gray_style: has(FeatureFlag::GrayStyle),
            gray_discriminator: has(FeatureFlag::GrayDiscriminator),
            style_discriminator: has(FeatureFlag::StyleDiscriminator),
            multi_scale,
            discriminator_scales,
        })
    }

    /// Whether the generator consumes a style descriptor.
    pub fn uses_style(&self) -> bool {
        self.style != StyleInjectionMode::None
            || self.conditioning == ConditioningRoute::StyleModulated
    }

    /// AdaIN coverage and label mixing, when the style drives adaptive norms.
    pub fn adain(&self) -> Option<(AdaInCoverage, LabelMix)> {
        match self.style {
            StyleInjectionMode::AdaptiveNorm {
                coverage,
                label_mix,
            } => Some((coverage, label_mix)),
            _ => None,
        }
    }

    /// Whether labels are concatenated to the image before the stem.
    pub fn labels_at_input(&self) -> bool {
        self.conditioning == ConditioningRoute::Input
    }

    /// Stem input width: image channels plus input labels and broadcast style.
    pub fn generator_input_channels(&self) -> usize {
        let Dims {
            color_dim,
            c_dim,
            style_dim,
            ..
        } = self.dims;
        let labels = if self.labels_at_input() { c_dim } else { 0 };
        let style = if self.style == StyleInjectionMode::ConcatChannel {
            style_dim
        } else {
            0
        };
        color_dim + labels + style
    }

    /// Number of label slots in the style descriptor.
    pub fn style_slots(&self) -> usize {
        match self.style_layout {
            StyleLayout::Shared => 1,
            StyleLayout::PerLabel => self.dims.c_dim,
        }
    }

    /// Flat width of the style descriptor.
    pub fn style_width(&self) -> usize {
        self.style_slots() * self.dims.style_dim
    }

    /// Input width of the AdaIN mapper after label mixing.
    pub fn mapper_input_width(&self) -> usize {
        let concat = matches!(self.adain(), Some((_, LabelMix::Concat)));
        match (self.style_layout, concat) {
            (StyleLayout::Shared, true) => self.dims.style_dim + self.dims.c_dim,
            (StyleLayout::PerLabel, true) => 2 * self.style_width(),
            (_, false) => self.style_width(),
        }
    }

    /// Style encoder input channels; one with `GrayStyle`.
    pub fn style_channels(&self) -> usize {
        match self.gray_style {
            true => 1,
            false => self.dims.color_dim,
        }
    }

    /// Discriminator input channels; one with `GrayDiscriminator`.
    pub fn discriminator_channels(&self) -> usize {
        match self.gray_discriminator {
            true => 1,
            false => self.dims.color_dim,
        }
    }
}

fn check_dims(dims: &Dims) -> Result<()> {
    let named = [
        ("image_size", dims.image_size),
        ("color_dim", dims.color_dim),
        ("c_dim", dims.c_dim),
        ("style_dim", dims.style_dim),
        ("g_conv_dim", dims.g_conv_dim),
        ("d_conv_dim", dims.d_conv_dim),
        ("d_repeat_num", dims.d_repeat_num),
        ("mlp_dim", dims.mlp_dim),
    ];
    if let Some((name, _)) = named.iter().find(|(_, value)| *value == 0) {
        return Err(NetworkError::config(format!("{name} must be positive")));
    }
    if dims.mlp_blocks < 2 {
        return Err(NetworkError::config(format!(
            "the AdaIN mapper needs at least 2 blocks, got {}",
            dims.mlp_blocks
        )));
    }
    if !dims.image_size.is_power_of_two() {
        return Err(NetworkError::config(format!(
            "image_size must be a power of two, got {}",
            dims.image_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use FeatureFlag::*;

    fn plan(flags: &[FeatureFlag]) -> Result<BuildPlan> {
        BuildPlan::resolve(&NetworkConfig::new(64, 3, 4, 8).with_flags(flags.to_vec()))
    }

    fn is_config_error(result: Result<BuildPlan>) -> bool {
        matches!(result, Err(NetworkError::Configuration(_)))
    }

    #[test]
    fn empty_flags_resolve_to_plain_translation() {
        let plan = plan(&[]).unwrap();
        assert_eq!(plan.output, OutputMode::Direct);
        assert_eq!(plan.style, StyleInjectionMode::None);
        assert_eq!(plan.conditioning, ConditioningRoute::Input);
        assert_eq!(plan.content_split, ContentSplit::None);
        assert_eq!(plan.upsample_norm, UpsampleNorm::Instance);
        assert_eq!(plan.discriminator_scales, 1);
        assert_eq!(plan.generator_input_channels(), 3 + 4);
        assert!(!plan.uses_style());
    }

    #[test]
    fn deterministic_overrides_adaptive_and_layer_norm() {
        assert_eq!(plan(&[AdaIn]).unwrap().upsample_norm, UpsampleNorm::Adaptive);
        assert_eq!(
            plan(&[AdaIn, Deterministic]).unwrap().upsample_norm,
            UpsampleNorm::Instance
        );
        assert_eq!(
            plan(&[AttentionBranches, Deterministic]).unwrap().upsample_norm,
            UpsampleNorm::Instance
        );
    }

    #[test]
    fn full_bottleneck_implies_adain() {
        let plan = plan(&[AdaInFullBottleneck]).unwrap();
        assert_eq!(
            plan.adain(),
            Some((AdaInCoverage::FullBottleneck, LabelMix::None))
        );
        assert_eq!(plan.upsample_norm, UpsampleNorm::Adaptive);
    }

    #[test]
    fn inter_style_labels_supersedes_drit() {
        let plan = plan(&[InterStyleLabels, Drit, DritZ]).unwrap();
        assert_eq!(plan.style, StyleInjectionMode::None);
        assert_eq!(plan.conditioning, ConditioningRoute::StyleModulated);
        assert_eq!(plan.splice, Splice::StyleModulatedLabels);
        assert_eq!(plan.style_layout, StyleLayout::PerLabel);
        assert!(plan.uses_style());
    }

    #[test]
    fn attention_branches_keep_layer_norm_under_adain() {
        assert_eq!(
            plan(&[AttentionBranches, AdaIn]).unwrap().upsample_norm,
            UpsampleNorm::Layer
        );
        assert_eq!(
            plan(&[Attention, AdaIn]).unwrap().upsample_norm,
            UpsampleNorm::Adaptive
        );
    }

    #[test]
    fn label_route_precedence() {
        assert_eq!(
            plan(&[InterLabels, InterStyleLabels]).unwrap().conditioning,
            ConditioningRoute::StyleModulated
        );
        let plan_concat = plan(&[InterLabels, AdaIn, InterStyleConcatLabels]).unwrap();
        assert_eq!(plan_concat.conditioning, ConditioningRoute::Content);
        assert_eq!(plan_concat.splice, Splice::Labels);
        let mapper_only = plan(&[AdaIn, InterStyleConcatLabels]).unwrap();
        assert_eq!(mapper_only.conditioning, ConditioningRoute::MapperOnly);
        assert_eq!(mapper_only.generator_input_channels(), 3);
        assert_eq!(mapper_only.mapper_input_width(), 8 + 4);
    }

    #[test]
    fn drit_implies_per_label_style() {
        let plan = plan(&[Drit, InterLabels]).unwrap();
        assert_eq!(plan.style_layout, StyleLayout::PerLabel);
        assert_eq!(plan.splice, Splice::LabelsAndStyle);
        assert_eq!(plan.splice.channels(4), 8);
        assert_eq!(plan.style_width(), 4 * 8);
    }

    #[test]
    fn content_loss_splits_after_downsampling() {
        assert_eq!(
            plan(&[ContentLoss]).unwrap().content_split,
            ContentSplit::AfterDownsample
        );
        assert_eq!(
            plan(&[ContentLoss, InterLabels]).unwrap().content_split,
            ContentSplit::MidBottleneck
        );
        assert_eq!(
            plan(&[AttentionEarly]).unwrap().content_split,
            ContentSplit::AfterDownsample
        );
    }

    #[test]
    fn multi_scale_uses_configured_scales() {
        let config = NetworkConfig::new(64, 3, 4, 8)
            .with_discriminator_scales(2)
            .with_flags(vec![MultiScaleDiscriminator]);
        assert_eq!(BuildPlan::resolve(&config).unwrap().discriminator_scales, 2);
        let config = config.with_discriminator_scales(1);
        assert!(is_config_error(BuildPlan::resolve(&config)));
    }

    #[test]
    fn dritz_concatenates_style_at_input() {
        let plan = plan(&[DritZ]).unwrap();
        assert_eq!(plan.style, StyleInjectionMode::ConcatChannel);
        assert_eq!(plan.generator_input_channels(), 3 + 4 + 8);
        assert_eq!(plan.content_split, ContentSplit::None);
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(is_config_error(plan(&[Attention, AttentionEarly])));
        assert!(is_config_error(plan(&[AdaIn, Drit])));
        assert!(is_config_error(plan(&[AdaIn, DritZ])));
        assert!(is_config_error(plan(&[Drit, DritZ])));
        assert!(is_config_error(plan(&[
            AdaIn,
            InterStyleConcatLabels,
            InterStyleMulLabels
        ])));
        assert!(is_config_error(plan(&[InterStyleConcatLabels])));
        assert!(is_config_error(plan(&[AdaIn, InterStyleMulLabels])));
        assert!(is_config_error(plan(&[DritZ, PerLabelStyle])));
        assert!(is_config_error(plan(&[AdaInFullBottleneck, InterLabels])));
        assert!(is_config_error(plan(&[AttentionEarly, InterLabels])));
    }

    #[test]
    fn mid_split_needs_two_residual_blocks() {
        let config = NetworkConfig::new(64, 3, 4, 8)
            .with_g_repeat_num(1)
            .with_flags(vec![InterLabels]);
        assert!(is_config_error(BuildPlan::resolve(&config)));
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        assert!(is_config_error(BuildPlan::resolve(&NetworkConfig::new(
            96, 3, 4, 8
        ))));
        assert!(is_config_error(BuildPlan::resolve(&NetworkConfig::new(
            64, 3, 0, 8
        ))));
    }
}
