use burn::config::Config;
use serde::{Deserialize, Serialize};

/// Architectural switches selected at construction time.
///
/// Flags interact; [`crate::plan::BuildPlan::resolve`] turns a flag set into a
/// normalized build plan and rejects combinations that cannot be assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Shared trunk with an image head and a sigmoid mask head.
    Attention,
    /// Separate upsampling branches for the image and the mask.
    AttentionBranches,
    /// Separate bottleneck and upsampling branches forking right after downsampling.
    AttentionEarly,
    /// Adaptive instance norm in the second half of the bottleneck and in upsampling.
    AdaIn,
    /// Adaptive instance norm in every bottleneck residual block.
    AdaInFullBottleneck,
    /// Labels are concatenated after the content branch instead of at the input.
    InterLabels,
    /// Style-modulated labels are concatenated after the content branch.
    InterStyleLabels,
    /// Labels are concatenated with the style before the AdaIN mapper.
    InterStyleConcatLabels,
    /// Labels multiply the style before the AdaIN mapper.
    InterStyleMulLabels,
    /// Expose the content branch output.
    ContentLoss,
    /// Style maps are concatenated after the content branch.
    Drit,
    /// The style vector is broadcast and concatenated at the input.
    DritZ,
    /// One style vector per label slot.
    PerLabelStyle,
    /// Style encoder stops at a 2x2 feature map instead of 4x4.
    CompactStyleFloor,
    /// Fully connected style head instead of global pooling.
    FullyConnectedStyle,
    GrayStyle,
    GrayDiscriminator,
    /// Discriminator regresses the style descriptor.
    StyleDiscriminator,
    MultiScaleDiscriminator,
    /// Plain instance norm in upsampling regardless of other flags.
    Deterministic,
    /// Bilinear resize followed by a 3x3 conv instead of a transposed conv.
    ResizeUpsample,
}

/// Hyperparameters for every network assembled by this crate.
///
/// Only the four data dimensions are required in a JSON file; every other
/// field falls back to its default when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub image_size: usize,
    pub color_dim: usize,
    pub c_dim: usize,
    pub style_dim: usize,
    #[serde(default = "default_conv_dim")]
    pub g_conv_dim: usize,
    #[serde(default = "default_conv_dim")]
    pub d_conv_dim: usize,
    #[serde(default = "default_repeat_num")]
    pub g_repeat_num: usize,
    #[serde(default = "default_repeat_num")]
    pub d_repeat_num: usize,
    #[serde(default = "default_mlp_dim")]
    pub mlp_dim: usize,
    #[serde(default = "default_mlp_blocks")]
    pub mlp_blocks: usize,
    #[serde(default = "default_discriminator_scales")]
    pub discriminator_scales: usize,
    #[serde(default)]
    pub flags: Vec<FeatureFlag>,
}

fn default_conv_dim() -> usize {
    64
}

fn default_repeat_num() -> usize {
    6
}

fn default_mlp_dim() -> usize {
    256
}

fn default_mlp_blocks() -> usize {
    3
}

fn default_discriminator_scales() -> usize {
    3
}

impl Config for NetworkConfig {}

impl NetworkConfig {
    pub fn new(image_size: usize, color_dim: usize, c_dim: usize, style_dim: usize) -> Self {
        Self {
            image_size,
            color_dim,
            c_dim,
            style_dim,
            g_conv_dim: default_conv_dim(),
            d_conv_dim: default_conv_dim(),
            g_repeat_num: default_repeat_num(),
            d_repeat_num: default_repeat_num(),
            mlp_dim: default_mlp_dim(),
            mlp_blocks: default_mlp_blocks(),
            discriminator_scales: default_discriminator_scales(),
            flags: Vec::new(),
        }
    }

    /// Base width of the generator and style encoder.
    pub fn with_g_conv_dim(mut self, g_conv_dim: usize) -> Self {
        self.g_conv_dim = g_conv_dim;
        self
    }

    /// Base width of each discriminator scale.
    pub fn with_d_conv_dim(mut self, d_conv_dim: usize) -> Self {
        self.d_conv_dim = d_conv_dim;
        self
    }

    /// Number of residual blocks in the generator bottleneck.
    pub fn with_g_repeat_num(mut self, g_repeat_num: usize) -> Self {
        self.g_repeat_num = g_repeat_num;
        self
    }

    /// Number of stride-2 convs in a single-scale discriminator.
    pub fn with_d_repeat_num(mut self, d_repeat_num: usize) -> Self {
        self.d_repeat_num = d_repeat_num;
        self
    }

    pub fn with_mlp_dim(mut self, mlp_dim: usize) -> Self {
        self.mlp_dim = mlp_dim;
        self
    }

    pub fn with_mlp_blocks(mut self, mlp_blocks: usize) -> Self {
        self.mlp_blocks = mlp_blocks;
        self
    }

    pub fn with_discriminator_scales(mut self, discriminator_scales: usize) -> Self {
        self.discriminator_scales = discriminator_scales;
        self
    }

    pub fn with_flags(mut self, flags: Vec<FeatureFlag>) -> Self {
        self.flags = flags;
        self
    }

    pub fn has(&self, flag: FeatureFlag) -> bool {
        self.flags.contains(&flag)
    }
}
