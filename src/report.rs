//! Stage shape reporting for assembled topologies.
//!
//! Reporters are passed in by the caller; nothing here keeps global state.

use crate::model::assembler::{DiscriminatorTopology, GeneratorTopology, StyleEncoderTopology};
use crate::model::pipeline::{PipelineSpec, StageName, StageSpec};
use tracing::info;

/// Receives each stage's boundary shapes as `(channels, size)`.
pub trait ShapeReporter {
    fn stage(&mut self, network: &str, stage: &StageSpec);
}

/// Emits one `tracing` event per stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ShapeReporter for TracingReporter {
    fn stage(&mut self, network: &str, stage: &StageSpec) {
        info!(
            network,
            stage = %stage.name,
            blocks = stage.blocks.len(),
            input = ?(stage.in_channels, stage.in_size),
            output = ?(stage.out_channels, stage.out_size),
            "stage"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageShape {
    pub network: String,
    pub stage: StageName,
    pub input: (usize, usize),
    pub output: (usize, usize),
}

/// Collects reported stages in order.
#[derive(Debug, Default, Clone)]
pub struct ShapeLog {
    pub entries: Vec<StageShape>,
}

impl ShapeReporter for ShapeLog {
    fn stage(&mut self, network: &str, stage: &StageSpec) {
        self.entries.push(StageShape {
            network: network.to_string(),
            stage: stage.name,
            input: (stage.in_channels, stage.in_size),
            output: (stage.out_channels, stage.out_size),
        });
    }
}

pub fn report_pipeline(network: &str, pipeline: &PipelineSpec, reporter: &mut dyn ShapeReporter) {
    for stage in &pipeline.stages {
        reporter.stage(network, stage);
    }
}

/// Content, trunk and image head under `generator`; the mask branch under `generator/mask`.
pub fn report_generator(topology: &GeneratorTopology, reporter: &mut dyn ShapeReporter) {
    report_pipeline("generator", &topology.content, reporter);
    report_pipeline("generator", &topology.trunk, reporter);
    reporter.stage("generator", &topology.image_head);
    if let Some(mask) = &topology.mask {
        report_pipeline("generator/mask", &mask.body, reporter);
        reporter.stage("generator/mask", &mask.head);
    }
}

pub fn report_style_encoder(topology: &StyleEncoderTopology, reporter: &mut dyn ShapeReporter) {
    report_pipeline("style_encoder", &topology.pipeline, reporter);
}

pub fn report_discriminator(topology: &DiscriminatorTopology, reporter: &mut dyn ShapeReporter) {
    let network = format!("discriminator/{}", topology.scale);
    for stage in topology.stages() {
        reporter.stage(&network, stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlag, NetworkConfig};
    use crate::model::assembler::{assemble_discriminator, assemble_generator};
    use crate::plan::BuildPlan;

    #[test]
    fn generator_report_follows_traversal_order() {
        let config = NetworkConfig::new(64, 3, 4, 8).with_flags(vec![
            FeatureFlag::AttentionBranches,
            FeatureFlag::ContentLoss,
        ]);
        let topology = assemble_generator(&BuildPlan::resolve(&config).unwrap()).unwrap();
        let mut log = ShapeLog::default();
        report_generator(&topology, &mut log);
        let stages: Vec<StageName> = log.entries.iter().map(|entry| entry.stage).collect();
        assert_eq!(
            stages,
            vec![
                StageName::Stem,
                StageName::Downsample,
                StageName::Bottleneck,
                StageName::Upsample,
                StageName::ImageHead,
                StageName::MaskUpsample,
                StageName::MaskHead,
            ]
        );
        assert!(log
            .entries
            .windows(2)
            .take(4)
            .all(|pair| pair[0].output == pair[1].input));
        assert_eq!(log.entries[5].network, "generator/mask");
    }

    #[test]
    fn discriminator_report_names_the_scale() {
        let config = NetworkConfig::new(64, 3, 4, 8)
            .with_d_repeat_num(4)
            .with_flags(vec![FeatureFlag::MultiScaleDiscriminator]);
        let topology = assemble_discriminator(&BuildPlan::resolve(&config).unwrap(), 1).unwrap();
        let mut log = ShapeLog::default();
        report_discriminator(&topology, &mut log);
        assert_eq!(log.entries.len(), 3);
        assert!(log.entries.iter().all(|entry| entry.network == "discriminator/1"));
        assert_eq!(log.entries[0].input, (3, 32));
    }
}
