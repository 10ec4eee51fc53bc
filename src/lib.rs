//! Conditional image translation networks assembled from feature flags.
//!
//! A [`NetworkConfig`] is resolved into a [`plan::BuildPlan`], the plan is
//! assembled into backend-free topologies, and the topologies are instantiated
//! as burn modules.

pub mod config;
pub mod error;
pub mod model;
pub mod parallel;
pub mod plan;
pub mod report;

pub use config::{FeatureFlag, NetworkConfig};
pub use error::{NetworkError, Result};
pub use model::{
    build_discriminator_pyramid, build_generator, build_style_encoder, DiscriminatorOutput,
    DiscriminatorPyramid, Generator, GeneratorOutput, StyleDescriptor, StyleEncoder,
};
pub use parallel::DataParallel;
pub use plan::BuildPlan;
