//! Data-parallel forward passes over several devices.
//!
//! The batch is split into contiguous shards, each shard runs on its own
//! replica of the module, and the outputs are concatenated back on the first
//! device in batch order. Shards run one after another on the calling thread.

use crate::error::{NetworkError, Result};
use crate::model::{
    DiscriminatorOutput, DiscriminatorPyramid, Generator, GeneratorOutput, StyleDescriptor,
};
use burn::prelude::*;
use std::ops::Range;
use tracing::debug;

/// Inputs that can be split along the batch axis and moved to a device.
pub trait Shard<B: Backend>: Sized {
    fn batch_size(&self) -> usize;

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self;
}

/// Outputs that can be concatenated along the batch axis on one device.
pub trait Gather<B: Backend>: Sized {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self;
}

impl<B: Backend, const D: usize> Shard<B> for Tensor<B, D> {
    fn batch_size(&self) -> usize {
        self.dims()[0]
    }

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self {
        self.clone().slice_dim(0, range).to_device(device)
    }
}

impl<B: Backend, const D: usize> Gather<B> for Tensor<B, D> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        Tensor::cat(
            parts.into_iter().map(|part| part.to_device(device)).collect(),
            0,
        )
    }
}

impl<B: Backend> Shard<B> for StyleDescriptor<B> {
    fn batch_size(&self) -> usize {
        StyleDescriptor::batch_size(self)
    }

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self {
        self.slice(range).to_device(device)
    }
}

impl<B: Backend, T: Shard<B>> Shard<B> for Option<T> {
    fn batch_size(&self) -> usize {
        self.as_ref().map_or(0, T::batch_size)
    }

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self {
        self.as_ref().map(|inner| inner.shard(range, device))
    }
}

impl<B: Backend, T: Gather<B>> Gather<B> for Option<T> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        parts
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .map(|parts| T::gather(parts, device))
    }
}

/// Per-scale lists are gathered element-wise.
impl<B: Backend, T: Gather<B>> Gather<B> for Vec<T> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        let mut columns: Vec<Vec<T>> = Vec::new();
        for part in parts {
            for (index, item) in part.into_iter().enumerate() {
                match columns.get_mut(index) {
                    Some(column) => column.push(item),
                    None => columns.push(vec![item]),
                }
            }
        }
        columns
            .into_iter()
            .map(|column| T::gather(column, device))
            .collect()
    }
}

impl<B: Backend, X: Shard<B>, Y: Shard<B>> Shard<B> for (X, Y) {
    fn batch_size(&self) -> usize {
        self.0.batch_size()
    }

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self {
        (self.0.shard(range.clone(), device), self.1.shard(range, device))
    }
}

impl<B: Backend, X: Shard<B>, Y: Shard<B>, Z: Shard<B>> Shard<B> for (X, Y, Z) {
    fn batch_size(&self) -> usize {
        self.0.batch_size()
    }

    fn shard(&self, range: Range<usize>, device: &B::Device) -> Self {
        (
            self.0.shard(range.clone(), device),
            self.1.shard(range.clone(), device),
            self.2.shard(range, device),
        )
    }
}

impl<B: Backend> Gather<B> for GeneratorOutput<B> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        let mut images = Vec::with_capacity(parts.len());
        let mut masks = Vec::with_capacity(parts.len());
        let mut generated = Vec::with_capacity(parts.len());
        let mut contents = Vec::with_capacity(parts.len());
        for part in parts {
            images.push(part.image);
            masks.push(part.mask);
            generated.push(part.generated);
            contents.push(part.content);
        }
        GeneratorOutput {
            image: Gather::<B>::gather(images, device),
            mask: Gather::<B>::gather(masks, device),
            generated: Gather::<B>::gather(generated, device),
            content: Gather::<B>::gather(contents, device),
        }
    }
}

impl<B: Backend> Gather<B> for DiscriminatorOutput<B> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        let mut realness = Vec::with_capacity(parts.len());
        let mut class_logits = Vec::with_capacity(parts.len());
        let mut styles = Vec::with_capacity(parts.len());
        for part in parts {
            realness.push(part.realness);
            class_logits.push(part.class_logits);
            styles.push(part.style);
        }
        DiscriminatorOutput {
            realness: Gather::<B>::gather(realness, device),
            class_logits: Gather::<B>::gather(class_logits, device),
            style: Gather::<B>::gather(styles, device),
        }
    }
}

/// Replicates a module across devices for one forward pass at a time.
#[derive(Debug, Clone)]
pub struct DataParallel<B: Backend> {
    devices: Vec<B::Device>,
}

impl<B: Backend> DataParallel<B> {
    pub fn new(devices: Vec<B::Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(NetworkError::config("data-parallel dispatch needs at least one device"));
        }
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    /// Contiguous shard ranges; never more shards than samples.
    pub fn shard_ranges(&self, batch: usize) -> Vec<Range<usize>> {
        let shards = self.devices.len().min(batch);
        if shards == 0 {
            return Vec::new();
        }
        let chunk = batch.div_ceil(shards);
        (0..batch)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(batch))
            .collect()
    }

    /// Run `forward` on one replica per shard and gather on the first device.
    pub fn run<M, I, O, F>(&self, module: &M, input: I, forward: F) -> Result<O>
    where
        M: Module<B>,
        I: Shard<B>,
        O: Gather<B>,
        F: Fn(&M, I) -> Result<O>,
    {
        let batch = input.batch_size();
        if batch == 0 {
            return Err(NetworkError::ShapeMismatch {
                what: "data-parallel input",
                expected: "a non-empty batch".into(),
                actual: "0 samples".into(),
            });
        }
        let ranges = self.shard_ranges(batch);
        debug!(batch, shards = ranges.len(), "data-parallel forward");
        let mut outputs = Vec::with_capacity(ranges.len());
        for (range, device) in ranges.into_iter().zip(&self.devices) {
            let replica = module.clone().to_device(device);
            outputs.push(forward(&replica, input.shard(range, device))?);
        }
        Ok(O::gather(outputs, &self.devices[0]))
    }

    pub fn generator(
        &self,
        generator: &Generator<B>,
        image: Tensor<B, 4>,
        condition: Tensor<B, 2>,
        style: Option<StyleDescriptor<B>>,
        want_content: bool,
    ) -> Result<GeneratorOutput<B>> {
        self.run(
            generator,
            (image, condition, style),
            |generator, (image, condition, style)| {
                generator.forward(image, condition, style, want_content)
            },
        )
    }

    pub fn discriminator(
        &self,
        pyramid: &DiscriminatorPyramid<B>,
        image: Tensor<B, 4>,
    ) -> Result<DiscriminatorOutput<B>> {
        self.run(pyramid, image, |pyramid, image| pyramid.forward(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn dispatcher(devices: usize) -> DataParallel<TestBackend> {
        DataParallel::new(vec![Default::default(); devices]).unwrap()
    }

    #[test]
    fn ranges_are_contiguous_and_cover_the_batch() {
        assert_eq!(dispatcher(2).shard_ranges(5), vec![0..3, 3..5]);
        assert_eq!(dispatcher(3).shard_ranges(2), vec![0..1, 1..2]);
        assert_eq!(dispatcher(1).shard_ranges(4), vec![0..4]);
    }

    #[test]
    fn no_devices_is_a_configuration_error() {
        assert!(matches!(
            DataParallel::<TestBackend>::new(vec![]),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn lists_gather_per_position() {
        let device = Default::default();
        let part = |value: f32| {
            vec![
                Tensor::<TestBackend, 2>::full([1, 2], value, &device),
                Tensor::<TestBackend, 2>::full([1, 3], value, &device),
            ]
        };
        let gathered = <Vec<Tensor<TestBackend, 2>> as Gather<TestBackend>>::gather(
            vec![part(1.0), part(2.0)],
            &device,
        );
        assert_eq!(gathered[0].dims(), [2, 2]);
        assert_eq!(gathered[1].dims(), [2, 3]);
    }
}
