//! Dataset file loading
//!
//! The training set ships as a single safetensors archive holding three
//! row-aligned tensors: `images` `[N, C, H, W]`, `latents` `[N, Z]` and
//! `attributes` `[N, Y]`. Loading materializes them straight onto the
//! training device.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

use super::SampleSet;

const IMAGES_KEY: &str = "images";
const LATENTS_KEY: &str = "latents";
const ATTRIBUTES_KEY: &str = "attributes";

pub fn load_dataset(path: &Path, device: &Device) -> Result<SampleSet> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
    let images = take_tensor(&mut tensors, IMAGES_KEY, path)?;
    let latents = take_tensor(&mut tensors, LATENTS_KEY, path)?;
    let attributes = take_tensor(&mut tensors, ATTRIBUTES_KEY, path)?;
    let set = SampleSet::new(images, latents, attributes)
        .with_context(|| format!("Dataset file failed validation: {}", path.display()))?;
    Ok(set)
}

pub fn save_dataset(set: &SampleSet, path: &Path) -> Result<()> {
    let tensors = HashMap::from([
        (IMAGES_KEY.to_string(), set.images().clone()),
        (LATENTS_KEY.to_string(), set.latents().clone()),
        (ATTRIBUTES_KEY.to_string(), set.attributes().clone()),
    ]);
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("Failed to write dataset file: {}", path.display()))?;
    Ok(())
}

fn take_tensor(
    tensors: &mut HashMap<String, Tensor>,
    key: &str,
    path: &Path,
) -> Result<Tensor> {
    tensors
        .remove(key)
        .with_context(|| format!("Dataset file {} is missing a `{key}` tensor", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn dataset_round_trips_through_safetensors() {
        let device = Device::Cpu;
        let images = Tensor::rand(0f32, 1f32, (6, 3, 8, 8), &device).unwrap();
        let latents = Tensor::rand(0f32, 1f32, (6, 16), &device).unwrap();
        let attributes = Tensor::rand(0f32, 1f32, (6, 4), &device).unwrap();
        let set = SampleSet::new(images, latents, attributes).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.safetensors");
        save_dataset(&set, &path).unwrap();

        let loaded = load_dataset(&path, &device).unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.image_shape().unwrap(), (3, 8, 8));
        assert_eq!(loaded.latent_size().unwrap(), 16);
        assert_eq!(loaded.attribute_size().unwrap(), 4);
    }

    #[test]
    fn missing_tensor_is_a_named_error() {
        let device = Device::Cpu;
        let tensors = HashMap::from([(
            IMAGES_KEY.to_string(),
            Tensor::zeros((4, 3, 8, 8), DType::F32, &device).unwrap(),
        )]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = load_dataset(&path, &device).unwrap_err();
        assert!(format!("{err:#}").contains("latents"));
    }
}
