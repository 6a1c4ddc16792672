//! Dataset container, train/test split and batch sampling
//!
//! The trainer operates on three row-aligned tensor collections: images,
//! latent targets and attribute vectors. Alignment is enforced up front;
//! everything downstream may assume the three modalities stay in lockstep.

pub mod loader;

use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset rows are misaligned: {images} images, {latents} latents, {attributes} attribute vectors")]
    LengthMismatch {
        images: usize,
        latents: usize,
        attributes: usize,
    },
    #[error("dataset needs at least 2 samples, got {0}")]
    TooFewSamples(usize),
    #[error("split fraction must lie strictly between 0 and 1, got {0}")]
    BadSplitFraction(f32),
    #[error("split fraction {fraction} leaves an empty subset ({train} train rows, {test} test rows)")]
    EmptySubset {
        fraction: f32,
        train: usize,
        test: usize,
    },
    #[error("batch size {batch} exceeds subset of {rows} rows")]
    BatchExceedsSubset { batch: usize, rows: usize },
    #[error("batch window [{start}, {start}+{batch}) runs past subset of {rows} rows")]
    WindowOutOfBounds {
        start: usize,
        batch: usize,
        rows: usize,
    },
}

/// Row-aligned collection of images `[N, C, H, W]`, latent targets `[N, Z]`
/// and attribute vectors `[N, Y]`.
#[derive(Debug)]
pub struct SampleSet {
    images: Tensor,
    latents: Tensor,
    attributes: Tensor,
}

/// One transient minibatch, gathered into freshly-copied contiguous tensors.
pub struct Batch {
    pub images: Tensor,
    pub latents: Tensor,
    pub attributes: Tensor,
}

impl SampleSet {
    /// Wraps the three collections, enforcing the alignment precondition.
    pub fn new(images: Tensor, latents: Tensor, attributes: Tensor) -> Result<Self, DataError> {
        let n_images = images.dims().first().copied().unwrap_or(0);
        let n_latents = latents.dims().first().copied().unwrap_or(0);
        let n_attributes = attributes.dims().first().copied().unwrap_or(0);
        if n_images != n_latents || n_images != n_attributes {
            return Err(DataError::LengthMismatch {
                images: n_images,
                latents: n_latents,
                attributes: n_attributes,
            });
        }
        if n_images < 2 {
            return Err(DataError::TooFewSamples(n_images));
        }
        Ok(Self {
            images,
            latents,
            attributes,
        })
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image shape as `(channels, height, width)`.
    pub fn image_shape(&self) -> Result<(usize, usize, usize)> {
        let (_, c, h, w) = self.images.dims4()?;
        Ok((c, h, w))
    }

    pub fn latent_size(&self) -> Result<usize> {
        Ok(self.latents.dims2()?.1)
    }

    pub fn attribute_size(&self) -> Result<usize> {
        Ok(self.attributes.dims2()?.1)
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn latents(&self) -> &Tensor {
        &self.latents
    }

    pub fn attributes(&self) -> &Tensor {
        &self.attributes
    }

    /// Deterministic contiguous split at `k = floor(fraction * N)`.
    ///
    /// Train gets rows `[0, k)`, test gets rows `[k, N)` for all three
    /// modalities. The subsets are narrow views sharing storage with the
    /// original collection; no rows are shuffled here.
    pub fn split(&self, fraction: f32) -> Result<(SampleSet, SampleSet)> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(DataError::BadSplitFraction(fraction).into());
        }
        let n = self.len();
        let k = (fraction * n as f32).floor() as usize;
        if k == 0 || k == n {
            return Err(DataError::EmptySubset {
                fraction,
                train: k,
                test: n - k,
            }
            .into());
        }
        let train = SampleSet {
            images: self.images.narrow(0, 0, k)?,
            latents: self.latents.narrow(0, 0, k)?,
            attributes: self.attributes.narrow(0, 0, k)?,
        };
        let test = SampleSet {
            images: self.images.narrow(0, k, n - k)?,
            latents: self.latents.narrow(0, k, n - k)?,
            attributes: self.attributes.narrow(0, k, n - k)?,
        };
        Ok((train, test))
    }

    /// Gathers the given rows into freshly-copied batch tensors.
    pub fn gather(&self, rows: &[u32]) -> Result<Batch> {
        let index = Tensor::from_vec(rows.to_vec(), rows.len(), self.images.device())?;
        Ok(Batch {
            images: self.images.index_select(&index, 0)?,
            latents: self.latents.index_select(&index, 0)?,
            attributes: self.attributes.index_select(&index, 0)?,
        })
    }
}

/// Uniform random permutation of a subset's row indices, generated once per
/// epoch and reused for every train batch drawn within it.
pub fn epoch_permutation(rows: usize, rng: &mut StdRng) -> Vec<u32> {
    let mut permutation: Vec<u32> = (0..rows as u32).collect();
    permutation.shuffle(rng);
    permutation
}

/// Window offsets for one train sweep: `0, B, 2B, ...` while the full window
/// still fits. The trailing partial batch is dropped by policy, so a subset
/// of `rows` rows yields exactly `rows / batch_size` full batches.
pub fn batch_windows(rows: usize, batch_size: usize) -> impl Iterator<Item = usize> {
    (0..)
        .map(move |i| i * batch_size)
        .take_while(move |start| start + batch_size <= rows)
}

pub fn batches_per_epoch(rows: usize, batch_size: usize) -> usize {
    rows / batch_size
}

/// Materializes the train batch at `window_start` into the epoch permutation.
pub fn sample(
    set: &SampleSet,
    permutation: &[u32],
    window_start: usize,
    batch_size: usize,
) -> Result<Batch> {
    if window_start + batch_size > permutation.len() {
        return Err(DataError::WindowOutOfBounds {
            start: window_start,
            batch: batch_size,
            rows: permutation.len(),
        }
        .into());
    }
    set.gather(&permutation[window_start..window_start + batch_size])
}

/// Draws one evaluation batch from a freshly generated permutation of the
/// subset at a uniformly random window start. Successive evaluation batches
/// may overlap or repeat; the periodic test error is a spot check, not a
/// deterministic sweep.
pub fn sample_eval(set: &SampleSet, batch_size: usize, rng: &mut StdRng) -> Result<Batch> {
    let rows = set.len();
    if batch_size > rows {
        return Err(DataError::BatchExceedsSubset {
            batch: batch_size,
            rows,
        }
        .into());
    }
    let permutation = epoch_permutation(rows, rng);
    let start = rng.gen_range(0..=rows - batch_size);
    set.gather(&permutation[start..start + batch_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::SeedableRng;

    fn sample_set(n: usize) -> SampleSet {
        let device = Device::Cpu;
        let images = Tensor::arange(0f32, (n * 3 * 4 * 4) as f32, &device)
            .unwrap()
            .reshape((n, 3, 4, 4))
            .unwrap();
        let latents = Tensor::arange(0f32, (n * 8) as f32, &device)
            .unwrap()
            .reshape((n, 8))
            .unwrap();
        let attributes = Tensor::arange(0f32, (n * 5) as f32, &device)
            .unwrap()
            .reshape((n, 5))
            .unwrap();
        SampleSet::new(images, latents, attributes).unwrap()
    }

    #[test]
    fn misaligned_rows_are_rejected() {
        let device = Device::Cpu;
        let images = Tensor::zeros((10, 3, 4, 4), DType::F32, &device).unwrap();
        let latents = Tensor::zeros((9, 8), DType::F32, &device).unwrap();
        let attributes = Tensor::zeros((10, 5), DType::F32, &device).unwrap();
        let err = SampleSet::new(images, latents, attributes).unwrap_err();
        assert!(matches!(err, DataError::LengthMismatch { latents: 9, .. }));
    }

    #[test]
    fn split_is_deterministic_and_exact() {
        let set = sample_set(100);
        let (train_a, test_a) = set.split(0.7).unwrap();
        let (train_b, test_b) = set.split(0.7).unwrap();
        assert_eq!(train_a.len(), 70);
        assert_eq!(test_a.len(), 30);
        assert_eq!(train_a.len(), train_b.len());
        assert_eq!(test_a.len(), test_b.len());

        // Same cut index for every modality, rows taken in order.
        let first_test_row = test_a.latents.get(0).unwrap().to_vec1::<f32>().unwrap();
        let original_row_70 = set.latents.get(70).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first_test_row, original_row_70);
        let first_test_row_b = test_b.latents.get(0).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first_test_row, first_test_row_b);
    }

    #[test]
    fn bad_split_fractions_are_rejected() {
        let set = sample_set(10);
        assert!(set.split(0.0).is_err());
        assert!(set.split(1.0).is_err());
        assert!(set.split(-0.3).is_err());
        // 0 < fraction < 1 can still leave a subset empty on tiny datasets.
        let tiny = sample_set(2);
        assert!(tiny.split(0.1).is_err());
    }

    #[test]
    fn window_count_drops_trailing_partial_batch() {
        assert_eq!(batch_windows(70, 10).count(), 7);
        assert_eq!(batch_windows(69, 10).count(), 6);
        assert_eq!(batch_windows(10, 10).count(), 1);
        assert_eq!(batch_windows(9, 10).count(), 0);
        assert_eq!(batches_per_epoch(70, 10), 7);

        let starts: Vec<usize> = batch_windows(25, 10).collect();
        assert_eq!(starts, vec![0, 10]);
    }

    #[test]
    fn sampler_stays_in_bounds_and_copies() {
        let set = sample_set(20);
        let (train, _) = set.split(0.7).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let permutation = epoch_permutation(train.len(), &mut rng);
        assert_eq!(permutation.len(), 14);
        assert!(permutation.iter().all(|&i| (i as usize) < train.len()));

        let batch = sample(&train, &permutation, 0, 4).unwrap();
        assert_eq!(batch.images.dims(), &[4, 3, 4, 4]);
        assert_eq!(batch.latents.dims(), &[4, 8]);
        assert_eq!(batch.attributes.dims(), &[4, 5]);

        // A window that would run past the subset is an error, not a read.
        assert!(sample(&train, &permutation, 12, 4).is_err());
    }

    #[test]
    fn permutation_is_reproducible_given_a_seed() {
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        assert_eq!(epoch_permutation(50, &mut rng_a), epoch_permutation(50, &mut rng_b));
    }

    #[test]
    fn eval_batches_come_from_fresh_permutations() {
        let set = sample_set(20);
        let (_, test) = set.split(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let batch = sample_eval(&test, 4, &mut rng).unwrap();
        assert_eq!(batch.images.dims()[0], 4);
        assert!(sample_eval(&test, 11, &mut rng).is_err());
    }
}
