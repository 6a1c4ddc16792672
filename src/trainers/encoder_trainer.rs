//! Encoder training loop
//!
//! Orchestrates epochs of batch sampling, forward/backward passes, Adam
//! updates, periodic test-set evaluation and per-epoch checkpointing. One
//! logical thread of control; every call below is synchronous and blocking,
//! and the optimizer is the only writer of model parameters.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Var};
use candle_nn::{loss, VarBuilder, VarMap};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;

use crate::data::{self, Batch, DataError, SampleSet};
use crate::models::Encoder;
use crate::trainers::adam::Adam;
use crate::trainers::checkpoint;
use crate::trainers::image_utils;
use crate::trainers::metrics::{
    fractional_epoch, LogSink, MetricLog, MetricPoint, MetricsSink, NullSink,
};
use crate::trainers::step_grads::StepGradients;
use crate::trainers::Config;

const DEFAULT_SEED: u64 = 42;
const DEFAULT_EVAL_EVERY: usize = 20;
const PREVIEW_COLUMNS: usize = 8;

pub struct EncoderTrainer {
    device: Device,
    train_set: SampleSet,
    test_set: SampleSet,

    varmap: VarMap,
    named_params: Vec<(String, Var)>,
    model: Encoder,
    optimizer: Adam,

    batch_size: usize,
    epochs: usize,
    eval_every: usize,
    display: bool,
    preview: bool,

    history: MetricLog,
    sink: Box<dyn MetricsSink>,
    rng: StdRng,
    output_dir: PathBuf,
    title: String,
}

impl std::fmt::Debug for EncoderTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderTrainer")
            .field("batch_size", &self.batch_size)
            .field("epochs", &self.epochs)
            .field("eval_every", &self.eval_every)
            .field("display", &self.display)
            .field("preview", &self.preview)
            .field("output_dir", &self.output_dir)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl EncoderTrainer {
    /// Validates the dataset/config preconditions, splits the dataset and
    /// builds the model and optimizer. All precondition failures surface
    /// here, before any forward pass runs.
    pub fn new(config: &Config, dataset: SampleSet, device: Device) -> Result<Self> {
        let batch_size = config.train.batch_size;
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        let (train_set, test_set) = dataset.split(config.data.split_fraction)?;
        if batch_size > train_set.len() {
            return Err(DataError::BatchExceedsSubset {
                batch: batch_size,
                rows: train_set.len(),
            }
            .into());
        }
        if batch_size > test_set.len() {
            return Err(DataError::BatchExceedsSubset {
                batch: batch_size,
                rows: test_set.len(),
            }
            .into());
        }

        let image_shape = train_set.image_shape()?;
        let latent_size = train_set.latent_size()?;
        let attribute_size = train_set.attribute_size()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Encoder::new(
            image_shape,
            attribute_size,
            config.model.base_filters,
            config.model.conv_layers,
            latent_size,
            vb,
        )?;

        // Stable parameter ordering keeps optimizer updates and checkpoint
        // contents reproducible across runs.
        let mut named_params: Vec<(String, Var)> = {
            let data = varmap.data().lock().unwrap();
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect()
        };
        named_params.sort_by(|a, b| a.0.cmp(&b.0));

        let optimizer = Adam::new(config.train.lr, config.train.beta1);
        let rng = StdRng::seed_from_u64(config.train.seed.unwrap_or(DEFAULT_SEED));

        let display = config.display.as_ref().map(|d| d.enabled).unwrap_or(false);
        let eval_every = config
            .display
            .as_ref()
            .and_then(|d| d.eval_every)
            .unwrap_or(DEFAULT_EVAL_EVERY);
        if eval_every == 0 {
            bail!("display.eval_every must be positive");
        }
        let preview = config
            .display
            .as_ref()
            .and_then(|d| d.preview)
            .unwrap_or(false);

        let sink: Box<dyn MetricsSink> = if display {
            Box::new(LogSink)
        } else {
            Box::new(NullSink)
        };

        Ok(Self {
            device,
            train_set,
            test_set,
            varmap,
            named_params,
            model,
            optimizer,
            batch_size,
            epochs: config.train.epochs,
            eval_every,
            display,
            preview,
            history: MetricLog::new(),
            sink,
            rng,
            output_dir: PathBuf::from(&config.save.output_dir),
            title: config.name.clone().unwrap_or_else(|| "encoder".to_string()),
        })
    }

    /// Replace the metrics sink (e.g. with a live plotting backend).
    pub fn set_sink(&mut self, sink: Box<dyn MetricsSink>) {
        self.sink = sink;
    }

    pub fn history(&self) -> &MetricLog {
        &self.history
    }

    /// Run training for the configured epoch count. Terminates on iteration
    /// count only; numerical failures propagate and halt the loop.
    pub fn train(&mut self) -> Result<()> {
        let steps_per_epoch = data::batches_per_epoch(self.train_set.len(), self.batch_size);
        info!("=== Starting Training ===");
        info!("Epochs: {}", self.epochs);
        info!("Batch size: {}", self.batch_size);
        info!("Learning rate: {}", self.optimizer.learning_rate());
        info!(
            "Dataset: {} train rows, {} test rows, {} batches per epoch",
            self.train_set.len(),
            self.test_set.len(),
            steps_per_epoch
        );
        info!("Device: {:?}", self.device);

        let title = self.title.clone();
        self.sink.configure(&title, &["train", "test"]);

        for epoch in 1..=self.epochs {
            let epoch_timer = Instant::now();
            let permutation = data::epoch_permutation(self.train_set.len(), &mut self.rng);
            let mut last_test_err: Option<f32> = None;

            for (step, window_start) in
                data::batch_windows(self.train_set.len(), self.batch_size).enumerate()
            {
                let step_timer = Instant::now();

                let fetch_timer = Instant::now();
                let batch =
                    data::sample(&self.train_set, &permutation, window_start, self.batch_size)?;
                let data_time = fetch_timer.elapsed();

                let train_err = self.batch_step(&batch)?;
                if !train_err.is_finite() {
                    bail!(
                        "non-finite training loss {train_err} at epoch {epoch} step {}; \
                         training diverged",
                        step + 1
                    );
                }

                if self.display && (step + 1) % self.eval_every == 0 {
                    let (test_err, test_batch) = self.eval_step()?;
                    last_test_err = Some(test_err);
                    let point = MetricPoint {
                        epoch: fractional_epoch(epoch, step + 1, steps_per_epoch),
                        train_err,
                        test_err,
                    };
                    self.history.push(point);
                    self.sink.record(point);
                    if self.preview {
                        self.write_previews(epoch, step + 1, &batch, &test_batch);
                    }
                }

                let test_display = match last_test_err {
                    Some(err) => format!("{err:.6}"),
                    None => "n/a".to_string(),
                };
                info!(
                    "Epoch: [{}][{}/{}] ErrTrain: {:.6} ErrTest: {} Time: {:.3}s DataTime: {:.3}s",
                    epoch,
                    step + 1,
                    steps_per_epoch,
                    train_err,
                    test_display,
                    step_timer.elapsed().as_secs_f32(),
                    data_time.as_secs_f32()
                );
            }

            self.save_checkpoint(epoch, last_test_err)
                .with_context(|| format!("failed to persist checkpoint for epoch {epoch}"))?;
            info!(
                "Epoch {} finished in {:.2}s",
                epoch,
                epoch_timer.elapsed().as_secs_f32()
            );
        }

        info!("=== Training Complete ===");
        Ok(())
    }

    /// One forward/backward/update cycle. Gradients exist only inside this
    /// call: collected zeroed from the backward pass, consumed by the Adam
    /// update, dropped on return.
    fn batch_step(&mut self, batch: &Batch) -> Result<f32> {
        let prediction = self
            .model
            .forward_t(&batch.images, &batch.attributes, true)?;
        let loss = loss::mse(&prediction, &batch.latents)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let grad_store = loss.backward()?;
        let grads = StepGradients::collect(&self.named_params, &grad_store)?;
        self.optimizer.step();
        grads.apply(&mut self.optimizer, &self.named_params)?;

        Ok(loss_value)
    }

    /// Forward-only evaluation on one randomly drawn test batch. No
    /// gradients, no parameter update, running statistics untouched.
    fn eval_step(&mut self) -> Result<(f32, Batch)> {
        let batch = data::sample_eval(&self.test_set, self.batch_size, &mut self.rng)?;
        let prediction = self
            .model
            .forward_t(&batch.images, &batch.attributes, false)?;
        let loss = loss::mse(&prediction, &batch.latents)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        Ok((loss_value, batch))
    }

    /// Best-effort image-grid previews of the current train/test batches.
    fn write_previews(&self, epoch: usize, step: usize, train: &Batch, test: &Batch) {
        let dir = self.output_dir.join("previews");
        for (tag, batch) in [("train", train), ("test", test)] {
            let path = dir.join(format!("epoch-{epoch}-step-{step}-{tag}.png"));
            let result = image_utils::image_grid(&batch.images, PREVIEW_COLUMNS)
                .and_then(|grid| image_utils::save_image(&grid, &path));
            if let Err(err) = result {
                warn!("Preview write failed for {}: {err:#}", path.display());
            }
        }
    }

    /// Persist the epoch checkpoint: model weights, optimizer state and
    /// training state keyed by epoch, plus the whole metric log (last writer
    /// wins). All artifacts are finalized atomically.
    fn save_checkpoint(&self, epoch: usize, last_test_err: Option<f32>) -> Result<()> {
        let dir = self.output_dir.join(format!("checkpoint-epoch-{epoch}"));
        info!("Saving checkpoint to: {}", dir.display());

        checkpoint::save_weights(&self.varmap, &dir.join("encoder.safetensors"))?;
        checkpoint::save_optimizer_state(&self.optimizer, &dir.join("optimizer.safetensors"))?;

        let state = json!({
            "epoch": epoch,
            "optimizer_step": self.optimizer.get_step(),
            "learning_rate": self.optimizer.learning_rate(),
            "beta1": self.optimizer.beta1(),
            "batch_size": self.batch_size,
            "train_rows": self.train_set.len(),
            "test_rows": self.test_set.len(),
            "last_train_err": self.history.last().map(|p| p.train_err),
            "last_test_err": last_test_err,
        });
        checkpoint::save_json(&state, &dir.join("training_state.json"))?;
        checkpoint::save_json(&self.history, &self.output_dir.join("loss_history.json"))?;

        Ok(())
    }
}
