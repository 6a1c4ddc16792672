//! Metric log and metrics sink interface

use log::info;
use serde::{Deserialize, Serialize};

/// One display tick: fractional position within the epoch sweep plus the
/// train/test regression errors measured there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub epoch: f64,
    pub train_err: f32,
    pub test_err: f32,
}

/// Append-only history of metric points, persisted wholesale at every epoch
/// boundary.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetricLog {
    points: Vec<MetricPoint>,
}

impl MetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: MetricPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&MetricPoint> {
        self.points.last()
    }
}

/// Fractional epoch position of a batch step: epoch 2, step 35 of 70 reads
/// as 1.5.
pub fn fractional_epoch(epoch: usize, step: usize, steps_per_epoch: usize) -> f64 {
    (epoch as f64 - 1.0) + step as f64 / steps_per_epoch as f64
}

/// One-way sink the training loop pushes scalar metrics into. The live
/// plotting backend sits behind this seam; the trainer only guarantees the
/// call order: one `configure` up front, then `record` per display tick.
pub trait MetricsSink {
    fn configure(&mut self, title: &str, series: &[&str]);
    fn record(&mut self, point: MetricPoint);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn configure(&mut self, title: &str, series: &[&str]) {
        info!("Metrics: {} ({})", title, series.join(", "));
    }

    fn record(&mut self, point: MetricPoint) {
        info!(
            "Metrics: epoch {:.3} train {:.6} test {:.6}",
            point.epoch, point.train_err, point.test_err
        );
    }
}

/// Sink that drops everything, for headless runs and tests.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn configure(&mut self, _title: &str, _series: &[&str]) {}
    fn record(&mut self, _point: MetricPoint) {}
}
